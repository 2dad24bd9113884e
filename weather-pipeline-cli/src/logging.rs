use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

/// Install a subscriber for this invocation only; it is removed when the guard drops.
///
/// `RUST_LOG` wins over the verbosity flag.
pub fn scoped(verbose: bool) -> DefaultGuard {
    let fallback = if verbose { "weather_pipeline_core=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_default(subscriber)
}
