use crate::{
    Config, WeatherObservation,
    clock::Clock,
    error::FetchError,
    provider::openweather::OpenWeatherFetcher,
};
use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};

pub mod openweather;

/// Retrieves the current observation for a single city.
///
/// Implementations never panic on provider trouble: every failure comes back
/// as a `FetchError` tagged with the city so the batch can skip it.
#[async_trait]
pub trait ObservationFetcher: Send + Sync + Debug {
    async fn fetch(&self, city: &str) -> Result<WeatherObservation, FetchError>;
}

/// Construct the HTTP fetcher from config.
pub fn fetcher_from_config(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn ObservationFetcher>> {
    let api_key = config.api_key().ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured for the weather provider.\n\
                 Hint: run `weather-pipeline configure` or set OPENWEATHER_API_KEY."
        )
    })?;

    let fetcher =
        OpenWeatherFetcher::from_settings(&config.provider, api_key, config.fetch.timeout(), clock)?;

    Ok(Arc::new(fetcher))
}
