use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use weather_pipeline_core::{
    ArchiveWriter, ChangeRelay, CitySummary, Clock, Config, ForecastRecord, FsArchive,
    MemoryStore, ObservationStore, RankedObservation, RetryPolicy, RunContext, StreamBatch,
    SystemClock, Transformer, Warehouse, fetcher_from_config,
    pipeline::{self, IngestOptions},
    warehouse::{FORECAST_TABLE, RANKED_TABLE, SUMMARY_TABLE},
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-pipeline", version, about = "Weather ingestion and ranking pipeline")]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging for the pipeline crate.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Table {
    Ranked,
    Summary,
    Forecast,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Set the provider API key and city list.
    Configure,

    /// Fetch every configured city, upsert the store and archive the resulting changes.
    Ingest,

    /// Archive a batch of stream records read from a JSON file (`{"Records": [...]}`).
    Relay {
        input: PathBuf,
    },

    /// Rebuild the ranked table from the archive.
    Transform {
        /// Also rank the store's current items.
        #[arg(long)]
        include_store: bool,
    },

    /// Rebuild per-city summaries from the ranked table.
    Aggregate,

    /// Rebuild tomorrow's forecast from the summaries.
    Forecast,

    /// Ingest, then transform, aggregate and forecast.
    Run,

    /// Print one of the output tables.
    Show {
        #[arg(value_enum)]
        table: Table,
    },
}

/// Everything one invocation needs, built from config.
struct Pipeline {
    config: Config,
    clock: Arc<dyn Clock>,
    archive: Arc<FsArchive>,
    warehouse: Warehouse,
}

impl Pipeline {
    fn from_config(config: Config) -> Result<Self> {
        let archive = Arc::new(FsArchive::new(config.archive_root()?));
        let warehouse = Warehouse::new(config.warehouse_root()?);
        Ok(Self { config, clock: Arc::new(SystemClock), archive, warehouse })
    }

    fn relay(&self) -> ChangeRelay {
        let retry = RetryPolicy {
            max_attempts: self.config.archive.max_attempts,
            initial_backoff: std::time::Duration::from_millis(self.config.archive.backoff_ms),
        };
        let writer = ArchiveWriter::new(self.archive.clone(), self.config.archive.prefix.clone())
            .with_retry(retry);
        ChangeRelay::new(writer, self.clock.clone())
    }

    async fn load_store(&self) -> Result<MemoryStore> {
        let path = self.config.store_snapshot_path()?;
        MemoryStore::load_snapshot(&path)
            .await
            .with_context(|| format!("Failed to load store snapshot: {}", path.display()))
    }

    async fn ingest(&self) -> Result<()> {
        let ctx = RunContext::new("ingest");
        let fetcher = fetcher_from_config(&self.config, self.clock.clone())?;

        let mut store = self.load_store().await?;
        let mut changes = store.subscribe();
        let store = Arc::new(store);

        let report = pipeline::ingest(
            &ctx,
            fetcher,
            store.clone(),
            &self.config.cities,
            IngestOptions::from(&self.config.fetch),
        )
        .await?;

        let path = self.config.store_snapshot_path()?;
        store
            .save_snapshot(&path)
            .await
            .with_context(|| format!("Failed to save store snapshot: {}", path.display()))?;

        let relayed = self.relay().drain(&ctx, &mut changes).await;
        tracing::info!(archived = relayed.archived, dropped = relayed.dropped, "change capture done");

        println!("{}", report.response().to_json_pretty()?);
        Ok(())
    }

    async fn relay_file(&self, input: &Path) -> Result<()> {
        let contents = tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read stream batch: {}", input.display()))?;
        let batch = StreamBatch::from_json(&contents)
            .with_context(|| format!("Failed to parse stream batch: {}", input.display()))?;

        let report = self.relay().process_batch(&RunContext::new("relay"), batch.records).await;
        println!(
            "Stream records processed: {} archived, {} dropped.",
            report.archived, report.dropped
        );
        Ok(())
    }

    async fn transform(&self, include_store: bool) -> Result<()> {
        let ctx = RunContext::new("transform");
        let transformer = Transformer::new(self.config.cities.clone());
        let store = if include_store { Some(self.load_store().await?) } else { None };

        let report = pipeline::rank(
            &ctx,
            &transformer,
            self.archive.as_ref(),
            &self.config.archive.prefix,
            store.as_ref().map(|s| s as &dyn ObservationStore),
            &self.warehouse,
        )
        .await?;

        println!(
            "Ranked {} observations from {} records ({} rejected, {} outside city list).",
            report.ranked, report.scanned, report.rejected, report.filtered
        );
        Ok(())
    }

    async fn aggregate(&self) -> Result<()> {
        let summaries = pipeline::aggregate(&RunContext::new("aggregate"), &self.warehouse).await?;
        println!("Summarized {} cities.", summaries.len());
        Ok(())
    }

    async fn forecast(&self) -> Result<()> {
        let today = self.clock.today(self.config.forecast.utc_offset_minutes);
        let records = pipeline::forecast(&RunContext::new("forecast"), &self.warehouse, today).await?;
        println!("Forecast written for {} cities.", records.len());
        Ok(())
    }

    async fn show(&self, table: Table) -> Result<()> {
        match table {
            Table::Ranked => {
                let rows: Vec<RankedObservation> = self.warehouse.read(RANKED_TABLE).await?;
                for r in rows {
                    println!(
                        "{:<12} {}  {:>6.2}°C  {:<20} {}",
                        r.city, r.date, r.temperature, r.weather, r.event_timestamp
                    );
                }
            }
            Table::Summary => {
                let rows: Vec<CitySummary> = self.warehouse.read(SUMMARY_TABLE).await?;
                for r in rows {
                    println!("{:<12} {:>6.2}°C  {} records", r.city, r.avg_temperature, r.record_count);
                }
            }
            Table::Forecast => {
                let rows: Vec<ForecastRecord> = self.warehouse.read(FORECAST_TABLE).await?;
                for r in rows {
                    println!(
                        "{:<12} {}  {:>6.2}°C  {}",
                        r.city, r.forecast_date, r.predicted_temperature, r.predicted_weather
                    );
                }
            }
        }
        Ok(())
    }
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
    }

    fn save_config(&self, config: &Config) -> Result<PathBuf> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => Config::config_file_path()?,
        };
        config.save_to(&path)?;
        Ok(path)
    }

    fn configure(&self) -> Result<()> {
        let mut config = self.load_config()?;

        let api_key = inquire::Password::new("OpenWeather API key:")
            .without_confirmation()
            .with_display_mode(inquire::PasswordDisplayMode::Masked)
            .prompt()
            .context("API key prompt aborted")?;
        if !api_key.trim().is_empty() {
            config.set_api_key(api_key.trim().to_string());
        }

        let cities = inquire::Text::new("Cities (comma separated):")
            .with_default(&config.cities.join(", "))
            .prompt()
            .context("City prompt aborted")?;
        config.cities = cities
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        config.validate()?;

        let path = self.save_config(&config)?;
        println!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if let Command::Configure = self.command {
            return self.configure();
        }

        let pipeline = Pipeline::from_config(self.load_config()?)?;

        match &self.command {
            Command::Configure => {}
            Command::Ingest => pipeline.ingest().await?,
            Command::Relay { input } => pipeline.relay_file(input).await?,
            Command::Transform { include_store } => pipeline.transform(*include_store).await?,
            Command::Aggregate => pipeline.aggregate().await?,
            Command::Forecast => pipeline.forecast().await?,
            Command::Run => {
                pipeline.ingest().await?;
                pipeline.transform(false).await?;
                pipeline.aggregate().await?;
                pipeline.forecast().await?;
            }
            Command::Show { table } => pipeline.show(*table).await?,
        }

        Ok(())
    }
}
