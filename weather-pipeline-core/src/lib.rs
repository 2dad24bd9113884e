//! Core library for the weather ingestion pipeline.
//!
//! This crate defines:
//! - Configuration handling
//! - The observation fetcher over the weather provider
//! - The observation store with conditional last-write-wins upserts
//! - Change capture and archival of store mutations
//! - Latest-wins ranking, per-city aggregation and the next-day forecast
//!
//! It is used by `weather-pipeline-cli`, but can also be driven by other schedulers.

pub mod archive;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod forecast;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod relay;
pub mod store;
pub mod stream;
pub mod transform;
pub mod warehouse;

pub use archive::{ArchiveKey, ArchiveWriter, FsArchive, MemoryArchive, ObjectArchive, RetryPolicy};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use context::RunContext;
pub use error::{ArchiveError, FetchError, ParseError, PipelineError, StoreError, WarehouseError};
pub use model::{
    ChangeEvent, ChangeEventType, CitySummary, ForecastRecord, Item, ObservationKey,
    PredictedWeather, RankedObservation, WeatherObservation,
};
pub use pipeline::{BatchResponse, IngestOptions, IngestReport};
pub use provider::{ObservationFetcher, fetcher_from_config, openweather::OpenWeatherFetcher};
pub use relay::{ChangeRelay, RelayReport};
pub use store::{MemoryStore, ObservationStore, UpsertOutcome};
pub use stream::{StreamBatch, StreamRecord};
pub use transform::Transformer;
pub use warehouse::Warehouse;
