//! Batch entry points: ingestion and the full-recompute stages.

use chrono::NaiveDate;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{Instrument, error, info, instrument::WithSubscriber, warn};

use crate::{
    archive::ObjectArchive,
    config::FetchSettings,
    context::RunContext,
    error::{FetchError, PipelineError, StoreError},
    forecast as engine,
    model::{CitySummary, ForecastRecord, RankedObservation},
    provider::ObservationFetcher,
    store::{ObservationStore, UpsertOutcome},
    transform::{self, TransformReport, Transformer},
    warehouse::{FORECAST_TABLE, RANKED_TABLE, SUMMARY_TABLE, Warehouse},
};

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        FetchSettings::default().into()
    }
}

impl From<&FetchSettings> for IngestOptions {
    fn from(settings: &FetchSettings) -> Self {
        Self { concurrency: settings.concurrency.max(1), fetch_timeout: settings.timeout() }
    }
}

impl From<FetchSettings> for IngestOptions {
    fn from(settings: FetchSettings) -> Self {
        Self::from(&settings)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CityFailure {
    pub city: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub upserted: Vec<String>,
    /// Cities whose stored observation was already as new.
    pub stale: Vec<String>,
    pub fetch_failures: Vec<CityFailure>,
    pub store_failures: Vec<CityFailure>,
}

/// What the scheduled trigger gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub status_code: u16,
    pub body: String,
}

impl BatchResponse {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl IngestReport {
    pub fn attempted(&self) -> usize {
        self.upserted.len() + self.stale.len() + self.fetch_failures.len() + self.store_failures.len()
    }

    pub fn summary_message(&self) -> String {
        let mut message = format!(
            "Weather data updated for {} of {} cities.",
            self.upserted.len(),
            self.attempted()
        );
        if !self.stale.is_empty() {
            message.push_str(&format!(" {} already up to date.", self.stale.len()));
        }
        if !self.fetch_failures.is_empty() {
            let cities: Vec<&str> = self.fetch_failures.iter().map(|f| f.city.as_str()).collect();
            message.push_str(&format!(" Fetch failed for: {}.", cities.join(", ")));
        }
        if !self.store_failures.is_empty() {
            let cities: Vec<&str> = self.store_failures.iter().map(|f| f.city.as_str()).collect();
            message.push_str(&format!(" Store write failed for: {}.", cities.join(", ")));
        }
        message
    }

    /// Per-city failures never fail the batch.
    pub fn response(&self) -> BatchResponse {
        BatchResponse { status_code: 200, body: self.summary_message() }
    }
}

enum CityOutcome {
    Stored(UpsertOutcome),
    FetchFailed(FetchError),
    StoreFailed(StoreError),
}

async fn ingest_city(
    fetcher: &dyn ObservationFetcher,
    store: &dyn ObservationStore,
    city: &str,
    timeout: Duration,
) -> CityOutcome {
    let observation = match tokio::time::timeout(timeout, fetcher.fetch(city)).await {
        Ok(Ok(observation)) => observation,
        Ok(Err(err)) => {
            warn!(city, error = %err, transient = err.is_transient(), "skipping city after fetch failure");
            return CityOutcome::FetchFailed(err);
        }
        Err(_) => {
            let err = FetchError::Transient {
                city: city.to_string(),
                message: format!("timed out after {}s", timeout.as_secs_f64()),
            };
            warn!(city, error = %err, "skipping city after fetch timeout");
            return CityOutcome::FetchFailed(err);
        }
    };

    let key = observation.key();
    match store.upsert(&observation).await {
        Ok(outcome) => {
            info!(city, %key, temperature = observation.temperature, ?outcome, "upserted observation");
            CityOutcome::Stored(outcome)
        }
        Err(err) => {
            error!(city, %key, error = %err, "failed to upsert observation");
            CityOutcome::StoreFailed(err)
        }
    }
}

/// Fetch every city and upsert what comes back.
///
/// Cities run concurrently up to `options.concurrency`. A failure for one city is
/// recorded in the report and never cancels the others. The batch only fails when
/// every attempted store write found the backend unavailable.
pub async fn ingest(
    ctx: &RunContext,
    fetcher: Arc<dyn ObservationFetcher>,
    store: Arc<dyn ObservationStore>,
    cities: &[String],
    options: IngestOptions,
) -> Result<IngestReport, PipelineError> {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, city) in cities.iter().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let city = city.clone();
        let timeout = options.fetch_timeout;

        tasks.spawn(
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = ingest_city(fetcher.as_ref(), store.as_ref(), &city, timeout).await;
                (index, city, outcome)
            }
            .instrument(ctx.span().clone())
            .with_current_subscriber(),
        );
    }

    let mut outcomes = Vec::with_capacity(cities.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => outcomes.push(result),
            Err(err) => {
                let _entered = ctx.span().enter();
                error!(error = %err, "ingest task aborted");
            }
        }
    }
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut report = IngestReport::default();
    let mut backend_down = 0;
    for (_, city, outcome) in outcomes {
        match outcome {
            CityOutcome::Stored(UpsertOutcome::Stale) => report.stale.push(city),
            CityOutcome::Stored(_) => report.upserted.push(city),
            CityOutcome::FetchFailed(err) => {
                report.fetch_failures.push(CityFailure { city, reason: err.to_string() })
            }
            CityOutcome::StoreFailed(err) => {
                if matches!(err, StoreError::Unavailable(_)) {
                    backend_down += 1;
                }
                report.store_failures.push(CityFailure { city, reason: err.to_string() });
            }
        }
    }

    let _entered = ctx.span().enter();
    let total_outage = backend_down > 0
        && backend_down == report.store_failures.len()
        && report.upserted.is_empty()
        && report.stale.is_empty();
    if total_outage {
        error!(failures = backend_down, "store backend unavailable for every write");
        return Err(StoreError::Unavailable(format!("{backend_down} writes failed")).into());
    }

    info!(
        upserted = report.upserted.len(),
        stale = report.stale.len(),
        fetch_failures = report.fetch_failures.len(),
        store_failures = report.store_failures.len(),
        "ingest batch complete"
    );
    Ok(report)
}

/// Rank the archive (plus the store's current items, if given) and replace the ranked table.
pub async fn rank(
    ctx: &RunContext,
    transformer: &Transformer,
    archive: &dyn ObjectArchive,
    prefix: &str,
    store: Option<&dyn ObservationStore>,
    warehouse: &Warehouse,
) -> Result<TransformReport, PipelineError> {
    let mut records = transform::load_archive(archive, prefix)
        .instrument(ctx.span().clone())
        .await?;
    if let Some(store) = store {
        let items = store.scan().await?;
        records.extend(transform::store_records(&items));
    }

    let output = transformer.rank(ctx, &records);
    warehouse.replace(RANKED_TABLE, &output.rows).await?;
    Ok(output.report)
}

/// Recompute per-city summaries from the ranked table.
pub async fn aggregate(ctx: &RunContext, warehouse: &Warehouse) -> Result<Vec<CitySummary>, PipelineError> {
    let ranked: Vec<RankedObservation> = warehouse.read(RANKED_TABLE).await?;
    let summaries = engine::aggregate(&ranked);
    warehouse.replace(SUMMARY_TABLE, &summaries).await?;

    let _entered = ctx.span().enter();
    info!(rows = ranked.len(), cities = summaries.len(), "aggregated city summaries");
    Ok(summaries)
}

/// Recompute tomorrow's forecast from the summary table.
pub async fn forecast(
    ctx: &RunContext,
    warehouse: &Warehouse,
    today: NaiveDate,
) -> Result<Vec<ForecastRecord>, PipelineError> {
    let summaries: Vec<CitySummary> = warehouse.read(SUMMARY_TABLE).await?;
    let records = engine::forecast(&summaries, today);
    warehouse.replace(FORECAST_TABLE, &records).await?;

    let _entered = ctx.span().enter();
    info!(cities = records.len(), %today, "wrote forecast");
    Ok(records)
}
