//! Rank & dedup: one observation per (city, date), latest event timestamp wins.
//!
//! Every run is a full recompute over the raw records it is given. Records are
//! JSON values in one of two shapes:
//!
//! - an archived change event, read from its `NewItem` image
//!   (`{"EventName": "MODIFY", "NewItem": {"city": {"S": "Goa"}, ...}}`);
//! - a flat observation, either typed (a store item) or plain
//!   (`{"city": "Goa", "temperature": "31°C", ...}`).

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::{
    archive::ObjectArchive,
    context::RunContext,
    error::{ArchiveError, ParseError},
    model::{ATTR_CITY, ATTR_DATE, ATTR_TEMPERATURE, ATTR_TIMESTAMP, ATTR_WEATHER, Item, RankedObservation},
};

const UNIT_SUFFIXES: &[&str] = &["°C", "℃", "C"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub scanned: usize,
    /// Rows dropped by a parse error.
    pub rejected: usize,
    /// Rows for cities outside the configured set.
    pub filtered: usize,
    /// Change events without an after-image (REMOVE).
    pub skipped: usize,
    pub ranked: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankOutput {
    pub rows: Vec<RankedObservation>,
    pub report: TransformReport,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    cities: BTreeSet<String>,
}

impl Transformer {
    pub fn new<I, S>(cities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { cities: cities.into_iter().map(Into::into).collect() }
    }

    /// Rank `records`, given in ingestion order.
    ///
    /// Within a (city, date) partition the greatest `event_timestamp` wins; on a tie the
    /// earliest ingested record is kept. Output is sorted by (city, date).
    pub fn rank(&self, ctx: &RunContext, records: &[Value]) -> RankOutput {
        let _entered = ctx.span().enter();
        let mut report = TransformReport { scanned: records.len(), ..TransformReport::default() };
        let mut partitions: BTreeMap<(String, NaiveDate), RankedObservation> = BTreeMap::new();

        for (position, record) in records.iter().enumerate() {
            let row = match flatten(record) {
                Ok(Some(row)) => row,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(position, error = %err, "excluding record from ranked output");
                    report.rejected += 1;
                    continue;
                }
            };

            if !self.cities.contains(&row.city) {
                debug!(city = %row.city, "excluding record for unconfigured city");
                report.filtered += 1;
                continue;
            }

            let key = (row.city.clone(), row.date);
            match partitions.get(&key) {
                Some(current) if current.event_timestamp >= row.event_timestamp => {}
                _ => {
                    partitions.insert(key, row);
                }
            }
        }

        let rows: Vec<RankedObservation> = partitions.into_values().collect();
        report.ranked = rows.len();
        info!(?report, "ranked observations");

        RankOutput { rows, report }
    }
}

/// Read every archived object under `prefix`, in key order.
///
/// Objects that are not valid JSON are logged and skipped; a failing listing or
/// read aborts the load.
pub async fn load_archive(archive: &dyn ObjectArchive, prefix: &str) -> Result<Vec<Value>, ArchiveError> {
    let keys = archive.list(prefix).await?;
    let mut records = Vec::with_capacity(keys.len());

    for key in keys {
        let body = archive.get(&key).await?;
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => records.push(value),
            Err(err) => warn!(%key, error = %err, "skipping archived object that is not JSON"),
        }
    }

    Ok(records)
}

/// Store items as raw records, for ranking alongside the archive.
pub fn store_records(items: &[Item]) -> Vec<Value> {
    items
        .iter()
        .filter_map(|item| match serde_json::to_value(item) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "skipping store item that failed to serialize");
                None
            }
        })
        .collect()
}

/// Extract the observation fields from one raw record.
///
/// `Ok(None)` means the record carries no observation (a change event with no
/// after-image).
pub fn flatten(record: &Value) -> Result<Option<RankedObservation>, ParseError> {
    let object = record.as_object().ok_or(ParseError::UnrecognizedShape)?;

    let source = if object.contains_key("EventName") || object.contains_key("NewItem") {
        match object.get("NewItem").and_then(Value::as_object) {
            Some(image) => image,
            None => return Ok(None),
        }
    } else if object.contains_key(ATTR_CITY) {
        object
    } else {
        return Err(ParseError::UnrecognizedShape);
    };

    let city = required(source, ATTR_CITY)?;
    let date_raw = required(source, ATTR_DATE)?;
    let temperature_raw = required(source, ATTR_TEMPERATURE)?;
    let weather = required(source, ATTR_WEATHER)?;
    let timestamp_raw = attribute(source, "event_timestamp")
        .or_else(|| attribute(source, ATTR_TIMESTAMP))
        .ok_or(ParseError::MissingField(ATTR_TIMESTAMP))?;

    let date = NaiveDate::parse_from_str(date_raw.trim(), "%Y-%m-%d")
        .map_err(|_| ParseError::InvalidDate(date_raw.clone()))?;

    Ok(Some(RankedObservation {
        city,
        date,
        temperature: normalize_temperature(&temperature_raw)?,
        weather,
        event_timestamp: parse_timestamp(&timestamp_raw)?,
    }))
}

fn required(source: &Map<String, Value>, name: &'static str) -> Result<String, ParseError> {
    attribute(source, name).ok_or(ParseError::MissingField(name))
}

/// Text of a field that may be plain (`"x"`, `1.5`) or typed (`{"S": "x"}`, `{"N": "1.5"}`).
fn attribute(source: &Map<String, Value>, name: &str) -> Option<String> {
    text(source.get(name)?).filter(|s| !s.trim().is_empty())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(typed) => typed.get("S").or_else(|| typed.get("N")).and_then(text),
        _ => None,
    }
}

/// Parse a temperature after stripping a trailing unit such as `°C`.
pub fn normalize_temperature(raw: &str) -> Result<f64, ParseError> {
    let trimmed = raw.trim();
    let numeric = UNIT_SUFFIXES
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed)
        .trim();

    numeric
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| ParseError::InvalidTemperature(raw.to_string()))
}

/// RFC 3339, or a naive ISO 8601 timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ParseError::InvalidTimestamp(raw.to_string()))
}
