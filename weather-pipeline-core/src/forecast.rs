//! Per-city aggregates and the next-day threshold forecast.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::model::{CitySummary, ForecastRecord, PredictedWeather, RankedObservation};

/// Mean temperature and row count per city, sorted by city.
pub fn aggregate(ranked: &[RankedObservation]) -> Vec<CitySummary> {
    let mut totals: BTreeMap<&str, (f64, u64)> = BTreeMap::new();
    for row in ranked {
        let entry = totals.entry(row.city.as_str()).or_insert((0.0, 0));
        entry.0 += row.temperature;
        entry.1 += 1;
    }

    totals
        .into_iter()
        .map(|(city, (sum, count))| CitySummary {
            city: city.to_string(),
            avg_temperature: sum / count as f64,
            record_count: count,
        })
        .collect()
}

/// Tomorrow's forecast per city: the average carried forward, classified by threshold.
pub fn forecast(summaries: &[CitySummary], today: NaiveDate) -> Vec<ForecastRecord> {
    let forecast_date = today.succ_opt().unwrap_or(today);

    summaries
        .iter()
        .map(|summary| ForecastRecord {
            city: summary.city.clone(),
            forecast_date,
            predicted_temperature: summary.avg_temperature,
            predicted_weather: PredictedWeather::classify(summary.avg_temperature),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(city: &str, day: u32, temperature: f64) -> RankedObservation {
        RankedObservation {
            city: city.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            temperature,
            weather: "clear sky".to_string(),
            event_timestamp: Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).unwrap(),
        }
    }

    fn summary(city: &str, avg: f64) -> CitySummary {
        CitySummary { city: city.to_string(), avg_temperature: avg, record_count: 1 }
    }

    #[test]
    fn aggregate_mean_and_count() {
        let ranked = vec![row("Delhi", 1, 20.0), row("Mumbai", 1, 33.0), row("Delhi", 2, 30.0)];

        let summaries = aggregate(&ranked);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0], CitySummary { city: "Delhi".into(), avg_temperature: 25.0, record_count: 2 });
        assert_eq!(summaries[1].city, "Mumbai");
        assert_eq!(summaries[1].record_count, 1);
    }

    #[test]
    fn aggregate_of_nothing_is_empty() {
        assert!(aggregate(&[]).is_empty());
    }

    #[test]
    fn forecast_is_for_tomorrow_and_carries_average() {
        let today = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        let records = forecast(&[summary("Goa", 31.5)], today);

        assert_eq!(records[0].forecast_date, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(records[0].predicted_temperature, 31.5);
        assert_eq!(records[0].predicted_weather, PredictedWeather::Hot);
    }

    #[test]
    fn forecast_classification_boundaries() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let summaries = [
            summary("A", 30.0),
            summary("B", 30.01),
            summary("C", 19.99),
            summary("D", 20.0),
        ];

        let labels: Vec<&str> = forecast(&summaries, today)
            .iter()
            .map(|r| r.predicted_weather.as_str())
            .collect();

        assert_eq!(labels, vec!["Moderate", "Hot", "Cold", "Moderate"]);
    }
}
