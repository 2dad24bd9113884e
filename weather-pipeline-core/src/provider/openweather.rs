use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{clock::Clock, config::ProviderSettings, error::FetchError, model::WeatherObservation};

use super::ObservationFetcher;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug, Clone)]
pub struct OpenWeatherFetcher {
    api_key: String,
    base_url: String,
    units: String,
    country_code: Option<String>,
    http: Client,
    clock: Arc<dyn Clock>,
}

impl OpenWeatherFetcher {
    pub fn new(api_key: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            units: "metric".to_string(),
            country_code: None,
            http: Client::new(),
            clock,
        }
    }

    pub fn from_settings(
        settings: &ProviderSettings,
        api_key: String,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> reqwest::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            units: settings.units.clone(),
            country_code: settings.country_code.clone(),
            http,
            clock,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_country_code(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }

    fn location_query(&self, city: &str) -> String {
        match self.country_code.as_deref() {
            Some(code) if !code.is_empty() => format!("{city},{code}"),
            _ => city.to_string(),
        }
    }

    async fn fetch_current(&self, city: &str) -> Result<WeatherObservation, FetchError> {
        let url = format!("{}/data/2.5/weather", self.base_url);
        let transient = |message: String| FetchError::Transient { city: city.to_string(), message };
        let malformed = |message: String| FetchError::Malformed { city: city.to_string(), message };

        let res = self
            .http
            .get(&url)
            .query(&[
                ("q", self.location_query(city).as_str()),
                ("appid", self.api_key.as_str()),
                ("units", self.units.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transient(format!("request to OpenWeather failed: {e}")))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| transient(format!("failed to read OpenWeather response body: {e}")))?;

        if !status.is_success() {
            return Err(transient(format!("HTTP {}: {}", status, truncate_body(&body))));
        }

        let parsed: OwCurrentResponse = serde_json::from_str(&body)
            .map_err(|e| malformed(format!("invalid JSON: {e}")))?;

        let temperature = parsed
            .main
            .and_then(|m| m.temp)
            .ok_or_else(|| malformed("missing main.temp".to_string()))?;

        let description = parsed
            .weather
            .into_iter()
            .next()
            .and_then(|w| w.description)
            .ok_or_else(|| malformed("missing weather[0].description".to_string()))?;

        // Keyed by the configured name so the ranked output lines up with the city list;
        // the provider may answer with a different spelling.
        if let Some(name) = parsed.name.as_deref().filter(|n| *n != city) {
            debug!(city, provider_name = name, "provider returned a different city name");
        }

        Ok(WeatherObservation::new(city, temperature, description, self.clock.now()))
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    name: Option<String>,
    main: Option<OwMain>,
    #[serde(default)]
    weather: Vec<OwWeather>,
}

#[async_trait]
impl ObservationFetcher for OpenWeatherFetcher {
    async fn fetch(&self, city: &str) -> Result<WeatherObservation, FetchError> {
        self.fetch_current(city).await
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let cut = (0..=MAX).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn location_query_appends_country_code() {
        let fetcher = OpenWeatherFetcher::new("KEY".into(), Arc::new(SystemClock));
        assert_eq!(fetcher.location_query("Goa"), "Goa");

        let fetcher = fetcher.with_country_code("IN");
        assert_eq!(fetcher.location_query("Goa"), "Goa,IN");
    }

    #[test]
    fn truncate_body_respects_char_boundaries() {
        let body = "°".repeat(150);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 203);
    }
}
