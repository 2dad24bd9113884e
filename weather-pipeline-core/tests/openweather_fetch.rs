//! Integration tests for OpenWeatherFetcher using wiremock.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use weather_pipeline_core::{FetchError, FixedClock, ObservationFetcher, OpenWeatherFetcher};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(server: &MockServer) -> OpenWeatherFetcher {
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()));
    OpenWeatherFetcher::new("TEST_KEY".to_string(), clock)
        .with_base_url(server.uri())
        .with_country_code("IN")
}

#[tokio::test]
async fn maps_current_weather_to_observation() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data/2.5/weather"))
        .and(query_param("q", "Mumbai,IN"))
        .and(query_param("appid", "TEST_KEY"))
        .and(query_param("units", "metric"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "Mumbai",
            "main": {"temp": 29.4, "feels_like": 33.0, "humidity": 70},
            "weather": [{"main": "Haze", "description": "haze"}]
        })))
        .mount(&server)
        .await;

    let observation = fetcher(&server).fetch("Mumbai").await.unwrap();

    assert_eq!(observation.city, "Mumbai");
    assert_eq!(observation.temperature, 29.4);
    assert_eq!(observation.weather_description, "haze");
    assert_eq!(observation.event_timestamp, Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap());
    assert_eq!(observation.date.to_string(), "2025-01-01");
}

#[tokio::test]
async fn keeps_configured_city_when_provider_renames_it() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data/2.5/weather"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "Bangalore",
            "main": {"temp": 22.0},
            "weather": [{"description": "few clouds"}]
        })))
        .mount(&server)
        .await;

    let observation = fetcher(&server).fetch("Bengaluru").await.unwrap();
    assert_eq!(observation.city, "Bengaluru");
}

#[tokio::test]
async fn non_success_status_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data/2.5/weather"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "cod": "404",
            "message": "city not found"
        })))
        .mount(&server)
        .await;

    let err = fetcher(&server).fetch("Nagaland").await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(err.city(), "Nagaland");
    assert!(err.to_string().contains("404"), "Error should mention 404 status: {err}");
}

#[tokio::test]
async fn missing_fields_are_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data/2.5/weather"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "Goa",
            "main": {"temp": 31.0},
            "weather": []
        })))
        .mount(&server)
        .await;

    let err = fetcher(&server).fetch("Goa").await.unwrap_err();

    assert!(matches!(err, FetchError::Malformed { .. }));
    assert!(err.to_string().contains("weather[0].description"));
}

#[tokio::test]
async fn invalid_json_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data/2.5/weather"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = fetcher(&server).fetch("Goa").await.unwrap_err();
    assert!(matches!(err, FetchError::Malformed { .. }));
}

#[tokio::test]
async fn unreachable_provider_is_transient() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let clock = Arc::new(FixedClock::new(Utc::now()));
    let err = OpenWeatherFetcher::new("KEY".into(), clock)
        .with_base_url(uri)
        .fetch("Delhi")
        .await
        .unwrap_err();

    assert!(err.is_transient());
}
