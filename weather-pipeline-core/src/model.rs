use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// City recorded on a change event when neither store image names one.
pub const UNKNOWN_CITY: &str = "Unknown City";

pub const ATTR_CITY: &str = "city";
pub const ATTR_DATE: &str = "date";
pub const ATTR_TEMPERATURE: &str = "temperature";
pub const ATTR_WEATHER: &str = "weather";
pub const ATTR_TIMESTAMP: &str = "timestamp";

/// A point-in-time reading for one city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub city: String,
    pub date: NaiveDate,
    pub temperature: f64,
    pub weather_description: String,
    pub event_timestamp: DateTime<Utc>,
}

impl WeatherObservation {
    /// Build an observation, deriving `date` from the UTC day of `event_timestamp`.
    pub fn new(
        city: impl Into<String>,
        temperature: f64,
        weather_description: impl Into<String>,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            city: city.into(),
            date: event_timestamp.date_naive(),
            temperature,
            weather_description: weather_description.into(),
            event_timestamp,
        }
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey { city: self.city.clone(), date: self.date }
    }

    /// Typed-attribute image of this observation as the store keeps it.
    pub fn to_item(&self) -> Item {
        Item::new()
            .with_string(ATTR_CITY, &self.city)
            .with_string(ATTR_DATE, self.date.to_string())
            .with_string(ATTR_TEMPERATURE, self.temperature.to_string())
            .with_string(ATTR_WEATHER, &self.weather_description)
            .with_string(ATTR_TIMESTAMP, format_timestamp(self.event_timestamp))
    }
}

/// Store key: one live observation per (city, date).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationKey {
    pub city: String,
    pub date: NaiveDate,
}

impl ObservationKey {
    pub fn new(city: impl Into<String>, date: NaiveDate) -> Self {
        Self { city: city.into(), date }
    }

    /// Recover the key from a stored item, if both key attributes are present and valid.
    pub fn from_item(item: &Item) -> Option<Self> {
        let city = item.string(ATTR_CITY)?;
        let date = item.string(ATTR_DATE)?.parse().ok()?;
        Some(Self::new(city, date))
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.city, self.date)
    }
}

/// A single typed attribute, serialized as `{"S": "..."}` or `{"N": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeValue::S(s) | AttributeValue::N(s) => s,
        }
    }
}

/// Loosely-typed attribute map: a store image as carried on the change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(BTreeMap<String, AttributeValue>);

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, AttributeValue::S(value.into()));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.0.get(name)
    }

    /// Text of an attribute regardless of its type tag. `None` when absent or blank.
    pub fn string(&self, name: &str) -> Option<&str> {
        self.get(name).map(AttributeValue::as_str).filter(|s| !s.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }
}

/// Resolve the city of a mutation from its images: after-image first, then before-image.
pub fn city_from_images(new_image: Option<&Item>, old_image: Option<&Item>) -> String {
    new_image
        .and_then(|item| item.string(ATTR_CITY))
        .or_else(|| old_image.and_then(|item| item.string(ATTR_CITY)))
        .unwrap_or(UNKNOWN_CITY)
        .to_string()
}

/// Timestamps are kept as RFC 3339 UTC with nanosecond precision.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Modify,
    Remove,
}

impl ChangeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventType::Insert => "INSERT",
            ChangeEventType::Modify => "MODIFY",
            ChangeEventType::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one observed store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeEvent {
    #[serde(rename = "EventName")]
    pub event_type: ChangeEventType,
    #[serde(rename = "Timestamp")]
    pub emitted_at: DateTime<Utc>,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_item: Option<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_item: Option<Item>,
}

impl ChangeEvent {
    /// Build an event keeping only the images its type carries:
    /// INSERT has the new image, REMOVE the old one, MODIFY both.
    pub fn from_images(
        event_type: ChangeEventType,
        emitted_at: DateTime<Utc>,
        new_image: Option<Item>,
        old_image: Option<Item>,
    ) -> Self {
        let (new_item, old_item) = match event_type {
            ChangeEventType::Insert => (new_image, None),
            ChangeEventType::Modify => (new_image, old_image),
            ChangeEventType::Remove => (None, old_image),
        };
        let city = city_from_images(new_item.as_ref(), old_item.as_ref());

        Self { event_type, emitted_at, city, new_item, old_item }
    }
}

/// One deduplicated row per (city, date): the latest observation seen for that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedObservation {
    pub city: String,
    pub date: NaiveDate,
    pub temperature: f64,
    pub weather: String,
    pub event_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitySummary {
    pub city: String,
    pub avg_temperature: f64,
    pub record_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictedWeather {
    Hot,
    Moderate,
    Cold,
}

impl PredictedWeather {
    /// `> 30` is Hot, `20..=30` Moderate, anything else Cold.
    pub fn classify(temperature: f64) -> Self {
        if temperature > 30.0 {
            PredictedWeather::Hot
        } else if temperature >= 20.0 {
            PredictedWeather::Moderate
        } else {
            PredictedWeather::Cold
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictedWeather::Hot => "Hot",
            PredictedWeather::Moderate => "Moderate",
            PredictedWeather::Cold => "Cold",
        }
    }
}

impl fmt::Display for PredictedWeather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub city: String,
    pub forecast_date: NaiveDate,
    pub predicted_temperature: f64,
    pub predicted_weather: PredictedWeather,
}
