//! Observation store: the latest observation per (city, date).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    model::{
        ATTR_CITY, ATTR_DATE, ATTR_TEMPERATURE, ATTR_TIMESTAMP, ATTR_WEATHER, AttributeValue,
        ChangeEventType, Item, ObservationKey, WeatherObservation, format_timestamp,
    },
    stream::{StreamChange, StreamRecord},
    transform::parse_timestamp,
};

/// Attribute names that collide with the store's expression keywords and must be
/// addressed through a `#name` alias.
pub const RESERVED_ATTRIBUTES: &[&str] = &[ATTR_TIMESTAMP];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored observation is as new or newer; nothing was written.
    Stale,
}

/// A conditional SET against one key.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub key: ObservationKey,
    /// (attribute reference, value); a reference is a plain name or a `#alias`.
    pub set: Vec<(String, AttributeValue)>,
    pub attribute_names: BTreeMap<String, String>,
    /// Applied only if the stored timestamp is older than this.
    pub newer_than: DateTime<Utc>,
}

impl UpdateRequest {
    pub fn for_observation(observation: &WeatherObservation) -> Self {
        let mut request = Self {
            key: observation.key(),
            set: Vec::new(),
            attribute_names: BTreeMap::new(),
            newer_than: observation.event_timestamp,
        };
        request.push(ATTR_TEMPERATURE, AttributeValue::S(observation.temperature.to_string()));
        request.push(ATTR_WEATHER, AttributeValue::S(observation.weather_description.clone()));
        request.push(ATTR_TIMESTAMP, AttributeValue::S(format_timestamp(observation.event_timestamp)));
        request
    }

    fn push(&mut self, name: &str, value: AttributeValue) {
        let reference = if RESERVED_ATTRIBUTES.contains(&name) {
            let alias = format!("#{name}");
            self.attribute_names.insert(alias.clone(), name.to_string());
            alias
        } else {
            name.to_string()
        };
        self.set.push((reference, value));
    }

    /// Attribute name behind a reference.
    pub fn resolve<'a>(&'a self, reference: &'a str) -> &'a str {
        self.attribute_names.get(reference).map(String::as_str).unwrap_or(reference)
    }

    pub fn expression(&self) -> String {
        let clauses: Vec<String> = self
            .set
            .iter()
            .enumerate()
            .map(|(i, (reference, _))| format!("{reference} = :v{i}"))
            .collect();
        format!("SET {}", clauses.join(", "))
    }
}

#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Write the observation unless the stored one for its key is as new or newer.
    async fn upsert(&self, observation: &WeatherObservation) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, key: &ObservationKey) -> Result<Option<Item>, StoreError>;

    /// Every live item, in key order.
    async fn scan(&self) -> Result<Vec<Item>, StoreError>;

    async fn remove(&self, key: &ObservationKey) -> Result<Option<Item>, StoreError>;
}

fn stored_timestamp(item: &Item) -> Option<DateTime<Utc>> {
    item.string(ATTR_TIMESTAMP).and_then(|raw| parse_timestamp(raw).ok())
}

/// In-process store with an optional change stream and JSON snapshot persistence.
pub struct MemoryStore {
    items: RwLock<BTreeMap<ObservationKey, Item>>,
    changes: Option<mpsc::UnboundedSender<StreamRecord>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { items: RwLock::new(BTreeMap::new()), changes: None, sequence: AtomicU64::new(0) }
    }

    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let mut map = BTreeMap::new();
        for item in items {
            match ObservationKey::from_item(&item) {
                Some(key) => {
                    map.insert(key, item);
                }
                None => warn!(?item, "dropping stored item without a valid city/date key"),
            }
        }
        Self { items: RwLock::new(map), changes: None, sequence: AtomicU64::new(0) }
    }

    /// Attach the change stream. Mutations applied from now on are published to the
    /// returned receiver, in the order they were applied.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.changes = Some(tx);
        rx
    }

    /// Load a snapshot written by `save_snapshot`; a missing file yields an empty store.
    pub async fn load_snapshot(path: &Path) -> Result<Self, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let items: Vec<Item> = serde_json::from_slice(&bytes)?;
                debug!(path = %path.display(), items = items.len(), "loaded store snapshot");
                Ok(Self::with_items(items))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let items = self.scan().await?;
        let body = serde_json::to_vec_pretty(&items)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    fn publish(&self, event_name: ChangeEventType, key: &ObservationKey, new_image: Option<Item>, old_image: Option<Item>) {
        let Some(tx) = &self.changes else {
            return;
        };
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = StreamRecord {
            event_name,
            change: StreamChange {
                keys: Some(
                    Item::new()
                        .with_string(ATTR_CITY, &key.city)
                        .with_string(ATTR_DATE, key.date.to_string()),
                ),
                new_image,
                old_image,
                sequence_number: Some(sequence.to_string()),
            },
        };
        if tx.send(record).is_err() {
            debug!(%key, "change stream receiver dropped; notification discarded");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn upsert(&self, observation: &WeatherObservation) -> Result<UpsertOutcome, StoreError> {
        let request = UpdateRequest::for_observation(observation);
        debug!(key = %request.key, expression = %request.expression(), "conditional upsert");

        // Compare and set under one write lock.
        let mut items = self.items.write().await;
        let existing = items.get(&request.key).cloned();

        if let Some(stored) = existing.as_ref().and_then(stored_timestamp) {
            if stored >= request.newer_than {
                return Ok(UpsertOutcome::Stale);
            }
        }

        let mut updated = existing.clone().unwrap_or_else(|| {
            Item::new()
                .with_string(ATTR_CITY, &request.key.city)
                .with_string(ATTR_DATE, request.key.date.to_string())
        });
        for (reference, value) in &request.set {
            updated.insert(request.resolve(reference), value.clone());
        }
        items.insert(request.key.clone(), updated.clone());

        let (outcome, event_name) = match existing {
            Some(_) => (UpsertOutcome::Updated, ChangeEventType::Modify),
            None => (UpsertOutcome::Inserted, ChangeEventType::Insert),
        };
        self.publish(event_name, &request.key, Some(updated), existing);

        Ok(outcome)
    }

    async fn get(&self, key: &ObservationKey) -> Result<Option<Item>, StoreError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn scan(&self) -> Result<Vec<Item>, StoreError> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn remove(&self, key: &ObservationKey) -> Result<Option<Item>, StoreError> {
        let mut items = self.items.write().await;
        let removed = items.remove(key);
        if let Some(old) = &removed {
            self.publish(ChangeEventType::Remove, key, None, Some(old.clone()));
        }
        drop(items);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn obs(city: &str, temperature: f64, ts: DateTime<Utc>) -> WeatherObservation {
        WeatherObservation::new(city, temperature, "clear sky", ts)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn timestamp_attribute_is_aliased() {
        let request = UpdateRequest::for_observation(&obs("Mumbai", 28.0, t0()));

        assert_eq!(request.expression(), "SET temperature = :v0, weather = :v1, #timestamp = :v2");
        assert_eq!(request.resolve("#timestamp"), "timestamp");
        assert_eq!(request.resolve("weather"), "weather");
    }

    #[tokio::test]
    async fn insert_then_modify_publishes_change_records() {
        let mut store = MemoryStore::new();
        let mut rx = store.subscribe();

        let first = store.upsert(&obs("Mumbai", 28.0, t0())).await.unwrap();
        let second = store.upsert(&obs("Mumbai", 29.5, t0() + Duration::hours(1))).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);

        let insert = rx.recv().await.unwrap();
        assert_eq!(insert.event_name, ChangeEventType::Insert);
        assert!(insert.change.old_image.is_none());

        let modify = rx.recv().await.unwrap();
        assert_eq!(modify.event_name, ChangeEventType::Modify);
        assert_eq!(modify.change.new_image.as_ref().and_then(|i| i.string("temperature")), Some("29.5"));
        assert_eq!(modify.change.old_image.as_ref().and_then(|i| i.string("temperature")), Some("28"));
        assert_eq!(modify.change.sequence_number.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn late_arriving_write_is_rejected() {
        let mut store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.upsert(&obs("Delhi", 21.0, t0() + Duration::hours(2))).await.unwrap();
        let outcome = store.upsert(&obs("Delhi", 18.0, t0())).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);

        let equal = store.upsert(&obs("Delhi", 19.0, t0() + Duration::hours(2))).await.unwrap();
        assert_eq!(equal, UpsertOutcome::Stale);

        let stored = store.get(&ObservationKey::new("Delhi", t0().date_naive())).await.unwrap().unwrap();
        assert_eq!(stored.string("temperature"), Some("21"));

        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err(), "stale writes must not publish");
    }

    #[tokio::test]
    async fn different_days_are_different_keys() {
        let store = MemoryStore::new();
        store.upsert(&obs("Goa", 30.0, t0())).await.unwrap();
        let next_day = store.upsert(&obs("Goa", 31.0, t0() + Duration::days(1))).await.unwrap();

        assert_eq!(next_day, UpsertOutcome::Inserted);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn remove_publishes_old_image() {
        let mut store = MemoryStore::new();
        store.upsert(&obs("Surat", 33.0, t0())).await.unwrap();
        let mut rx = store.subscribe();

        let removed = store.remove(&ObservationKey::new("Surat", t0().date_naive())).await.unwrap();
        assert!(removed.is_some());

        let record = rx.recv().await.unwrap();
        assert_eq!(record.event_name, ChangeEventType::Remove);
        assert!(record.change.new_image.is_none());
        assert_eq!(record.change.old_image.as_ref().and_then(|i| i.string("city")), Some("Surat"));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_keeps_latest_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        store.upsert(&obs("Jaipur", 24.0, t0())).await.unwrap();
        store.save_snapshot(&path).await.unwrap();

        let reloaded = MemoryStore::load_snapshot(&path).await.unwrap();
        assert_eq!(reloaded.len().await, 1);

        let stale = reloaded.upsert(&obs("Jaipur", 10.0, t0() - Duration::minutes(1))).await.unwrap();
        assert_eq!(stale, UpsertOutcome::Stale);

        let empty = MemoryStore::load_snapshot(&dir.path().join("missing.json")).await.unwrap();
        assert!(empty.is_empty().await);
    }

    #[tokio::test]
    async fn naive_stored_timestamp_still_guards_upsert() {
        let legacy = Item::new()
            .with_string(ATTR_CITY, "Pune")
            .with_string(ATTR_DATE, "2025-01-01")
            .with_string(ATTR_TEMPERATURE, "27")
            .with_string(ATTR_TIMESTAMP, "2025-01-01T10:00:00");
        let store = MemoryStore::with_items([legacy]);

        let older = store.upsert(&obs("Pune", 20.0, t0())).await.unwrap();
        assert_eq!(older, UpsertOutcome::Stale);

        let newer = store.upsert(&obs("Pune", 29.0, t0() + Duration::hours(3))).await.unwrap();
        assert_eq!(newer, UpsertOutcome::Updated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stream_order_matches_apply_order_for_one_key() {
        let mut store = MemoryStore::new();
        let mut rx = store.subscribe();
        let store = Arc::new(store);
        let key = ObservationKey::new("Agra", t0().date_naive());

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..200i64 {
            let store = store.clone();
            let key = key.clone();
            tasks.spawn(async move {
                if i % 2 == 0 {
                    store.upsert(&obs("Agra", 20.0, t0() + Duration::seconds(i))).await.unwrap();
                } else {
                    store.remove(&key).await.unwrap();
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        drop(store);

        let mut present = false;
        while let Ok(record) = rx.try_recv() {
            match record.event_name {
                ChangeEventType::Insert => assert!(!present, "INSERT while the key exists"),
                ChangeEventType::Modify | ChangeEventType::Remove => {
                    assert!(present, "{} while the key is absent", record.event_name)
                }
            }
            present = record.event_name != ChangeEventType::Remove;
        }
    }
}
