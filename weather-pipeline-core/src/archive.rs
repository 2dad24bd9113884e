//! Durable, write-once archive of change events.

use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{io::AsyncWriteExt, sync::RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::ArchiveError,
    model::{ChangeEvent, format_timestamp},
};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Slash-separated object key, e.g. `weather_data/INSERT/Goa/<emitted_at>-<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-only blob store. `put` never overwrites an existing key.
#[async_trait]
pub trait ObjectArchive: Send + Sync + Debug {
    async fn put(&self, key: &ArchiveKey, body: Vec<u8>, content_type: &str) -> Result<(), ArchiveError>;

    async fn get(&self, key: &ArchiveKey) -> Result<Vec<u8>, ArchiveError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<ArchiveKey>, ArchiveError>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
}

#[derive(Debug, Default)]
pub struct MemoryArchive {
    objects: RwLock<BTreeMap<ArchiveKey, StoredObject>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn content_type(&self, key: &ArchiveKey) -> Option<String> {
        self.objects.read().await.get(key).map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectArchive for MemoryArchive {
    async fn put(&self, key: &ArchiveKey, body: Vec<u8>, content_type: &str) -> Result<(), ArchiveError> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(ArchiveError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.clone(), StoredObject { body, content_type: content_type.to_string() });
        Ok(())
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Vec<u8>, ArchiveError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| ArchiveError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArchiveKey>, ArchiveError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| under_prefix(k.as_str(), prefix))
            .cloned()
            .collect())
    }
}

/// Archive rooted in a local directory; each key maps to a file path under `root`.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArchiveKey) -> PathBuf {
        key.as_str().split('/').fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl ObjectArchive for FsArchive {
    async fn put(&self, key: &ArchiveKey, body: Vec<u8>, content_type: &str) -> Result<(), ArchiveError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Stage the body next to the key, then link it into place. A failed
        // write never occupies the key, so a retry can reuse it.
        let staging = staging_path(&path);
        if let Err(err) = write_staged(&staging, &body).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        let linked = tokio::fs::hard_link(&staging, &path).await;
        let _ = tokio::fs::remove_file(&staging).await;

        match linked {
            Ok(()) => {
                debug!(%key, content_type, bytes = body.len(), "archived object");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ArchiveError::AlreadyExists(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Vec<u8>, ArchiveError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArchiveKey>, ArchiveError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() { name } else { format!("{rel}/{name}") };

                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if !is_staging(&entry.file_name().to_string_lossy()) && under_prefix(&key, prefix) {
                    keys.push(ArchiveKey(key));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Bounded retry for archive writes. One attempt is plain fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, initial_backoff: Duration::from_millis(200) }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (1-based `attempt`), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Serializes change events and writes each one under a unique key.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    archive: Arc<dyn ObjectArchive>,
    prefix: String,
    retry: RetryPolicy,
}

impl ArchiveWriter {
    pub fn new(archive: Arc<dyn ObjectArchive>, prefix: impl Into<String>) -> Self {
        Self { archive, prefix: prefix.into().trim_matches('/').to_string(), retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}/{EVENT}/{city}/{emitted_at}-{id}.json`. The random id keeps keys unique
    /// when two events share an emission instant.
    pub fn object_key(&self, event: &ChangeEvent) -> ArchiveKey {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}/{}/{}-{}.json",
            event.event_type,
            key_segment(&event.city),
            format_timestamp(event.emitted_at),
            &id[..8]
        );
        if self.prefix.is_empty() {
            ArchiveKey(name)
        } else {
            ArchiveKey(format!("{}/{}", self.prefix, name))
        }
    }

    pub async fn store(&self, event: &ChangeEvent) -> Result<ArchiveKey, ArchiveError> {
        let body = serde_json::to_vec(event)?;
        let key = self.object_key(event);
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.archive.put(&key, body.clone(), CONTENT_TYPE_JSON).await {
                Ok(()) => return Ok(key),
                Err(err @ ArchiveError::AlreadyExists(_)) => return Err(err),
                Err(err) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(%key, attempt, ?delay, error = %err, "archive write failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// `prefix` names a directory: `weather_data` matches `weather_data/...` but not
/// `weather_data_old/...`. An empty prefix matches everything.
fn under_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    key.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn is_staging(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(".tmp")
}

async fn write_staged(staging: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(staging)
        .await?;
    file.write_all(body).await?;
    file.sync_all().await
}

/// Cities become a single path segment.
fn key_segment(city: &str) -> String {
    let cleaned: String = city.chars().map(|c| if c == '/' || c == '\\' { '_' } else { c }).collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}
