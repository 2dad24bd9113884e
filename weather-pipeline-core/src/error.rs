//! Error taxonomy for the pipeline stages.
//!
//! None of these are fatal for a batch on their own: callers log them with the
//! failing city or key and move on. `StoreError::Unavailable` is the exception
//! once every upsert in a batch hits it.

/// Failure fetching one city's observation.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to fetch weather for {city}: {message}")]
    Transient { city: String, message: String },

    #[error("malformed weather response for {city}: {message}")]
    Malformed { city: String, message: String },
}

impl FetchError {
    pub fn city(&self) -> &str {
        match self {
            FetchError::Transient { city, .. } | FetchError::Malformed { city, .. } => city,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("write throttled for key {key}")]
    Throttled { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive object already exists: {0}")]
    AlreadyExists(String),

    #[error("archive object not found: {0}")]
    NotFound(String),

    #[error("archive unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a raw record was excluded from the ranked output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("temperature '{0}' is not numeric")]
    InvalidTemperature(String),

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("invalid event timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("record is neither a change event nor an observation")]
    UnrecognizedShape,
}

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fatal failure of a batch stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}
