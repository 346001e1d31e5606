//! Error types for tabledger operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TabledgerError>;

#[derive(Error, Debug)]
pub enum TabledgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// A row failed required-field or type validation. Recorded as a
    /// rejected row change; never aborts a run on its own.
    #[error("Validation error at source row {row}: {message}")]
    Validation { row: u64, message: String },

    /// A would-be update touched protected fields.
    #[error("Protected field mismatch on {entity}/{pk}: {}", .columns.join(", "))]
    Conflict {
        entity: String,
        pk: String,
        columns: Vec<String>,
    },

    /// Live staging no longer matches the state a change produced.
    #[error("Fingerprint mismatch on {entity}/{pk} while reversing event {event}: expected {expected}, found {found}")]
    FingerprintMismatch {
        event: String,
        entity: String,
        pk: String,
        expected: String,
        found: String,
    },

    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("HEAD moved concurrently: expected {}, found {}", .expected.as_deref().unwrap_or("<none>"), .found.as_deref().unwrap_or("<none>"))]
    HeadContention {
        expected: Option<String>,
        found: Option<String>,
    },

    /// A run failed after its change event was recorded.
    #[error("Run {change_event_id} failed: {source}")]
    RunFailed {
        change_event_id: String,
        #[source]
        source: Box<TabledgerError>,
    },

    #[error("Change event not found: {id}")]
    EventNotFound { id: String },

    #[error("State image not found: {id}")]
    ImageNotFound { id: String },

    #[error("Conflict not found: {id}")]
    ConflictNotFound { id: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Data processing error: {message}")]
    DataProcessing { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl TabledgerError {
    pub fn validation(row: u64, msg: impl Into<String>) -> Self {
        Self::Validation {
            row,
            message: msg.into(),
        }
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity {
            message: msg.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState {
            message: msg.into(),
        }
    }

    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn data_processing(msg: impl Into<String>) -> Self {
        Self::DataProcessing {
            message: msg.into(),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: msg.into(),
        }
    }

    /// True for errors that are worth one more attempt of the whole run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HeadContention { .. })
    }

    /// Unwraps a recorded run failure to the error that caused it.
    pub fn root_cause(&self) -> &TabledgerError {
        match self {
            Self::RunFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
