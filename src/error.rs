use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::ActivityId;

/// Errors raised by the activity queue, its stores and exclusive blocks
#[derive(Error, Debug)]
pub enum IndexSyncError {
    // Storage errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Activity lifecycle errors
    #[error("Activity not found: {id}")]
    ActivityNotFound { id: ActivityId },

    #[error("Activities not found: {ids:?}")]
    ActivitiesNotFound { ids: Vec<ActivityId> },

    // Exclusive block errors
    #[error("Lease timeout on {key} after waiting {waited:?}")]
    LeaseTimeout { key: String, waited: Duration },

    #[error("Exclusive action failed on {key}: {source}")]
    Action {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    // Configuration errors
    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IndexSyncError {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Nothing inside this crate retries on its own; this is guidance for the
    /// caller's retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::Io(_) | Self::LeaseTimeout { .. } => true,

            Self::ActivityNotFound { .. }
            | Self::ActivitiesNotFound { .. }
            | Self::InvalidConfiguration(_)
            | Self::Yaml(_)
            | Self::Serialization(_)
            | Self::Json(_) => false,

            Self::Action { .. } => false,
        }
    }

    /// Get suggested retry delay for this error
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::StoreUnavailable(_) => Some(Duration::from_secs(2)),
            Self::Io(_) => Some(Duration::from_secs(1)),
            Self::LeaseTimeout { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

impl From<sled::Error> for IndexSyncError {
    fn from(err: sled::Error) -> Self {
        IndexSyncError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for IndexSyncError
pub type Result<T> = std::result::Result<T, IndexSyncError>;
