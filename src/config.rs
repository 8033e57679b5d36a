use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IndexSyncError, Result};

/// Activity queue tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of activities handed out by one allocation
    pub max_batch: usize,
    /// Age after which a Running activity's lock is considered abandoned
    #[serde(with = "duration_ms")]
    pub activity_timeout: Duration,
    /// Page size used when loading ranges during reconciliation
    pub load_page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch: 100,
            activity_timeout: Duration::from_secs(120),
            load_page_size: 1_000,
        }
    }
}

/// Worker loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between allocations when the queue had nothing eligible
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How often held activities get their lock time bumped while executing
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(IndexSyncError::config("worker poll_interval must be greater than 0"));
        }
        if self.refresh_interval.is_zero() {
            return Err(IndexSyncError::config("refresh_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Lease parameters for an exclusive block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusiveBlockConfig {
    /// Lifetime of an acquired lease; a holder older than this can be displaced
    #[serde(with = "duration_ms")]
    pub lease_timeout: Duration,
    /// Sleep between lease checks while waiting
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Upper bound on how long a waiting policy blocks
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
}

impl Default for ExclusiveBlockConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(600),
        }
    }
}

impl ExclusiveBlockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_timeout.is_zero() {
            return Err(IndexSyncError::config("lease_timeout must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(IndexSyncError::config("poll_interval must be greater than 0"));
        }
        if self.wait_timeout < self.poll_interval {
            return Err(IndexSyncError::config(
                "wait_timeout cannot be shorter than poll_interval",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSyncConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub exclusive: ExclusiveBlockConfig,
    /// Database path for the sled store; `None` keeps everything in memory
    pub db_path: Option<PathBuf>,
}

impl IndexSyncConfig {
    /// Create a new builder for IndexSyncConfig
    pub fn builder() -> IndexSyncConfigBuilder {
        IndexSyncConfigBuilder::new()
    }

    /// Parse a YAML document; missing sections fall back to defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_batch == 0 {
            return Err(IndexSyncError::config("max_batch must be greater than 0"));
        }
        if self.queue.load_page_size == 0 {
            return Err(IndexSyncError::config("load_page_size must be greater than 0"));
        }
        self.worker.validate()?;
        // A refresh has to land before the lock is reclaimed by another worker.
        if self.worker.refresh_interval >= self.queue.activity_timeout {
            return Err(IndexSyncError::config(
                "refresh_interval must be shorter than activity_timeout",
            ));
        }
        self.exclusive.validate()
    }

    /// Short intervals for development and tests
    pub fn development() -> Self {
        Self {
            queue: QueueConfig {
                max_batch: 10,
                activity_timeout: Duration::from_secs(10),
                load_page_size: 100,
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(50),
                refresh_interval: Duration::from_secs(2),
            },
            exclusive: ExclusiveBlockConfig {
                lease_timeout: Duration::from_secs(10),
                poll_interval: Duration::from_millis(50),
                wait_timeout: Duration::from_secs(30),
            },
            db_path: None,
        }
    }

    /// Larger batches for production deployments
    pub fn production() -> Self {
        Self {
            queue: QueueConfig {
                max_batch: 500,
                activity_timeout: Duration::from_secs(300),
                load_page_size: 5_000,
            },
            ..Default::default()
        }
    }
}

/// Builder for IndexSyncConfig
pub struct IndexSyncConfigBuilder {
    config: IndexSyncConfig,
}

impl IndexSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexSyncConfig::default(),
        }
    }

    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.config.queue.max_batch = max_batch;
        self
    }

    pub fn activity_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue.activity_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.worker.poll_interval = interval;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.worker.refresh_interval = interval;
        self
    }

    pub fn exclusive(mut self, exclusive: ExclusiveBlockConfig) -> Self {
        self.config.exclusive = exclusive;
        self
    }

    /// Set database path
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<IndexSyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for IndexSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Durations travel as integer milliseconds in config files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
