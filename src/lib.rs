//! # indexsync: ordered activity scheduling for a shared search index
//!
//! Producers register index-affecting activities (document adds and
//! updates, subtree adds and removals, rebuilds). Workers sharing a store
//! allocate batches that are safe to run in parallel: activities on one
//! resource run in id order, and a pending subtree activity holds back
//! everything queued after it at or below its path. A lease-based
//! [`ExclusiveBlock`] keeps one-at-a-time maintenance work from overlapping
//! among callers of the same lease store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use indexsync::{ActivityKind, IndexSync, IndexSyncConfig, NewActivity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let system = IndexSync::open(IndexSyncConfig::builder().db_path("index.db").build()?)?;
//!
//!     let queue = system.queue();
//!     queue
//!         .register(NewActivity::new(ActivityKind::AddTree, "/root/sites", 42))
//!         .await?;
//!
//!     let allocation = queue.allocate_next(&[]).await?;
//!     for activity in &allocation.newly_allocated {
//!         // apply to the index ...
//!         queue.mark_done(activity.id).await?;
//!     }
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod config;
pub mod error;
pub mod exclusive;
pub mod maintenance;
pub mod model;
pub mod recovery;
pub mod scheduler;
pub mod storage;
pub mod worker;

// Re-exports for convenience
pub use config::{
    ExclusiveBlockConfig, IndexSyncConfig, IndexSyncConfigBuilder, QueueConfig, WorkerConfig,
};
pub use error::{IndexSyncError, Result};
pub use exclusive::{ExclusiveBlock, ExclusiveBlockType, ExclusiveLease};
pub use maintenance::{Maintenance, PURGE_FINISHED_KEY};
pub use model::{
    Activity, ActivityId, ActivityKind, Allocation, Lease, NewActivity, ResourceId, RunningState,
};
pub use recovery::{CompletionState, CompletionTracker, Recovery, RecoveryStats};
pub use scheduler::{ActivityQueue, QueueStats};
pub use storage::{ActivityStore, LeaseStore, MemoryStore, SledStore};
pub use worker::{ActivityExecutor, Worker};

use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Wires a store, the activity queue, exclusive blocks and maintenance
/// together from one configuration
pub struct IndexSync {
    queue: Arc<ActivityQueue>,
    exclusive: ExclusiveBlock,
    maintenance: Maintenance,
    config: IndexSyncConfig,
    sled: Option<Arc<SledStore>>,
}

impl IndexSync {
    /// Open the sled store at `config.db_path`, or an in-memory store when
    /// no path is configured
    pub fn open(config: IndexSyncConfig) -> Result<Self> {
        config.validate()?;
        match config.db_path.clone() {
            Some(path) => {
                let store = Arc::new(SledStore::open(path)?);
                let mut system = Self::with_stores(config, store.clone(), store.clone());
                system.sled = Some(store);
                Ok(system)
            }
            None => {
                info!("No db_path configured, using in-memory store");
                let store = Arc::new(MemoryStore::new());
                Ok(Self::with_stores(config, store.clone(), store))
            }
        }
    }

    /// Build on caller-provided stores
    pub fn with_stores(
        config: IndexSyncConfig,
        activities: Arc<dyn ActivityStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        let queue = Arc::new(ActivityQueue::new(activities, config.queue.clone()));
        let exclusive = ExclusiveBlock::new(leases);
        let maintenance = Maintenance::new(
            Arc::clone(&queue),
            exclusive.clone(),
            config.exclusive.clone(),
        );
        info!(instance_id = %exclusive.instance_id(), "Index sync initialized");
        Self {
            queue,
            exclusive,
            maintenance,
            config,
            sled: None,
        }
    }

    pub fn queue(&self) -> Arc<ActivityQueue> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> &IndexSyncConfig {
        &self.config
    }

    pub fn exclusive_block(&self) -> &ExclusiveBlock {
        &self.exclusive
    }

    pub fn maintenance(&self) -> &Maintenance {
        &self.maintenance
    }

    pub fn worker(&self, executor: Arc<dyn ActivityExecutor>) -> Worker {
        Worker::new(self.queue(), executor, self.config.worker.clone())
    }

    pub fn recovery(&self) -> Recovery {
        Recovery::new(self.queue())
    }

    /// [`ExclusiveBlock::run`] with the configured lease parameters
    pub async fn exclusive<T, F, Fut>(
        &self,
        key: &str,
        operation_id: &str,
        policy: ExclusiveBlockType,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(ExclusiveLease) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.exclusive
            .run(key, operation_id, policy, &self.config.exclusive, action)
            .await
    }

    /// Flush the durable store, if any
    pub async fn flush(&self) -> Result<()> {
        match &self.sled {
            Some(store) => store.flush().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_in_memory() {
        let system = IndexSync::open(IndexSyncConfig::development()).unwrap();
        let id = system
            .queue()
            .register(NewActivity::new(ActivityKind::AddDocument, "/doc", 1))
            .await
            .unwrap();
        assert_eq!(id, 1);
        system.flush().await.unwrap();

        let ran = system
            .exclusive("reindex", "op", ExclusiveBlockType::WaitAndAcquire, |_| async move {
                Ok(id)
            })
            .await
            .unwrap();
        assert_eq!(ran, Some(1));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = IndexSyncConfig::development();
        config.exclusive.lease_timeout = Duration::ZERO;
        assert!(matches!(
            IndexSync::open(config),
            Err(IndexSyncError::InvalidConfiguration(_))
        ));
    }
}
