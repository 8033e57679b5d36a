use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ExclusiveBlockConfig;
use crate::error::Result;
use crate::exclusive::{ExclusiveBlock, ExclusiveBlockType};
use crate::scheduler::ActivityQueue;

/// Lease key shared by every process that purges the queue
pub const PURGE_FINISHED_KEY: &str = "activity-queue/purge-finished";

/// Housekeeping that at most one process should run at a time
pub struct Maintenance {
    queue: Arc<ActivityQueue>,
    exclusive: ExclusiveBlock,
    config: ExclusiveBlockConfig,
}

impl Maintenance {
    pub fn new(
        queue: Arc<ActivityQueue>,
        exclusive: ExclusiveBlock,
        config: ExclusiveBlockConfig,
    ) -> Self {
        Self {
            queue,
            exclusive,
            config,
        }
    }

    /// Delete Done activities unless another process is already doing it.
    /// `None` means the purge was skipped.
    pub async fn purge_finished(&self) -> Result<Option<usize>> {
        let queue = Arc::clone(&self.queue);
        let purged = self
            .exclusive
            .run(
                PURGE_FINISHED_KEY,
                "purge-finished",
                ExclusiveBlockType::SkipIfLocked,
                &self.config,
                |_| async move { Ok(queue.delete_finished().await?) },
            )
            .await?;
        if purged.is_none() {
            debug!("Purge already running elsewhere");
        }
        Ok(purged)
    }

    /// Wipe all activities and leases
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting activity queue and leases");
        self.queue.delete_all().await?;
        self.exclusive.release_all().await
    }
}
