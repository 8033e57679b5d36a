//! Activity queue: registration, allocation and completion.
//!
//! The queue itself holds no activity state. Everything lives in the
//! [`ActivityStore`], which performs the select-and-mark step atomically, so
//! any number of queues may share one store instance. Sharing across
//! processes needs a backend that is itself multi-process; neither
//! [`MemoryStore`](crate::storage::MemoryStore) nor
//! [`SledStore`](crate::storage::SledStore) is.

pub mod eligibility;

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::model::{Activity, ActivityId, Allocation, NewActivity, RunningState};
use crate::storage::ActivityStore;

/// Producer and worker facing handle over an activity store
pub struct ActivityQueue {
    store: Arc<dyn ActivityStore>,
    config: QueueConfig,
    counters: QueueCounters,
}

#[derive(Debug, Default)]
struct QueueCounters {
    registered: AtomicU64,
    allocated: AtomicU64,
    finished: AtomicU64,
    purged: AtomicU64,
}

/// Counters for activity handled through this queue instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub registered: u64,
    pub allocated: u64,
    pub finished: u64,
    pub purged: u64,
}

impl ActivityQueue {
    pub fn new(store: Arc<dyn ActivityStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            counters: QueueCounters::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append an activity. Store failures go straight back to the producer.
    pub async fn register(&self, activity: NewActivity) -> Result<ActivityId> {
        let kind = activity.kind;
        let id = self.store.register(activity, Utc::now()).await?;
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        debug!(activity_id = id, ?kind, "Activity registered");
        Ok(id)
    }

    /// Hand out up to `max_batch` activities that are safe to run in parallel.
    ///
    /// `previously_allocated` are ids the caller still believes it holds; the
    /// Done ones come back in `now_finished_ids`. Never blocks: an empty
    /// allocation means nothing is eligible right now.
    pub async fn allocate(
        &self,
        max_batch: usize,
        timeout: Duration,
        previously_allocated: &[ActivityId],
    ) -> Result<Allocation> {
        if max_batch == 0 && previously_allocated.is_empty() {
            return Ok(Allocation::default());
        }
        let allocation = self
            .store
            .allocate(max_batch, timeout, previously_allocated, Utc::now())
            .await?;

        if !allocation.newly_allocated.is_empty() {
            self.counters
                .allocated
                .fetch_add(allocation.newly_allocated.len() as u64, Ordering::Relaxed);
            debug!(
                allocated = ?allocation.allocated_ids(),
                finished = ?allocation.now_finished_ids,
                "Allocated activities"
            );
        }
        Ok(allocation)
    }

    /// [`allocate`](Self::allocate) with the configured batch size and timeout
    pub async fn allocate_next(&self, previously_allocated: &[ActivityId]) -> Result<Allocation> {
        self.allocate(
            self.config.max_batch,
            self.config.activity_timeout,
            previously_allocated,
        )
        .await
    }

    /// Forward-only and idempotent; unknown ids fail with `ActivityNotFound`.
    /// Returns whether the state actually changed.
    pub async fn update_running_state(
        &self,
        id: ActivityId,
        state: RunningState,
    ) -> Result<bool> {
        let changed = self.store.update_running_state(id, state, Utc::now()).await?;
        if changed && state == RunningState::Done {
            self.counters.finished.fetch_add(1, Ordering::Relaxed);
        }
        Ok(changed)
    }

    pub async fn mark_done(&self, id: ActivityId) -> Result<()> {
        self.update_running_state(id, RunningState::Done).await?;
        Ok(())
    }

    /// Keep held activities from being reclaimed by the timeout rule
    pub async fn refresh_lock_time(&self, ids: &[ActivityId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.refresh_lock_time(ids, Utc::now()).await
    }

    /// Purge every Done activity. Dependents only ever look at not-Done rows,
    /// so this is safe at any time.
    pub async fn delete_finished(&self) -> Result<usize> {
        let removed = self.store.delete_finished().await?;
        self.counters.purged.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            info!(removed, "Deleted finished activities");
        }
        Ok(removed)
    }

    /// Drop every activity, whatever its state
    pub async fn delete_all(&self) -> Result<()> {
        warn!("Deleting all activities");
        self.store.delete_all().await
    }

    pub async fn last_id(&self) -> Result<ActivityId> {
        self.store.last_id().await
    }

    pub async fn load_by_id(&self, id: ActivityId, unprocessed: bool) -> Result<Option<Activity>> {
        Ok(self.store.load_by_ids(&[id], unprocessed).await?.pop())
    }

    pub async fn load_range(
        &self,
        from: ActivityId,
        to: ActivityId,
        max_count: usize,
        unprocessed: bool,
    ) -> Result<Vec<Activity>> {
        self.store.load_range(from, to, max_count, unprocessed).await
    }

    /// Load ids this process skipped; they are unprocessed by definition
    pub async fn load_by_id_gaps(&self, gaps: &[ActivityId]) -> Result<Vec<Activity>> {
        if gaps.is_empty() {
            return Ok(Vec::new());
        }
        self.store.load_by_ids(gaps, true).await
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            finished: self.counters.finished.load(Ordering::Relaxed),
            purged: self.counters.purged.load(Ordering::Relaxed),
        }
    }
}
