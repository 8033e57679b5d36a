//! Persistence collaborators for the activity queue and exclusive blocks.
//!
//! Every operation that needs to be atomic across concurrent callers is a
//! single trait method, so each backend decides how to make it atomic. Time is
//! passed in by the caller rather than read inside the store.

pub mod memory;
pub mod sled_storage;

pub use memory::MemoryStore;
pub use sled_storage::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::model::{Activity, ActivityId, Allocation, NewActivity, RunningState};

/// Durable, ordered, auto-incrementing activity records
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Persist a new activity and return its id; ids strictly increase
    async fn register(&self, activity: NewActivity, now: DateTime<Utc>) -> Result<ActivityId>;

    /// Highest id ever assigned (0 when nothing was registered)
    async fn last_id(&self) -> Result<ActivityId>;

    /// Activities with `from <= id <= to`, ascending, at most `max_count`
    async fn load_range(
        &self,
        from: ActivityId,
        to: ActivityId,
        max_count: usize,
        unprocessed: bool,
    ) -> Result<Vec<Activity>>;

    /// Activities for the given ids that still exist, ascending
    async fn load_by_ids(&self, ids: &[ActivityId], unprocessed: bool) -> Result<Vec<Activity>>;

    /// Select and mark Running in one atomic step; see the scheduler docs
    async fn allocate(
        &self,
        max_batch: usize,
        timeout: Duration,
        previously_allocated: &[ActivityId],
        now: DateTime<Utc>,
    ) -> Result<Allocation>;

    /// Forward-only state change; backward requests are ignored. True only
    /// when the stored state moved forward.
    async fn update_running_state(
        &self,
        id: ActivityId,
        state: RunningState,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Bump `lock_time` of Running activities among `ids`
    async fn refresh_lock_time(&self, ids: &[ActivityId], now: DateTime<Utc>) -> Result<()>;

    /// Remove every Done activity, returning how many were removed
    async fn delete_finished(&self) -> Result<usize>;

    /// Maintenance reset: drop every activity (the id sequence keeps counting)
    async fn delete_all(&self) -> Result<()>;
}

/// Durable key to lease mapping with expiration
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomic test-and-set: succeeds when no live lease exists for `key`
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend a live lease held by `holder_id`; false when it is not ours anymore
    async fn renew(
        &self,
        key: &str,
        holder_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease if `holder_id` still owns it; otherwise a no-op
    async fn release(&self, key: &str, holder_id: &str) -> Result<()>;

    async fn is_locked(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Maintenance reset
    async fn release_all(&self) -> Result<()>;
}

/// Collect the finished subset of `previously_allocated`. Ids that vanished
/// were purged, and only Done rows are ever purged.
pub(crate) fn finished_ids<'a>(
    previously_allocated: &[ActivityId],
    lookup: impl Fn(ActivityId) -> Option<&'a Activity>,
) -> Vec<ActivityId> {
    let mut finished: Vec<ActivityId> = previously_allocated
        .iter()
        .copied()
        .filter(|&id| lookup(id).map_or(true, Activity::is_done))
        .collect();
    finished.sort_unstable();
    finished.dedup();
    finished
}
