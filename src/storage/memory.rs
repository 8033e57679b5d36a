use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{finished_ids, ActivityStore, LeaseStore};
use crate::error::{IndexSyncError, Result};
use crate::model::{Activity, ActivityId, Allocation, Lease, NewActivity, RunningState};
use crate::scheduler::eligibility;

/// In-process store. One mutex covers the activity table and the id
/// sequence, which makes allocation atomic across tasks sharing the store.
#[derive(Default)]
pub struct MemoryStore {
    activities: Mutex<ActivityTable>,
    leases: DashMap<String, Lease>,
}

#[derive(Default)]
struct ActivityTable {
    rows: BTreeMap<ActivityId, Activity>,
    last_id: ActivityId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn flagged(activity: &Activity, unprocessed: bool) -> Activity {
    let mut copy = activity.clone();
    copy.is_unprocessed = unprocessed;
    copy
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn register(&self, activity: NewActivity, now: DateTime<Utc>) -> Result<ActivityId> {
        let mut table = self.activities.lock().await;
        table.last_id += 1;
        let id = table.last_id;
        table.rows.insert(id, Activity::from_new(id, activity, now));
        trace!(activity_id = id, "Registered activity");
        Ok(id)
    }

    async fn last_id(&self) -> Result<ActivityId> {
        Ok(self.activities.lock().await.last_id)
    }

    async fn load_range(
        &self,
        from: ActivityId,
        to: ActivityId,
        max_count: usize,
        unprocessed: bool,
    ) -> Result<Vec<Activity>> {
        if from > to {
            return Ok(Vec::new());
        }
        let table = self.activities.lock().await;
        Ok(table
            .rows
            .range(from..=to)
            .take(max_count)
            .map(|(_, a)| flagged(a, unprocessed))
            .collect())
    }

    async fn load_by_ids(&self, ids: &[ActivityId], unprocessed: bool) -> Result<Vec<Activity>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let table = self.activities.lock().await;
        Ok(ids
            .into_iter()
            .filter_map(|id| table.rows.get(&id))
            .map(|a| flagged(a, unprocessed))
            .collect())
    }

    async fn allocate(
        &self,
        max_batch: usize,
        timeout: Duration,
        previously_allocated: &[ActivityId],
        now: DateTime<Utc>,
    ) -> Result<Allocation> {
        let mut table = self.activities.lock().await;

        let now_finished_ids = finished_ids(previously_allocated, |id| table.rows.get(&id));
        let selected = eligibility::select(table.rows.values(), max_batch, timeout, now);

        let mut newly_allocated = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(activity) = table.rows.get_mut(&id) {
                activity.advance(RunningState::Running, now);
                newly_allocated.push(activity.clone());
            }
        }

        Ok(Allocation {
            newly_allocated,
            now_finished_ids,
        })
    }

    async fn update_running_state(
        &self,
        id: ActivityId,
        state: RunningState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut table = self.activities.lock().await;
        let activity = table
            .rows
            .get_mut(&id)
            .ok_or(IndexSyncError::ActivityNotFound { id })?;
        let previous = activity.running_state;
        if !activity.advance(state, now) {
            debug!(
                activity_id = id,
                current = ?activity.running_state,
                requested = ?state,
                "Ignoring backward state change"
            );
        }
        Ok(state > previous)
    }

    async fn refresh_lock_time(&self, ids: &[ActivityId], now: DateTime<Utc>) -> Result<()> {
        let mut table = self.activities.lock().await;
        let mut missing = Vec::new();
        for &id in ids {
            match table.rows.get_mut(&id) {
                Some(activity) if activity.running_state == RunningState::Running => {
                    activity.lock_time = Some(now);
                }
                Some(_) => {}
                None => missing.push(id),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IndexSyncError::ActivitiesNotFound { ids: missing })
        }
    }

    async fn delete_finished(&self) -> Result<usize> {
        let mut table = self.activities.lock().await;
        let before = table.rows.len();
        table.rows.retain(|_, a| !a.is_done());
        Ok(before - table.rows.len())
    }

    async fn delete_all(&self) -> Result<()> {
        self.activities.lock().await.rows.clear();
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let lease = Lease::new(key, holder_id, lease_timeout, now);
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live(now) {
                    return Ok(false);
                }
                debug!(
                    key,
                    stale_holder = %existing.get().holder_id,
                    holder_id,
                    "Taking over expired lease"
                );
                existing.insert(lease);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Ok(true)
            }
        }
    }

    async fn renew(
        &self,
        key: &str,
        holder_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.holder_id == holder_id => {
                *lease = Lease::new(key, holder_id, lease_timeout, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<()> {
        self.leases.remove_if(key, |_, lease| lease.holder_id == holder_id);
        Ok(())
    }

    async fn is_locked(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.leases.get(key).map_or(false, |lease| lease.is_live(now)))
    }

    async fn release_all(&self) -> Result<()> {
        self.leases.clear();
        Ok(())
    }
}
