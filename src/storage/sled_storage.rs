//! Durable store backed by sled.
//!
//! Activities live in the `activities` tree keyed by big-endian id so that
//! iteration order is id order. The id sequence is a counter in the `meta`
//! tree, bumped in the same transaction that inserts the row, which keeps ids
//! gapless and owned by the store rather than by any process.
//!
//! sled transactions cannot scan, so read-modify-write operations on the
//! activity table are serialized by `write_lock` and committed with an atomic
//! `Batch`. Leases use `compare_and_swap` directly.
//!
//! The store is single-process: sled holds an exclusive lock on the database
//! directory and `write_lock` only serializes writers inside this process.
//! Share one `Arc<SledStore>` between the queues and exclusive blocks of a
//! process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, Db, IVec, Transactional, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::{finished_ids, ActivityStore, LeaseStore};
use crate::error::{IndexSyncError, Result};
use crate::model::{Activity, ActivityId, Allocation, Lease, NewActivity, RunningState};
use crate::scheduler::eligibility;

const ACTIVITIES_TREE: &str = "activities";
const LEASES_TREE: &str = "leases";
const META_TREE: &str = "meta";
const LAST_ID_KEY: &[u8] = b"last_activity_id";

/// Single-process durable store; see the module docs
pub struct SledStore {
    db: Db,
    activities: Tree,
    leases: Tree,
    meta: Tree,
    write_lock: Mutex<()>,
}

fn id_key(id: ActivityId) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_id(bytes: &[u8]) -> ActivityId {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[8 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    ActivityId::from_be_bytes(buf)
}

fn decode_activity(bytes: &[u8], unprocessed: bool) -> Result<Activity> {
    let mut activity: Activity = bincode::deserialize(bytes)?;
    activity.is_unprocessed = unprocessed;
    Ok(activity)
}

fn decode_lease(bytes: &[u8]) -> Result<Lease> {
    Ok(bincode::deserialize(bytes)?)
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        info!("Opening sled store at {:?}", path.as_ref());
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway store removed on drop; used by tests
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            activities: db.open_tree(ACTIVITIES_TREE)?,
            leases: db.open_tree(LEASES_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn get_activity(&self, id: ActivityId) -> Result<Option<Activity>> {
        match self.activities.get(id_key(id))? {
            Some(bytes) => Ok(Some(decode_activity(&bytes, false)?)),
            None => Ok(None),
        }
    }

    fn put_activity(&self, activity: &Activity) -> Result<()> {
        self.activities
            .insert(id_key(activity.id), bincode::serialize(activity)?)?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<Activity>> {
        self.activities
            .iter()
            .values()
            .map(|value| decode_activity(&value?, false))
            .collect()
    }
}

#[async_trait]
impl ActivityStore for SledStore {
    async fn register(&self, activity: NewActivity, now: DateTime<Utc>) -> Result<ActivityId> {
        let id = (&self.activities, &self.meta)
            .transaction(|(activities, meta)| {
                let last = meta
                    .get(LAST_ID_KEY)?
                    .map(|bytes| decode_id(&bytes))
                    .unwrap_or(0);
                let id = last + 1;
                let record = Activity::from_new(id, activity.clone(), now);
                let bytes =
                    bincode::serialize(&record).map_err(ConflictableTransactionError::Abort)?;
                activities.insert(id_key(id).to_vec(), bytes)?;
                meta.insert(LAST_ID_KEY, id_key(id).to_vec())?;
                Ok(id)
            })
            .map_err(|e: TransactionError<bincode::Error>| match e {
                TransactionError::Abort(e) => IndexSyncError::Serialization(e),
                TransactionError::Storage(e) => IndexSyncError::from(e),
            })?;
        trace!(activity_id = id, "Registered activity");
        Ok(id)
    }

    async fn last_id(&self) -> Result<ActivityId> {
        Ok(self
            .meta
            .get(LAST_ID_KEY)?
            .map(|bytes| decode_id(&bytes))
            .unwrap_or(0))
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
        self.activities
            .range(id_key(from)..=id_key(to))
            .values()
            .take(max_count)
            .map(|value| decode_activity(&value?, unprocessed))
            .collect()
    }

    async fn load_by_ids(&self, ids: &[ActivityId], unprocessed: bool) -> Result<Vec<Activity>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut loaded = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(bytes) = self.activities.get(id_key(id))? {
                loaded.push(decode_activity(&bytes, unprocessed)?);
            }
        }
        Ok(loaded)
    }

    async fn allocate(
        &self,
        max_batch: usize,
        timeout: Duration,
        previously_allocated: &[ActivityId],
        now: DateTime<Utc>,
    ) -> Result<Allocation> {
        let _guard = self.write_lock.lock().await;

        let rows = self.scan()?;
        let by_id: HashMap<ActivityId, &Activity> = rows.iter().map(|a| (a.id, a)).collect();
        let now_finished_ids = finished_ids(previously_allocated, |id| by_id.get(&id).copied());
        let selected = eligibility::select(rows.iter(), max_batch, timeout, now);

        let mut batch = Batch::default();
        let mut newly_allocated = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(&row) = by_id.get(&id) {
                let mut activity = row.clone();
                activity.advance(RunningState::Running, now);
                batch.insert(id_key(id).to_vec(), bincode::serialize(&activity)?);
                newly_allocated.push(activity);
            }
        }
        self.activities.apply_batch(batch)?;

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
        let _guard = self.write_lock.lock().await;
        let mut activity = self
            .get_activity(id)?
            .ok_or(IndexSyncError::ActivityNotFound { id })?;
        let previous = activity.running_state;
        if activity.advance(state, now) {
            self.put_activity(&activity)?;
        } else {
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
        let _guard = self.write_lock.lock().await;
        let mut batch = Batch::default();
        let mut missing = Vec::new();
        for &id in ids {
            match self.get_activity(id)? {
                Some(mut activity) if activity.running_state == RunningState::Running => {
                    activity.lock_time = Some(now);
                    batch.insert(id_key(id).to_vec(), bincode::serialize(&activity)?);
                }
                Some(_) => {}
                None => missing.push(id),
            }
        }
        self.activities.apply_batch(batch)?;

        if missing.is_empty() {
            Ok(())
        } else {
            Err(IndexSyncError::ActivitiesNotFound { ids: missing })
        }
    }

    async fn delete_finished(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut batch = Batch::default();
        let mut removed = 0;
        for activity in self.scan()?.iter().filter(|a| a.is_done()) {
            batch.remove(id_key(activity.id).to_vec());
            removed += 1;
        }
        self.activities.apply_batch(batch)?;
        Ok(removed)
    }

    async fn delete_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.activities.clear()?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for SledStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let fresh = bincode::serialize(&Lease::new(key, holder_id, lease_timeout, now))?;
        loop {
            let current = self.leases.get(key)?;
            if let Some(bytes) = &current {
                if decode_lease(bytes)?.is_live(now) {
                    return Ok(false);
                }
            }
            match self
                .leases
                .compare_and_swap(key, current, Some(fresh.clone()))?
            {
                Ok(()) => return Ok(true),
                // lost a race; look at the new value
                Err(_) => continue,
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
        let renewed = bincode::serialize(&Lease::new(key, holder_id, lease_timeout, now))?;
        loop {
            let current = match self.leases.get(key)? {
                Some(bytes) if decode_lease(&bytes)?.holder_id == holder_id => bytes,
                _ => return Ok(false),
            };
            match self
                .leases
                .compare_and_swap(key, Some(current), Some(renewed.clone()))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<()> {
        loop {
            let current = match self.leases.get(key)? {
                Some(bytes) if decode_lease(&bytes)?.holder_id == holder_id => bytes,
                _ => return Ok(()),
            };
            match self
                .leases
                .compare_and_swap(key, Some(current), None as Option<IVec>)?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    async fn is_locked(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.leases.get(key)? {
            Some(bytes) => Ok(decode_lease(&bytes)?.is_live(now)),
            None => Ok(false),
        }
    }

    async fn release_all(&self) -> Result<()> {
        self.leases.clear()?;
        Ok(())
    }
}
