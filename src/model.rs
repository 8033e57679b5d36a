use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

// Type aliases
pub type ActivityId = u64;
pub type ResourceId = u64;

/// Kind of index-affecting operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    AddDocument,
    UpdateDocument,
    AddTree,
    RemoveTree,
    Rebuild,
}

impl ActivityKind {
    /// Tree activities cover every path at or below their target path
    pub fn is_tree(self) -> bool {
        matches!(self, ActivityKind::AddTree | ActivityKind::RemoveTree)
    }
}

/// Lifecycle of an activity; the ordering is the only allowed direction of travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RunningState {
    Waiting,
    Running,
    Done,
}

/// Producer-side description of an activity, before the store assigns an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub kind: ActivityKind,
    pub target_path: String,
    pub resource_id: ResourceId,
    pub version_id: u64,
    pub payload: Option<Vec<u8>>,
}

impl NewActivity {
    pub fn new(
        kind: ActivityKind,
        target_path: impl Into<String>,
        resource_id: ResourceId,
    ) -> Self {
        Self {
            kind,
            target_path: target_path.into(),
            resource_id,
            version_id: 0,
            payload: None,
        }
    }

    pub fn with_version(mut self, version_id: u64) -> Self {
        self.version_id = version_id;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a JSON-encoded document as payload
    pub fn with_json_payload<T: Serialize>(mut self, document: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_vec(document)?);
        Ok(self)
    }
}

/// A queued index-affecting operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub kind: ActivityKind,
    pub target_path: String,
    pub resource_id: ResourceId,
    pub version_id: u64,
    pub creation_time: DateTime<Utc>,
    pub running_state: RunningState,
    pub lock_time: Option<DateTime<Utc>>,
    pub payload: Option<Vec<u8>>,

    /// Set by loads that were asked for "unprocessed" rows. Bookkeeping hint
    /// for the caller only, never persisted.
    #[serde(skip)]
    pub is_unprocessed: bool,
}

impl Activity {
    /// Build the stored record for a freshly registered activity
    pub fn from_new(id: ActivityId, new: NewActivity, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            target_path: new.target_path,
            resource_id: new.resource_id,
            version_id: new.version_id,
            creation_time: now,
            running_state: RunningState::Waiting,
            lock_time: None,
            payload: new.payload,
            is_unprocessed: false,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind.is_tree()
    }

    pub fn is_done(&self) -> bool {
        self.running_state == RunningState::Done
    }

    /// Running with a lock older than `timeout` (or no lock at all)
    pub fn lock_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.running_state != RunningState::Running {
            return false;
        }
        match self.lock_time {
            Some(locked_at) => now - locked_at > to_chrono(timeout),
            None => true,
        }
    }

    /// Decode a JSON payload
    pub fn json_payload<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply a forward-only state transition. Returns false when the request
    /// would move the activity backward and was ignored.
    pub(crate) fn advance(&mut self, state: RunningState, now: DateTime<Utc>) -> bool {
        if state < self.running_state {
            return false;
        }
        if state == RunningState::Running {
            self.lock_time = Some(now);
        }
        self.running_state = state;
        true
    }
}

/// Result of one allocation round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    pub newly_allocated: Vec<Activity>,
    pub now_finished_ids: Vec<ActivityId>,
}

impl Allocation {
    pub fn is_empty(&self) -> bool {
        self.newly_allocated.is_empty() && self.now_finished_ids.is_empty()
    }

    pub fn allocated_ids(&self) -> Vec<ActivityId> {
        self.newly_allocated.iter().map(|a| a.id).collect()
    }
}

/// Time-bounded exclusive claim on a resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(
        resource_key: impl Into<String>,
        holder_id: impl Into<String>,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now + to_chrono(lease_timeout),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// Saturating conversion, capped at a century so timestamp arithmetic cannot overflow
pub(crate) fn to_chrono(duration: Duration) -> ChronoDuration {
    let cap = ChronoDuration::days(36_500);
    ChronoDuration::from_std(duration).map_or(cap, |d| d.min(cap))
}
