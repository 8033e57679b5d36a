use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{Activity, ActivityId};
use crate::scheduler::ActivityQueue;

/// What a process has executed so far: every id up to `last_activity_id`
/// except the ones listed in `gaps`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionState {
    pub last_activity_id: ActivityId,
    pub gaps: BTreeSet<ActivityId>,
}

impl CompletionState {
    /// State of a process that has seen everything up to `last_activity_id`
    pub fn starting_at(last_activity_id: ActivityId) -> Self {
        Self {
            last_activity_id,
            gaps: BTreeSet::new(),
        }
    }

    pub fn is_completed(&self, id: ActivityId) -> bool {
        id <= self.last_activity_id && !self.gaps.contains(&id)
    }

    /// Record one executed id. Skipped ids below it become gaps.
    pub fn record(&mut self, id: ActivityId) {
        if id > self.last_activity_id {
            self.gaps.extend(self.last_activity_id + 1..id);
            self.last_activity_id = id;
        } else {
            self.gaps.remove(&id);
        }
    }
}

/// Shared, concurrently updated [`CompletionState`]
#[derive(Debug, Default)]
pub struct CompletionTracker {
    state: Mutex<CompletionState>,
}

impl CompletionTracker {
    pub fn new(state: CompletionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn record(&self, id: ActivityId) {
        self.state.lock().await.record(id);
    }

    pub async fn snapshot(&self) -> CompletionState {
        self.state.lock().await.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Gap ids that were asked for
    pub gaps_requested: usize,
    /// Gap ids still present in the store
    pub gaps_loaded: usize,
    /// Activities registered after `last_activity_id`
    pub tail_loaded: usize,
    /// Range loads issued for the tail
    pub pages: usize,
}

/// Finds the activities a process has not executed yet
pub struct Recovery {
    queue: Arc<ActivityQueue>,
    page_size: usize,
}

impl Recovery {
    pub fn new(queue: Arc<ActivityQueue>) -> Self {
        let page_size = queue.config().load_page_size;
        Self { queue, page_size }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Load the gap activities and everything registered after
    /// `state.last_activity_id`, flagged unprocessed, in id order.
    ///
    /// Gap ids missing from the store were purged, which only happens to
    /// Done activities, so they need no further work.
    pub async fn reconcile(
        &self,
        state: &CompletionState,
    ) -> Result<(Vec<Activity>, RecoveryStats)> {
        info!(
            last_activity_id = state.last_activity_id,
            gaps = state.gaps.len(),
            "Starting reconciliation"
        );
        let mut stats = RecoveryStats {
            gaps_requested: state.gaps.len(),
            ..Default::default()
        };

        let gap_ids: Vec<ActivityId> = state.gaps.iter().copied().collect();
        let mut activities = self.queue.load_by_id_gaps(&gap_ids).await?;
        stats.gaps_loaded = activities.len();

        let last_id = self.queue.last_id().await?;
        let mut from = state.last_activity_id + 1;
        while from <= last_id {
            let page = self
                .queue
                .load_range(from, last_id, self.page_size, true)
                .await?;
            stats.pages += 1;
            let Some(last) = page.last() else {
                break;
            };
            from = last.id + 1;
            let full = page.len() == self.page_size;
            debug!(loaded = page.len(), next = from, "Loaded tail page");
            stats.tail_loaded += page.len();
            activities.extend(page);
            if !full {
                break;
            }
        }

        info!(
            gaps_loaded = stats.gaps_loaded,
            tail_loaded = stats.tail_loaded,
            "Reconciliation completed"
        );
        Ok((activities, stats))
    }
}
