//! Selection rules for allocation.
//!
//! Eligibility is re-derived from the complete set of not-Done activities on
//! every call. Two independent constraints apply:
//!
//! * **resource ordering**: only the lowest-id not-Done activity of a
//!   `resource_id` may run;
//! * **subtree ordering**: a not-Done tree activity blocks every later-queued
//!   activity at or below its path, while earlier-queued ones are unaffected.
//!
//! Both are answered from two small indexes (per-resource head, per-path
//! lowest tree id) so a check costs one hash lookup per path segment.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::model::{Activity, ActivityId, ResourceId, RunningState};

/// Canonical form used for path comparisons: ASCII case-folded, no trailing slash
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

/// `/a/b/c` yields `/a/b/c`, `/a/b`, `/a`, `/`
fn self_and_ancestors(path: &str) -> Vec<&str> {
    let mut out = vec![path];
    let mut current = path;
    while let Some(idx) = current.rfind('/') {
        if idx == 0 {
            if current.len() > 1 {
                out.push("/");
            }
            break;
        }
        current = &current[..idx];
        out.push(current);
    }
    out
}

/// Why an activity cannot be allocated yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// An earlier activity on the same resource is not Done
    Resource(ActivityId),
    /// An earlier tree activity covering this path is not Done
    Subtree(ActivityId),
}

/// Dependency indexes built from the not-Done set
#[derive(Debug, Default)]
pub struct Eligibility {
    resource_heads: HashMap<ResourceId, ActivityId>,
    tree_heads: HashMap<String, ActivityId>,
}

impl Eligibility {
    /// Index every activity that is not Done; Done rows are skipped
    pub fn build<'a>(activities: impl IntoIterator<Item = &'a Activity>) -> Self {
        let mut index = Self::default();
        for activity in activities.into_iter().filter(|a| !a.is_done()) {
            index
                .resource_heads
                .entry(activity.resource_id)
                .and_modify(|head| *head = (*head).min(activity.id))
                .or_insert(activity.id);

            if activity.is_tree() {
                index
                    .tree_heads
                    .entry(normalize_path(&activity.target_path))
                    .and_modify(|head| *head = (*head).min(activity.id))
                    .or_insert(activity.id);
            }
        }
        index
    }

    /// First constraint preventing `activity` from running, if any
    pub fn blocker(&self, activity: &Activity) -> Option<Blocker> {
        if let Some(&head) = self.resource_heads.get(&activity.resource_id) {
            if head < activity.id {
                return Some(Blocker::Resource(head));
            }
        }

        let path = normalize_path(&activity.target_path);
        self_and_ancestors(&path)
            .into_iter()
            .filter_map(|p| self.tree_heads.get(p).copied())
            .filter(|&tree_id| tree_id < activity.id)
            .min()
            .map(Blocker::Subtree)
    }

    pub fn is_eligible(&self, activity: &Activity) -> bool {
        self.blocker(activity).is_none()
    }
}

/// Waiting, or Running under an abandoned lock
pub fn is_candidate(activity: &Activity, timeout: Duration, now: DateTime<Utc>) -> bool {
    match activity.running_state {
        RunningState::Waiting => true,
        RunningState::Running => activity.lock_expired(timeout, now),
        RunningState::Done => false,
    }
}

/// Pick up to `max_batch` allocatable ids, lowest first.
///
/// `activities` may contain any mix of states; Done rows are ignored.
pub fn select<'a>(
    activities: impl IntoIterator<Item = &'a Activity>,
    max_batch: usize,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Vec<ActivityId> {
    let not_done: Vec<&Activity> = activities.into_iter().filter(|a| !a.is_done()).collect();
    let eligibility = Eligibility::build(not_done.iter().copied());

    let mut selected: Vec<ActivityId> = not_done
        .iter()
        .filter(|a| is_candidate(a, timeout, now))
        .filter(|a| eligibility.is_eligible(a))
        .map(|a| a.id)
        .collect();
    selected.sort_unstable();
    selected.truncate(max_batch);
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityKind, NewActivity};
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn act(id: ActivityId, kind: ActivityKind, path: &str, resource: ResourceId) -> Activity {
        Activity::from_new(id, NewActivity::new(kind, path, resource), Utc::now())
    }

    fn doc(id: ActivityId, path: &str, resource: ResourceId) -> Activity {
        act(id, ActivityKind::UpdateDocument, path, resource)
    }

    #[test]
    fn test_self_and_ancestors() {
        assert_eq!(self_and_ancestors("/a/b/c"), vec!["/a/b/c", "/a/b", "/a", "/"]);
        assert_eq!(self_and_ancestors("/"), vec!["/"]);
        assert_eq!(self_and_ancestors("/a"), vec!["/a", "/"]);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/Root/Sites/"), "/root/sites");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_same_resource_runs_in_id_order() {
        let activities = vec![doc(1, "/r/x", 7), doc(2, "/r/x", 7), doc(3, "/r/x", 7)];
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![1]);

        let index = Eligibility::build(&activities);
        assert_eq!(index.blocker(&activities[2]), Some(Blocker::Resource(1)));
    }

    #[test]
    fn test_running_head_blocks_its_resource() {
        let now = Utc::now();
        let mut running = doc(1, "/r/x", 7);
        running.running_state = RunningState::Running;
        running.lock_time = Some(now);
        let activities = vec![running, doc(2, "/r/x", 7), doc(3, "/r/y", 8)];

        assert_eq!(select(&activities, 10, TIMEOUT, now), vec![3]);
    }

    #[test]
    fn test_subtree_blocks_later_activities_only() {
        let activities = vec![
            doc(5, "/a/early", 1),
            act(10, ActivityKind::AddTree, "/a", 2),
            doc(11, "/a/x", 3),
            doc(12, "/b", 4),
            doc(13, "/a", 5),
            doc(14, "/ab", 6),
        ];
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![5, 10, 12, 14]);
    }

    #[test]
    fn test_subtree_comparison_ignores_case_and_trailing_slash() {
        let activities = vec![
            act(1, ActivityKind::RemoveTree, "/Root/Docs/", 1),
            doc(2, "/root/docs/readme", 2),
        ];
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![1]);
    }

    #[test]
    fn test_root_tree_blocks_everything_after_it() {
        let activities = vec![
            act(1, ActivityKind::AddTree, "/", 1),
            doc(2, "/anything", 2),
            act(3, ActivityKind::AddTree, "/nested/tree", 3),
        ];
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![1]);
    }

    #[test]
    fn test_nested_tree_activities() {
        let activities = vec![
            act(1, ActivityKind::AddTree, "/a/b", 1),
            act(2, ActivityKind::RemoveTree, "/a", 2),
            doc(3, "/a/c", 3),
        ];
        // 2 covers /a/b but was queued later, so 1 proceeds; 3 waits on 2
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![1, 2]);
    }

    #[test]
    fn test_rebuilds_on_different_resources_are_independent() {
        let activities = vec![
            act(1, ActivityKind::Rebuild, "/x", 10),
            act(2, ActivityKind::Rebuild, "/y", 11),
        ];
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![1, 2]);
    }

    #[test]
    fn test_done_rows_do_not_block() {
        let mut tree = act(1, ActivityKind::AddTree, "/a", 1);
        tree.running_state = RunningState::Done;
        let mut head = doc(2, "/c", 9);
        head.running_state = RunningState::Done;
        let activities = vec![tree, head, doc(3, "/a/x", 2), doc(4, "/c", 9)];
        assert_eq!(select(&activities, 10, TIMEOUT, Utc::now()), vec![3, 4]);
    }

    #[test]
    fn test_expired_lock_is_candidate_again() {
        let now = Utc::now();
        let mut stale = doc(1, "/a", 1);
        stale.running_state = RunningState::Running;
        stale.lock_time = Some(now - ChronoDuration::seconds(61));
        let mut fresh = doc(2, "/b", 2);
        fresh.running_state = RunningState::Running;
        fresh.lock_time = Some(now - ChronoDuration::seconds(59));

        assert_eq!(select(&[stale, fresh], 10, TIMEOUT, now), vec![1]);
    }

    #[test]
    fn test_batch_limit_keeps_lowest_ids() {
        let activities: Vec<Activity> = (1..=20).rev().map(|i| doc(i, "/p", i)).collect();
        assert_eq!(select(&activities, 3, TIMEOUT, Utc::now()), vec![1, 2, 3]);
        assert!(select(&activities, 0, TIMEOUT, Utc::now()).is_empty());
    }
}
