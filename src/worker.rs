use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::model::{Activity, ActivityId};
use crate::recovery::{CompletionState, CompletionTracker};
use crate::scheduler::ActivityQueue;

/// Floor for worker intervals; `interval_at` rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Applies one activity to the index
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    async fn execute(&self, activity: &Activity) -> anyhow::Result<()>;
}

/// Allocation loop for one process
pub struct Worker {
    queue: Arc<ActivityQueue>,
    executor: Arc<dyn ActivityExecutor>,
    config: WorkerConfig,
    tracker: Arc<CompletionTracker>,
    held: Mutex<BTreeSet<ActivityId>>,
}

impl Worker {
    /// Zero intervals are raised to a 1ms floor.
    pub fn new(
        queue: Arc<ActivityQueue>,
        executor: Arc<dyn ActivityExecutor>,
        mut config: WorkerConfig,
    ) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Invalid worker configuration, clamping intervals");
            config.poll_interval = config.poll_interval.max(MIN_INTERVAL);
            config.refresh_interval = config.refresh_interval.max(MIN_INTERVAL);
        }
        Self {
            queue,
            executor,
            config,
            tracker: Arc::new(CompletionTracker::default()),
            held: Mutex::new(BTreeSet::new()),
        }
    }

    /// Resume from a known completion state
    pub fn with_tracker(mut self, tracker: Arc<CompletionTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> Arc<CompletionTracker> {
        Arc::clone(&self.tracker)
    }

    pub async fn completion_state(&self) -> CompletionState {
        self.tracker.snapshot().await
    }

    /// Ids allocated to this worker that the queue has not reported finished
    pub async fn held_ids(&self) -> Vec<ActivityId> {
        self.held.lock().await.iter().copied().collect()
    }

    /// Allocate one batch and execute it to completion.
    ///
    /// Returns how many activities were completed. Executor failures are
    /// logged and the activity is still marked Done; a failed completion
    /// leaves it Running until its lock times out.
    pub async fn run_once(&self) -> Result<usize> {
        let previous = self.held_ids().await;
        let allocation = self.queue.allocate_next(&previous).await?;
        {
            let mut held = self.held.lock().await;
            for id in &allocation.now_finished_ids {
                held.remove(id);
            }
            held.extend(allocation.newly_allocated.iter().map(|a| a.id));
        }
        if allocation.newly_allocated.is_empty() {
            return Ok(0);
        }

        let ids = allocation.allocated_ids();
        debug!(batch = ids.len(), "Executing batch");

        let batch = join_all(allocation.newly_allocated.iter().map(|a| self.process(a)));
        tokio::pin!(batch);

        let period = self.config.refresh_interval;
        let mut refresh = interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let results = loop {
            tokio::select! {
                results = &mut batch => break results,
                _ = refresh.tick() => {
                    if let Err(e) = self.queue.refresh_lock_time(&ids).await {
                        warn!(error = %e, "Failed to refresh lock times");
                    }
                }
            }
        };

        Ok(results.into_iter().filter(|completed| *completed).count())
    }

    async fn process(&self, activity: &Activity) -> bool {
        if let Err(e) = self.executor.execute(activity).await {
            warn!(
                activity_id = activity.id,
                kind = ?activity.kind,
                error = %e,
                "Activity execution failed, completing it anyway"
            );
        }
        match self.queue.mark_done(activity.id).await {
            Ok(()) => {
                self.tracker.record(activity.id).await;
                true
            }
            Err(e) => {
                error!(activity_id = activity.id, error = %e, "Failed to complete activity");
                false
            }
        }
    }

    /// Run batches until an allocation comes back empty
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.run_once().await? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }

    /// Poll the queue until `shutdown` fires. A batch that has started is
    /// finished before the signal is observed.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!("Worker started");
        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            let delay = match self.run_once().await {
                Ok(0) => self.config.poll_interval,
                Ok(completed) => {
                    debug!(completed, "Batch completed");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Allocation failed");
                    e.suggested_retry_delay()
                        .unwrap_or(self.config.poll_interval)
                }
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(delay) => {}
            }
        }
        info!("Worker shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::model::{ActivityKind, NewActivity, RunningState};
    use crate::storage::MemoryStore;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingExecutor {
        seen: StdMutex<Vec<ActivityId>>,
        fail_on: Option<ActivityId>,
    }

    #[async_trait]
    impl ActivityExecutor for RecordingExecutor {
        async fn execute(&self, activity: &Activity) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(activity.id);
            if self.fail_on == Some(activity.id) {
                anyhow::bail!("cannot index {}", activity.target_path);
            }
            Ok(())
        }
    }

    fn create_worker(executor: Arc<RecordingExecutor>) -> (Arc<ActivityQueue>, Worker) {
        let queue = Arc::new(ActivityQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default(),
        ));
        let worker = Worker::new(
            Arc::clone(&queue),
            executor,
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                refresh_interval: Duration::from_millis(20),
            },
        );
        (queue, worker)
    }

    #[tokio::test]
    async fn test_run_once_completes_and_tracks() {
        let executor = Arc::new(RecordingExecutor::default());
        let (queue, worker) = create_worker(Arc::clone(&executor));
        for resource in [1, 1, 2] {
            queue
                .register(NewActivity::new(ActivityKind::UpdateDocument, "/d", resource))
                .await
                .unwrap();
        }

        assert_eq!(worker.run_once().await.unwrap(), 2);
        assert_eq!(worker.held_ids().await, vec![1, 3]);

        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(worker.held_ids().await, vec![2]);
        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert!(worker.held_ids().await.is_empty());

        assert_eq!(worker.completion_state().await, CompletionState::starting_at(3));
        let mut seen = executor.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_execution_still_completes() {
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some(1),
            ..Default::default()
        });
        let (queue, worker) = create_worker(executor);
        let id = queue
            .register(NewActivity::new(ActivityKind::AddDocument, "/broken", 1))
            .await
            .unwrap();

        assert_eq!(worker.drain().await.unwrap(), 1);
        let activity = queue.load_by_id(id, false).await.unwrap().unwrap();
        assert_eq!(activity.running_state, RunningState::Done);
    }

    #[tokio::test]
    async fn test_zero_intervals_are_clamped() {
        let queue = Arc::new(ActivityQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default(),
        ));
        let worker = Worker::new(
            Arc::clone(&queue),
            Arc::new(RecordingExecutor::default()),
            WorkerConfig {
                poll_interval: Duration::ZERO,
                refresh_interval: Duration::ZERO,
            },
        );
        assert_eq!(worker.config.refresh_interval, MIN_INTERVAL);
        assert_eq!(worker.config.poll_interval, MIN_INTERVAL);

        queue
            .register(NewActivity::new(ActivityKind::AddDocument, "/d", 1))
            .await
            .unwrap();
        assert_eq!(worker.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let executor = Arc::new(RecordingExecutor::default());
        let (queue, worker) = create_worker(Arc::clone(&executor));
        let worker = Arc::new(worker);
        queue
            .register(NewActivity::new(ActivityKind::Rebuild, "/", 1))
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(executor.seen.lock().unwrap().as_slice(), &[1]);
    }
}
