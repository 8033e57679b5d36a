//! Cross-process mutual exclusion over a shared lease store.
//!
//! Every process builds one [`ExclusiveBlock`] with its own instance id.
//! Callers name a resource key and an operation id. Each run holds the lease
//! as `{instance_id}/{operation_id}/{run_id}`, with a fresh run id per call,
//! so two runs of the same operation in one process never release or renew
//! each other's lease. Leases are never refreshed behind the caller's back,
//! so a holder that outlives `lease_timeout` can be displaced. Long actions
//! renew through the [`ExclusiveLease`] handed to them.

use chrono::Utc;
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ExclusiveBlockConfig;
use crate::error::{IndexSyncError, Result};
use crate::storage::LeaseStore;

/// What to do when another holder owns the lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveBlockType {
    /// Return without running the action
    SkipIfLocked,
    /// Wait for the holder to finish, then return without running; whoever
    /// held the lease did the work
    WaitForReleased,
    /// Wait until the lease can be taken, then run
    WaitAndAcquire,
}

#[derive(Clone)]
pub struct ExclusiveBlock {
    store: Arc<dyn LeaseStore>,
    instance_id: String,
}

impl ExclusiveBlock {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::with_instance_id(store, Uuid::new_v4().to_string())
    }

    pub fn with_instance_id(store: Arc<dyn LeaseStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn holder_id(&self, operation_id: &str) -> String {
        format!("{}/{}/{}", self.instance_id, operation_id, Uuid::new_v4())
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        self.store.is_locked(key, Utc::now()).await
    }

    /// Run `action` under the lease for `key` according to `policy`.
    ///
    /// Returns `Ok(Some(_))` when the action ran here and `Ok(None)` when the
    /// policy decided not to run it. The lease is released on every exit
    /// path, including a panic inside the action (re-raised after release)
    /// and cancellation of the returned future.
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        operation_id: &str,
        policy: ExclusiveBlockType,
        config: &ExclusiveBlockConfig,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(ExclusiveLease) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        config.validate()?;
        let holder_id = self.holder_id(operation_id);

        match policy {
            ExclusiveBlockType::SkipIfLocked => {
                if !self.try_acquire(key, &holder_id, config).await? {
                    debug!(key, operation_id, "Lease held elsewhere, skipping");
                    return Ok(None);
                }
            }
            ExclusiveBlockType::WaitForReleased => {
                if !self.try_acquire(key, &holder_id, config).await? {
                    debug!(key, operation_id, "Lease held elsewhere, waiting for release");
                    self.wait_for_release(key, config).await?;
                    return Ok(None);
                }
            }
            ExclusiveBlockType::WaitAndAcquire => {
                self.acquire_when_free(key, &holder_id, config).await?;
            }
        }

        self.execute(key, holder_id, action).await.map(Some)
    }

    /// Drop every lease, whoever holds it
    pub async fn release_all(&self) -> Result<()> {
        warn!("Releasing all leases");
        self.store.release_all().await
    }

    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        config: &ExclusiveBlockConfig,
    ) -> Result<bool> {
        self.store
            .try_acquire(key, holder_id, config.lease_timeout, Utc::now())
            .await
    }

    async fn wait_for_release(&self, key: &str, config: &ExclusiveBlockConfig) -> Result<()> {
        let started = Instant::now();
        while self.store.is_locked(key, Utc::now()).await? {
            pause(key, started, config).await?;
        }
        debug!(key, waited = ?started.elapsed(), "Lease released");
        Ok(())
    }

    async fn acquire_when_free(
        &self,
        key: &str,
        holder_id: &str,
        config: &ExclusiveBlockConfig,
    ) -> Result<()> {
        let started = Instant::now();
        while !self.try_acquire(key, holder_id, config).await? {
            pause(key, started, config).await?;
        }
        debug!(key, holder_id, waited = ?started.elapsed(), "Lease acquired");
        Ok(())
    }

    async fn execute<T, F, Fut>(&self, key: &str, holder_id: String, action: F) -> Result<T>
    where
        F: FnOnce(ExclusiveLease) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let lease = ExclusiveLease {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            holder_id,
        };
        let guard = LeaseGuard {
            lease: lease.clone(),
            released: false,
        };
        debug!(key, holder_id = %lease.holder_id, "Running exclusive action");

        let outcome = AssertUnwindSafe(async move { action(lease).await })
            .catch_unwind()
            .await;
        guard.release().await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(IndexSyncError::Action {
                key: key.to_string(),
                source,
            }),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// The lease held by one running action
#[derive(Clone)]
pub struct ExclusiveLease {
    store: Arc<dyn LeaseStore>,
    key: String,
    holder_id: String,
}

impl ExclusiveLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Push the expiry out to `now + lease_timeout`. False once the lease was
    /// displaced or released.
    pub async fn renew(&self, lease_timeout: Duration) -> Result<bool> {
        let renewed = self
            .store
            .renew(&self.key, &self.holder_id, lease_timeout, Utc::now())
            .await?;
        if !renewed {
            warn!(key = %self.key, holder_id = %self.holder_id, "Lease could not be renewed");
        }
        Ok(renewed)
    }

    async fn release(&self) -> Result<()> {
        self.store.release(&self.key, &self.holder_id).await
    }
}

/// Sleep one jittered poll interval, or fail once `wait_timeout` is used up
async fn pause(key: &str, started: Instant, config: &ExclusiveBlockConfig) -> Result<()> {
    let waited = started.elapsed();
    if waited >= config.wait_timeout {
        return Err(IndexSyncError::LeaseTimeout {
            key: key.to_string(),
            waited,
        });
    }
    let remaining = config.wait_timeout - waited;
    tokio::time::sleep(jittered(config.poll_interval).min(remaining)).await;
    Ok(())
}

fn jittered(interval: Duration) -> Duration {
    interval + interval.mul_f64(fastrand::f64() * 0.1)
}

/// Releases the lease when dropped without an explicit release, which is
/// what happens when the future running the action is cancelled.
struct LeaseGuard {
    lease: ExclusiveLease,
    released: bool,
}

impl LeaseGuard {
    async fn release(mut self) {
        if let Err(e) = self.lease.release().await {
            warn!(
                key = %self.lease.key,
                error = %e,
                "Lease release failed, it will lapse on timeout"
            );
        }
        self.released = true;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.lease.key, "No runtime to release lease, it will lapse on timeout");
            return;
        };
        let lease = self.lease.clone();
        debug!(
            key = %lease.key,
            holder_id = %lease.holder_id,
            "Releasing lease of cancelled action"
        );
        handle.spawn(async move {
            if let Err(e) = lease.release().await {
                warn!(
                    key = %lease.key,
                    error = %e,
                    "Lease release failed, it will lapse on timeout"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> ExclusiveBlockConfig {
        ExclusiveBlockConfig {
            lease_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
        }
    }

    fn create_block(store: &Arc<MemoryStore>) -> ExclusiveBlock {
        ExclusiveBlock::new(Arc::clone(store) as Arc<dyn LeaseStore>)
    }

    #[tokio::test]
    async fn test_skip_if_locked() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);
        let config = fast_config();

        store
            .try_acquire("purge", "other/op", config.lease_timeout, Utc::now())
            .await
            .unwrap();
        let ran = block
            .run("purge", "op", ExclusiveBlockType::SkipIfLocked, &config, |_| async {
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(ran, None);

        store.release("purge", "other/op").await.unwrap();
        let ran = block
            .run("purge", "op", ExclusiveBlockType::SkipIfLocked, &config, |_| async {
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(ran, Some(1));
        assert!(!block.is_locked("purge").await.unwrap());
    }

    #[tokio::test]
    async fn test_action_error_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);

        let err = block
            .run("k", "op", ExclusiveBlockType::SkipIfLocked, &fast_config(), |_| async {
                Err::<(), _>(anyhow::anyhow!("index unavailable"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexSyncError::Action { ref key, .. } if key == "k"));
        assert!(!block.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_panic_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);

        let task = tokio::spawn({
            let block = block.clone();
            async move {
                block
                    .run("k", "op", ExclusiveBlockType::SkipIfLocked, &fast_config(), |_| async {
                        if true {
                            panic!("boom");
                        }
                        Ok(())
                    })
                    .await
            }
        });
        assert!(task.await.unwrap_err().is_panic());
        assert!(!block.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            block.run("k", "op", ExclusiveBlockType::SkipIfLocked, &fast_config(), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        // the release runs on a spawned task
        for _ in 0..50 {
            if !block.is_locked("k").await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lease still held after cancellation");
    }

    #[tokio::test]
    async fn test_wait_and_acquire_times_out() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);
        let config = ExclusiveBlockConfig {
            wait_timeout: Duration::from_millis(60),
            ..fast_config()
        };
        store
            .try_acquire("k", "other/op", Duration::from_secs(60), Utc::now())
            .await
            .unwrap();

        let ran = AtomicUsize::new(0);
        let err = block
            .run("k", "op", ExclusiveBlockType::WaitAndAcquire, &config, |_| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexSyncError::LeaseTimeout { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);
        store
            .try_acquire("k", "crashed/op", Duration::from_millis(10), Utc::now())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let ran = block
            .run("k", "op", ExclusiveBlockType::SkipIfLocked, &fast_config(), |_| async {
                Ok("took over")
            })
            .await
            .unwrap();
        assert_eq!(ran, Some("took over"));
    }

    #[tokio::test]
    async fn test_renew_own_lease_only() {
        let store = Arc::new(MemoryStore::new());
        let block = create_block(&store);
        let config = fast_config();

        let lease = block
            .run("k", "op", ExclusiveBlockType::SkipIfLocked, &config, |lease| async move {
                assert!(lease.renew(Duration::from_secs(30)).await?);
                Ok(lease)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.key(), "k");

        // released after the block, nothing left to renew
        assert!(!lease.renew(Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_each_run_holds_its_own_lease() {
        let store = Arc::new(MemoryStore::new());
        let block = ExclusiveBlock::with_instance_id(store.clone(), "proc");
        let config = fast_config();

        let mut holders = Vec::new();
        for _ in 0..2 {
            let holder = block
                .run("k", "op", ExclusiveBlockType::SkipIfLocked, &config, |lease| async move {
                    Ok(lease.holder_id().to_string())
                })
                .await
                .unwrap()
                .unwrap();
            assert!(holder.starts_with("proc/op/"));
            holders.push(holder);
        }
        assert_ne!(holders[0], holders[1]);
    }

    #[tokio::test]
    async fn test_displaced_run_cannot_renew_or_release() {
        let store = Arc::new(MemoryStore::new());
        let block = ExclusiveBlock::with_instance_id(store.clone(), "proc");
        let short = ExclusiveBlockConfig {
            lease_timeout: Duration::from_millis(10),
            ..fast_config()
        };

        let successor = store.clone();
        let renewed = block
            .run("k", "op", ExclusiveBlockType::SkipIfLocked, &short, |lease| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let taken = successor
                    .try_acquire("k", "proc/op/next", Duration::from_secs(60), Utc::now())
                    .await?;
                assert!(taken);
                Ok(lease.renew(Duration::from_secs(60)).await?)
            })
            .await
            .unwrap();
        assert_eq!(renewed, Some(false));

        // the displaced run's release left the successor's lease alone
        assert!(block.is_locked("k").await.unwrap());
        store.release("k", "proc/op/next").await.unwrap();
        assert!(!block.is_locked("k").await.unwrap());
    }

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_millis(100);
        for _ in 0..100 {
            let slept = jittered(interval);
            assert!(slept >= interval);
            assert!(slept <= Duration::from_millis(110));
        }
    }
}
