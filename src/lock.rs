//! Distributed lock handles.
//!
//! A [`DistributedLock`] represents ownership of a cluster-wide critical
//! section acquired through the backing store. Releasing is guarded by an
//! atomic flag: the first release reaches the store, any further release is
//! a hard error that stays local, and dropping an unreleased handle fires
//! the release in the background so the lock is freed on every exit path.

use crate::error::{MetaError, Result};
use crate::store::{KvStore, Rev};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Releases a backing-store lock key.
///
/// Lock handles hold an unlocker rather than the meta service itself, so a
/// long-lived handle cannot keep the whole service alive.
#[async_trait]
pub trait Unlocker: Send + Sync {
    async fn unlock(&self, lock_key: &[u8]) -> Result<Rev>;
}

/// Unlocker backed directly by the store adapter.
pub(crate) struct StoreUnlocker<S: KvStore> {
    pub(crate) store: Arc<S>,
}

#[async_trait]
impl<S: KvStore> Unlocker for StoreUnlocker<S> {
    async fn unlock(&self, lock_key: &[u8]) -> Result<Rev> {
        self.store.unlock(lock_key).await.map(|resp| resp.rev)
    }
}

/// Scoped handle for a distributed lock.
pub struct DistributedLock {
    name: String,
    rev: Rev,
    lock_key: Vec<u8>,
    released: AtomicBool,
    unlocker: Arc<dyn Unlocker>,
    requested_at: Instant,
    acquired_at: Instant,
    acquire_site: String,
}

impl DistributedLock {
    pub(crate) fn new(
        name: String,
        rev: Rev,
        lock_key: Vec<u8>,
        unlocker: Arc<dyn Unlocker>,
        requested_at: Instant,
        acquire_site: String,
    ) -> Self {
        Self {
            name,
            rev,
            lock_key,
            released: AtomicBool::new(false),
            unlocker,
            requested_at,
            acquired_at: Instant::now(),
            acquire_site,
        }
    }

    /// Revision at which the lock was granted.
    pub fn rev(&self) -> Rev {
        self.rev
    }

    /// Release the lock and return the revision after the release.
    ///
    /// Only the first call reaches the backing store. Any further call
    /// returns `Invalid("double unlock")` without touching the network and
    /// logs the acquisition site.
    pub async fn release(&self) -> Result<Rev> {
        if self.released.swap(true, Ordering::AcqRel) {
            error!(lock = %self.name, acquired_at = %self.acquire_site, "double unlock");
            return Err(MetaError::Invalid("double unlock".to_string()));
        }
        let release_started = Instant::now();
        let result = self.unlocker.unlock(&self.lock_key).await;
        let waited = self.acquired_at.duration_since(self.requested_at);
        let held = release_started.duration_since(self.acquired_at);
        info!(
            lock = %self.name,
            wait_ms = waited.as_millis() as u64,
            held_ms = held.as_millis() as u64,
            "unlock"
        );
        if release_started.duration_since(self.requested_at).as_secs_f64() > 1.0 {
            info!(lock = %self.name, acquired_at = %self.acquire_site, "slow lock hold");
        }
        result
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(lock = %self.name, acquired_at = %self.acquire_site, "lock dropped without release");
        let unlocker = Arc::clone(&self.unlocker);
        let lock_key = std::mem::take(&mut self.lock_key);
        let name = std::mem::take(&mut self.name);
        tokio::spawn(async move {
            if let Err(error) = unlocker.unlock(&lock_key).await {
                error!(lock = %name, %error, "failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingUnlocker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Unlocker for CountingUnlocker {
        async fn unlock(&self, _lock_key: &[u8]) -> Result<Rev> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        }
    }

    fn test_lock(unlocker: Arc<CountingUnlocker>) -> DistributedLock {
        let now = Instant::now();
        DistributedLock::new(
            "/ns/lock".to_string(),
            7,
            b"/ns/lock/abc".to_vec(),
            unlocker,
            now,
            "test".to_string(),
        )
    }

    #[tokio::test]
    async fn test_release_returns_revision() {
        let unlocker = Arc::new(CountingUnlocker {
            calls: AtomicUsize::new(0),
        });
        let lock = test_lock(Arc::clone(&unlocker));
        assert_eq!(lock.rev(), 7);
        assert_eq!(lock.release().await.unwrap(), 42);
        assert_eq!(unlocker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_release_stays_local() {
        let unlocker = Arc::new(CountingUnlocker {
            calls: AtomicUsize::new(0),
        });
        let lock = test_lock(Arc::clone(&unlocker));
        lock.release().await.unwrap();

        let err = lock.release().await.unwrap_err();
        assert!(matches!(err, MetaError::Invalid(ref msg) if msg == "double unlock"));
        assert_eq!(unlocker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_without_release_unlocks_once() {
        let unlocker = Arc::new(CountingUnlocker {
            calls: AtomicUsize::new(0),
        });
        {
            let _lock = test_lock(Arc::clone(&unlocker));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unlocker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_after_release_does_nothing() {
        let unlocker = Arc::new(CountingUnlocker {
            calls: AtomicUsize::new(0),
        });
        {
            let lock = test_lock(Arc::clone(&unlocker));
            lock.release().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unlocker.calls.load(Ordering::SeqCst), 1);
    }
}
