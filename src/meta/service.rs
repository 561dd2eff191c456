//! The meta-service contract and its store-backed implementation.

use super::watch::{DaemonWatch, WatchHandler};
use super::{CommitCallback, LockCallback, MetaOp, OpsCallback, WatchCallback};
use crate::config::MetaConfig;
use crate::context::MetaContext;
use crate::error::{MetaError, Result};
use crate::lock::{DistributedLock, StoreUnlocker, Unlocker};
use crate::store::{EtcdStore, KvStore, MemoryStore, Rev, TxnOp, MAX_TXN_OPS};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, error, info};

/// Operations per commit chunk, leaving headroom under the store's
/// per-transaction cap. Change sets at most this large commit atomically.
pub const MAX_CHUNK_OPS: usize = MAX_TXN_OPS - 1;

/// How long a terminating backing-store child is given to exit before it is
/// killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// The metadata-coordination contract.
///
/// Mutating and reading operations complete through callbacks delivered on
/// the serial meta context, never inline. Errors from reads, commits and
/// locks are reported to the caller and never retried here; the daemon
/// watch is the sole retry loop.
#[async_trait]
pub trait MetaService: Send + Sync {
    /// Take a full snapshot under `prefix` (namespace-relative). Every
    /// returned operation is a `Put` pinned at the snapshot revision.
    /// `base_rev` is accepted for snapshot/watch handoff symmetry and not
    /// consulted.
    fn request_all(&self, prefix: &str, base_rev: Rev, callback: OpsCallback);

    /// One-shot catch-up watch from `since_rev + 1`: delivers a single
    /// batch, then terminates. Bridges the gap between a snapshot and the
    /// live watch.
    fn request_updates(&self, prefix: &str, since_rev: Rev, callback: OpsCallback);

    /// Serialize `changes` into one or more transactions of at most
    /// [`MAX_CHUNK_OPS`] operations each, committed in input order. Earlier
    /// chunks are not rolled back when a later one fails; such a failure is
    /// reported as [`MetaError::PartialCommit`].
    fn commit_updates(&self, changes: Vec<MetaOp>, callback: CommitCallback);

    /// Acquire the distributed lock named `lock_name` (namespace-relative).
    fn request_lock(&self, lock_name: &str, callback: LockCallback);

    /// Start the long-lived delta subscription from `since_rev`. Reconnects
    /// across backing-store outages transparently; only [`stop`] ends it.
    ///
    /// [`stop`]: MetaService::stop
    fn start_daemon_watch(&self, prefix: &str, since_rev: Rev, callback: WatchCallback);

    /// Readiness check: point read of the probe key. A failure here blocks
    /// service start.
    async fn probe(&self) -> Result<()>;

    /// Cancel the daemon watch, and terminate the backing-store child
    /// process if this instance owns one. Idempotent; errors are swallowed.
    async fn stop(&self);
}

/// Store-backed meta service.
pub struct KvMetaService<S: KvStore> {
    store: Arc<S>,
    ctx: Arc<MetaContext>,
    config: MetaConfig,
    daemon: Mutex<Option<DaemonWatch>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

/// Meta service over a live etcd cluster.
pub type EtcdMetaService = KvMetaService<EtcdStore>;

/// Meta service for single-node deployments without an external consensus
/// store.
pub type LocalMetaService = KvMetaService<MemoryStore>;

impl<S: KvStore> KvMetaService<S> {
    pub fn new(store: Arc<S>, ctx: Arc<MetaContext>, config: MetaConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            ctx,
            config,
            daemon: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
        })
    }

    /// Adopt the backing-store child process launched for this instance; it
    /// is terminated on [`MetaService::stop`].
    pub async fn adopt_child(&self, child: Child) {
        *self.child.lock().await = Some(child);
    }

    /// Commit `changes` inside the instance sync-lock critical section.
    ///
    /// The lock is released on every path before the caller is completed;
    /// the reported revision is the one after the release. An empty change
    /// set releases immediately and completes with success.
    pub fn request_to_persist(self: &Arc<Self>, changes: Vec<MetaOp>, callback: CommitCallback) {
        let service = Arc::clone(self);
        let ctx = Arc::clone(&self.ctx);
        let sync_lock = self.config.sync_lock.clone();
        self.request_lock(
            &sync_lock,
            Box::new(move |locked| match locked {
                Err(error) => {
                    error!(%error, "failed to take the sync lock");
                    callback(Err(error), 0);
                }
                Ok(lock) => {
                    if changes.is_empty() {
                        tokio::spawn(async move {
                            let rev = lock.release().await.unwrap_or(0);
                            ctx.post(move || callback(Ok(()), rev));
                        });
                        return;
                    }
                    service.commit_updates(
                        changes,
                        Box::new(move |status, commit_rev| {
                            tokio::spawn(async move {
                                let rev = match lock.release().await {
                                    Ok(unlock_rev) => unlock_rev,
                                    Err(error) => {
                                        error!(%error, "failed to release the sync lock");
                                        commit_rev
                                    }
                                };
                                ctx.post(move || callback(status, rev));
                            });
                        }),
                    );
                }
            }),
        );
    }

    fn handler(&self) -> WatchHandler {
        WatchHandler::new(
            Arc::clone(&self.ctx),
            self.config.prefix.clone(),
            self.config.sync_lock_prefix(),
        )
    }
}

/// Map a chunk failure: once any earlier chunk has been applied, the caller
/// must learn that the batch made partial progress.
fn chunk_failure(applied: usize, error: MetaError) -> MetaError {
    if applied == 0 {
        return error;
    }
    match error {
        MetaError::Backend { code, message } => MetaError::PartialCommit {
            applied,
            code,
            message,
        },
        other => other,
    }
}

fn to_txn_ops(namespace: &str, changes: &[MetaOp]) -> Vec<TxnOp> {
    changes
        .iter()
        .map(|op| match op {
            MetaOp::Put { key, value, .. } => TxnOp::Put {
                key: format!("{}{}", namespace, key),
                value: value.clone(),
            },
            MetaOp::Del { key, .. } => TxnOp::Delete {
                key: format!("{}{}", namespace, key),
            },
        })
        .collect()
}

#[async_trait]
impl<S: KvStore> MetaService for KvMetaService<S> {
    fn request_all(&self, prefix: &str, _base_rev: Rev, callback: OpsCallback) {
        let store = Arc::clone(&self.store);
        let ctx = Arc::clone(&self.ctx);
        let namespace = self.config.prefix.clone();
        let full_prefix = self.config.scoped(prefix);
        tokio::spawn(async move {
            match store.range(&full_prefix).await {
                Ok(resp) => {
                    let scope = format!("{}/", namespace);
                    let mut ops = Vec::with_capacity(resp.kvs.len());
                    for kv in resp.kvs {
                        if kv.key.is_empty() {
                            continue;
                        }
                        if !kv.key.starts_with(&scope) {
                            // Ignore garbage values.
                            continue;
                        }
                        let op_key = kv.key[namespace.len()..].to_string();
                        // The whole snapshot is pinned at the response revision.
                        ops.push(MetaOp::put_at(op_key, kv.value, resp.rev));
                    }
                    debug!(keys = ops.len(), rev = resp.rev, "snapshot read");
                    let rev = resp.rev;
                    ctx.post(move || callback(Ok(()), ops, rev));
                }
                Err(error) => ctx.post(move || callback(Err(error), Vec::new(), 0)),
            }
        });
    }

    fn request_updates(&self, prefix: &str, since_rev: Rev, callback: OpsCallback) {
        let store = Arc::clone(&self.store);
        let ctx = Arc::clone(&self.ctx);
        let handler = self.handler();
        let full_prefix = self.config.scoped(prefix);
        tokio::spawn(async move {
            // Watching from the latest seen revision + 1.
            match store.watch(&full_prefix, since_rev + 1).await {
                Ok(mut subscription) => match subscription.recv().await {
                    Some(batch) => {
                        let ops = handler.translate(&batch);
                        let rev = batch.rev;
                        ctx.post(move || callback(Ok(()), ops, rev));
                    }
                    None => {
                        let error =
                            MetaError::backend(-1, "watch terminated before delivering updates");
                        ctx.post(move || callback(Err(error), Vec::new(), 0));
                    }
                },
                Err(error) => ctx.post(move || callback(Err(error), Vec::new(), 0)),
            }
        });
    }

    fn commit_updates(&self, changes: Vec<MetaOp>, callback: CommitCallback) {
        let store = Arc::clone(&self.store);
        let ctx = Arc::clone(&self.ctx);
        let namespace = self.config.prefix.clone();
        tokio::spawn(async move {
            // Split into chunks below the store's per-transaction cap. Every
            // chunk except the last is awaited in order; a failure abandons
            // the remainder without rolling back earlier chunks.
            let total = changes.len();
            let mut offset = 0;
            while offset + MAX_CHUNK_OPS < total {
                let chunk = to_txn_ops(&namespace, &changes[offset..offset + MAX_CHUNK_OPS]);
                match store.txn(chunk).await {
                    Ok(_) => offset += MAX_CHUNK_OPS,
                    Err(error) => {
                        let failure = chunk_failure(offset, error);
                        ctx.post(move || callback(Err(failure), 0));
                        return;
                    }
                }
            }
            let chunk = to_txn_ops(&namespace, &changes[offset..]);
            match store.txn(chunk).await {
                Ok(resp) => {
                    debug!(ops = total, rev = resp.rev, "commit applied");
                    ctx.post(move || callback(Ok(()), resp.rev));
                }
                Err(error) => {
                    let failure = chunk_failure(offset, error);
                    ctx.post(move || callback(Err(failure), 0));
                }
            }
        });
    }

    fn request_lock(&self, lock_name: &str, callback: LockCallback) {
        let store = Arc::clone(&self.store);
        let ctx = Arc::clone(&self.ctx);
        let name = self.config.scoped(lock_name);
        let acquire_site = std::backtrace::Backtrace::force_capture().to_string();
        let requested_at = Instant::now();
        debug!(lock = %name, "requesting lock");
        tokio::spawn(async move {
            match store.lock(&name).await {
                Ok(grant) => {
                    let unlocker: Arc<dyn Unlocker> = Arc::new(StoreUnlocker {
                        store: Arc::clone(&store),
                    });
                    let lock = DistributedLock::new(
                        name,
                        grant.rev,
                        grant.lock_key,
                        unlocker,
                        requested_at,
                        acquire_site,
                    );
                    ctx.post(move || callback(Ok(lock)));
                }
                Err(error) => ctx.post(move || callback(Err(error))),
            }
        });
    }

    fn start_daemon_watch(&self, prefix: &str, since_rev: Rev, callback: WatchCallback) {
        info!(prefix = %prefix, rev = since_rev, "starting daemon watch");
        let daemon = DaemonWatch::spawn(
            Arc::clone(&self.store),
            self.handler(),
            self.config.scoped(prefix),
            since_rev,
            self.config.backoff,
            callback,
        );
        if let Some(superseded) = self.daemon.lock().replace(daemon) {
            tokio::spawn(superseded.stop());
        }
    }

    async fn probe(&self) -> Result<()> {
        let key = self.config.probe_key_path();
        match self.store.get(&key).await {
            Ok(_) => Ok(()),
            Err(error) => Err(MetaError::Invalid(format!(
                "failed to start the meta service, backing store probe failed: {error}"
            ))),
        }
    }

    async fn stop(&self) {
        let daemon = self.daemon.lock().take();
        if let Some(daemon) = daemon {
            daemon.stop().await;
        }
        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            terminate_child(&mut child).await;
        }
    }
}

/// Signal the owned backing-store child and wait for it to exit, escalating
/// to a kill after a grace period. All errors are swallowed.
async fn terminate_child(child: &mut Child) {
    info!("terminating backing-store child process");
    if let Some(pid) = child.id() {
        // SAFETY: sending SIGTERM to a child process this instance spawned.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(CHILD_EXIT_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
    }
}
