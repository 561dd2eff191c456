//! Backing-store client adapter.
//!
//! Consolidates the consensus store's wire dialect (etcd v3 semantics)
//! behind one async trait, so the meta service can run against a live etcd
//! cluster or against the in-memory store used by tests and single-node
//! deployments.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Monotonic revision assigned by the backing store to every mutation.
/// Revisions are never reused; gaps are possible but values never decrease.
pub type Rev = u64;

/// Maximum operations the backing store accepts in one transaction.
pub const MAX_TXN_OPS: usize = 128;

/// Key-value pair returned from a range read.
#[derive(Debug, Clone)]
pub struct StoreKv {
    pub key: String,
    pub value: Vec<u8>,
}

/// Response of a range or point read; the snapshot is pinned at `rev`.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub kvs: Vec<StoreKv>,
    pub rev: Rev,
}

/// Response of a committed transaction.
#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub rev: Rev,
}

/// One mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Kind of a raw change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// Raw change event as delivered by the backing store.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the mutation was applied.
    pub mod_rev: Rev,
}

/// A batch of events. All events belonging to one transaction arrive in the
/// same batch.
#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    /// Store revision of the delivering response.
    pub rev: Rev,
}

/// A live watch. Dropping the subscription cancels the watch at the store;
/// `recv` returning `None` means the store side terminated it.
pub struct WatchSubscription {
    rx: mpsc::UnboundedReceiver<WatchBatch>,
}

impl WatchSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchBatch>) -> Self {
        Self { rx }
    }

    /// Wait for the next batch of events.
    pub async fn recv(&mut self) -> Option<WatchBatch> {
        self.rx.recv().await
    }
}

/// Grant returned from a successful lock acquisition. `lock_key` is the
/// opaque token passed back to `unlock`.
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub lock_key: Vec<u8>,
    pub rev: Rev,
}

/// Response of a lock release.
#[derive(Debug, Clone)]
pub struct UnlockResponse {
    pub rev: Rev,
}

/// Asynchronous primitives of the backing consensus store.
///
/// Every method maps to one wire operation; failures surface as
/// [`MetaError::Backend`](crate::error::MetaError::Backend) carrying the
/// store's code and message. Retrying is the caller's concern.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Recursive listing of all keys under `prefix`.
    async fn range(&self, prefix: &str) -> Result<RangeResponse>;

    /// Point read of a single key.
    async fn get(&self, key: &str) -> Result<RangeResponse>;

    /// Atomic apply of up to [`MAX_TXN_OPS`] operations. All-or-nothing per
    /// call.
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<TxnResponse>;

    /// Begin delivering events under `prefix` whose modification revision is
    /// at least `start_rev`. Tolerates `start_rev` in the past (catch-up) as
    /// well as at the current head (live).
    async fn watch(&self, prefix: &str, start_rev: Rev) -> Result<WatchSubscription>;

    /// Block at the store until the named lock is acquired.
    async fn lock(&self, name: &str) -> Result<LockGrant>;

    /// Release a previously acquired lock. Idempotency is the caller's
    /// responsibility.
    async fn unlock(&self, lock_key: &[u8]) -> Result<UnlockResponse>;
}
