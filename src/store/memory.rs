//! In-memory implementation of the backing-store adapter.
//!
//! Serves two roles: the backend of single-node deployments that have no
//! external consensus store, and the test double for everything above the
//! adapter. It reproduces the contract the meta service relies on:
//! monotonic revisions, one event batch per transaction, catch-up watches,
//! and a FIFO blocking lock whose acquisition and release mutate keys under
//! the lock name.

use super::{
    KvStore, LockGrant, RangeResponse, StoreKv, TxnOp, TxnResponse, UnlockResponse, WatchBatch,
    WatchEvent, WatchEventKind, WatchSubscription, MAX_TXN_OPS,
};
use crate::error::{MetaError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

struct WatchFeed {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchBatch>,
}

#[derive(Default)]
struct LockQueue {
    holder: Option<Vec<u8>>,
    waiters: VecDeque<oneshot::Sender<LockGrant>>,
}

#[derive(Default)]
struct MemoryShared {
    kvs: BTreeMap<String, Vec<u8>>,
    rev: u64,
    history: Vec<WatchEvent>,
    watchers: Vec<WatchFeed>,
    locks: HashMap<String, LockQueue>,
    txn_sizes: Vec<usize>,
    txn_count: usize,
    fail_txn_at: Option<usize>,
}

/// In-memory backing store.
#[derive(Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryShared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current head revision.
    pub fn current_rev(&self) -> u64 {
        self.shared.lock().rev
    }

    /// Operation counts of every transaction applied so far.
    pub fn txn_sizes(&self) -> Vec<usize> {
        self.shared.lock().txn_sizes.clone()
    }

    /// Fail the `nth` transaction submitted from now on (0 fails the next
    /// one). The failure consumes itself; later transactions succeed.
    pub fn fail_nth_txn(&self, nth: usize) {
        let mut shared = self.shared.lock();
        shared.fail_txn_at = Some(shared.txn_count + nth);
    }

    /// Sever all live watches without cancelling them, as a restart of the
    /// backing store would. Subscribers observe stream termination.
    pub fn sever_watches(&self) {
        self.shared.lock().watchers.clear();
    }
}

/// Apply one transaction: bump the revision once, record and fan out the
/// resulting events as a single batch.
fn apply(shared: &mut MemoryShared, ops: Vec<TxnOp>) -> u64 {
    shared.rev += 1;
    let rev = shared.rev;
    let mut events = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            TxnOp::Put { key, value } => {
                shared.kvs.insert(key.clone(), value.clone());
                events.push(WatchEvent {
                    kind: WatchEventKind::Put,
                    key,
                    value,
                    mod_rev: rev,
                });
            }
            TxnOp::Delete { key } => {
                // Deleting an absent key emits no event.
                if shared.kvs.remove(&key).is_some() {
                    events.push(WatchEvent {
                        kind: WatchEventKind::Delete,
                        key,
                        value: Vec::new(),
                        mod_rev: rev,
                    });
                }
            }
        }
    }
    if events.is_empty() {
        return rev;
    }
    shared.history.extend(events.iter().cloned());
    shared.watchers.retain(|feed| {
        let selected: Vec<WatchEvent> = events
            .iter()
            .filter(|event| event.key.starts_with(&feed.prefix))
            .cloned()
            .collect();
        if selected.is_empty() {
            !feed.tx.is_closed()
        } else {
            feed.tx
                .send(WatchBatch {
                    events: selected,
                    rev,
                })
                .is_ok()
        }
    });
    rev
}

/// Mark the named lock held and record the ownership key, mirroring the way
/// the real store's lock primitive writes under the lock name.
fn grant_locked(shared: &mut MemoryShared, name: &str) -> LockGrant {
    let lock_key = format!("{}/{}", name, Uuid::new_v4());
    let rev = apply(
        shared,
        vec![TxnOp::Put {
            key: lock_key.clone(),
            value: Vec::new(),
        }],
    );
    shared.locks.get_mut(name).expect("lock queue exists").holder = Some(lock_key.clone().into_bytes());
    LockGrant {
        lock_key: lock_key.into_bytes(),
        rev,
    }
}

/// Hand a freed lock to the next live waiter, if any.
fn hand_over(shared: &mut MemoryShared, name: &str) {
    loop {
        let waiter = shared
            .locks
            .get_mut(name)
            .and_then(|queue| queue.waiters.pop_front());
        let Some(tx) = waiter else {
            return;
        };
        if tx.is_closed() {
            continue;
        }
        let grant = grant_locked(shared, name);
        if tx.send(grant).is_err() {
            // Waiter vanished between the check and the send; free the lock
            // again and keep draining the queue.
            let holder = shared
                .locks
                .get_mut(name)
                .and_then(|queue| queue.holder.take());
            if let Some(key) = holder {
                let key = String::from_utf8_lossy(&key).into_owned();
                apply(shared, vec![TxnOp::Delete { key }]);
            }
            continue;
        }
        return;
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn range(&self, prefix: &str) -> Result<RangeResponse> {
        let shared = self.shared.lock();
        let kvs = shared
            .kvs
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| StoreKv {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(RangeResponse {
            kvs,
            rev: shared.rev,
        })
    }

    async fn get(&self, key: &str) -> Result<RangeResponse> {
        let shared = self.shared.lock();
        let kvs = shared
            .kvs
            .get(key)
            .map(|value| StoreKv {
                key: key.to_string(),
                value: value.clone(),
            })
            .into_iter()
            .collect();
        Ok(RangeResponse {
            kvs,
            rev: shared.rev,
        })
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<TxnResponse> {
        if ops.len() > MAX_TXN_OPS {
            return Err(MetaError::Invalid(format!(
                "transaction carries {} operations, store cap is {}",
                ops.len(),
                MAX_TXN_OPS
            )));
        }
        let mut shared = self.shared.lock();
        let seq = shared.txn_count;
        shared.txn_count += 1;
        if shared.fail_txn_at == Some(seq) {
            shared.fail_txn_at = None;
            return Err(MetaError::backend(14, "injected transaction failure"));
        }
        shared.txn_sizes.push(ops.len());
        let rev = apply(&mut shared, ops);
        Ok(TxnResponse { rev })
    }

    async fn watch(&self, prefix: &str, start_rev: u64) -> Result<WatchSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        let backlog: Vec<WatchEvent> = shared
            .history
            .iter()
            .filter(|event| event.mod_rev >= start_rev && event.key.starts_with(prefix))
            .cloned()
            .collect();
        if !backlog.is_empty() {
            let rev = shared.rev;
            let _ = tx.send(WatchBatch {
                events: backlog,
                rev,
            });
        }
        shared.watchers.push(WatchFeed {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchSubscription::new(rx))
    }

    async fn lock(&self, name: &str) -> Result<LockGrant> {
        let waiter = {
            let mut shared = self.shared.lock();
            let free = shared
                .locks
                .entry(name.to_string())
                .or_default()
                .holder
                .is_none();
            if free {
                return Ok(grant_locked(&mut shared, name));
            }
            let (tx, rx) = oneshot::channel();
            shared
                .locks
                .get_mut(name)
                .expect("lock queue exists")
                .waiters
                .push_back(tx);
            rx
        };
        waiter
            .await
            .map_err(|_| MetaError::backend(-1, "lock queue torn down"))
    }

    async fn unlock(&self, lock_key: &[u8]) -> Result<UnlockResponse> {
        let mut shared = self.shared.lock();
        let name = shared
            .locks
            .iter()
            .find(|(_, queue)| queue.holder.as_deref() == Some(lock_key))
            .map(|(name, _)| name.clone());
        let Some(name) = name else {
            return Err(MetaError::backend(5, "lock key is not held"));
        };
        let key = String::from_utf8_lossy(lock_key).into_owned();
        let rev = apply(&mut shared, vec![TxnOp::Delete { key }]);
        shared
            .locks
            .get_mut(&name)
            .expect("lock queue exists")
            .holder = None;
        hand_over(&mut shared, &name);
        Ok(UnlockResponse { rev })
    }
}
