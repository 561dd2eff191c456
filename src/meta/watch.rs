//! Watch-event translation and the self-healing daemon watch.

use super::{MetaOp, WatchCallback};
use crate::context::MetaContext;
use crate::store::{KvStore, Rev, WatchBatch, WatchEventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Translates raw backing-store event batches into namespace-relative
/// operation records and posts the resulting callback on the serial
/// context, never inline.
pub(crate) struct WatchHandler {
    ctx: Arc<MetaContext>,
    prefix: String,
    filter_prefix: String,
}

impl WatchHandler {
    pub(crate) fn new(ctx: Arc<MetaContext>, prefix: String, filter_prefix: String) -> Self {
        Self {
            ctx,
            prefix,
            filter_prefix,
        }
    }

    /// Filter and strip one batch, preserving event order.
    pub(crate) fn translate(&self, batch: &WatchBatch) -> Vec<MetaOp> {
        let scope = format!("{}/", self.prefix);
        let mut ops = Vec::with_capacity(batch.events.len());
        for event in &batch.events {
            if !self.filter_prefix.is_empty() && event.key.starts_with(&self.filter_prefix) {
                // Instance-lock traffic is internal to the store's lock primitive.
                continue;
            }
            if !event.key.starts_with(&scope) {
                // Ignore garbage values.
                continue;
            }
            let op_key = event.key[self.prefix.len()..].to_string();
            match event.kind {
                WatchEventKind::Put => {
                    ops.push(MetaOp::put_at(op_key, event.value.clone(), event.mod_rev))
                }
                WatchEventKind::Delete => ops.push(MetaOp::del_at(op_key, event.mod_rev)),
            }
        }
        ops
    }

    /// Translate `batch` and post exactly one completion for it.
    pub(crate) fn dispatch(&self, batch: &WatchBatch, callback: &WatchCallback) {
        debug!(events = batch.events.len(), rev = batch.rev, "watch batch");
        let ops = self.translate(batch);
        let rev = batch.rev;
        let callback = Arc::clone(callback);
        self.ctx.post(move || callback(Ok(()), ops, rev));
    }
}

/// The long-lived, self-healing subscription behind `start_daemon_watch`.
///
/// A single driver task walks the states: subscribing, watching, backing
/// off. Resumption is always at the last observed raw revision plus one, so
/// nothing is redelivered and, while the store's history window holds, no
/// gap is possible. Transient terminations are retried locally and never
/// surface to the caller; a non-retryable subscription error ends the loop,
/// and `stop` is the only other way out.
pub(crate) struct DaemonWatch {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DaemonWatch {
    pub(crate) fn spawn<S: KvStore>(
        store: Arc<S>,
        handler: WatchHandler,
        watch_prefix: String,
        since_rev: Rev,
        backoff: Duration,
        callback: WatchCallback,
    ) -> Self {
        let (cancel, mut cancelled) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut current_rev = since_rev;
            loop {
                // Subscribing: watch from the next unseen revision.
                let subscription = tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            return;
                        }
                        continue;
                    }
                    result = store.watch(&watch_prefix, current_rev + 1) => result,
                };
                match subscription {
                    Ok(mut subscription) => loop {
                        tokio::select! {
                            changed = cancelled.changed() => {
                                if changed.is_err() || *cancelled.borrow() {
                                    return;
                                }
                            }
                            batch = subscription.recv() => match batch {
                                Some(batch) => {
                                    // Track the raw revision before filtering, so
                                    // filtered-out traffic still advances resumption.
                                    if let Some(last) = batch.events.last() {
                                        current_rev = current_rev.max(last.mod_rev);
                                    }
                                    handler.dispatch(&batch, &callback);
                                }
                                // Terminated at the store side.
                                None => break,
                            }
                        }
                    },
                    Err(error) => {
                        if !error.is_retryable() {
                            error!(
                                %error,
                                prefix = %watch_prefix,
                                "daemon watch failed with a non-retryable error, giving up"
                            );
                            return;
                        }
                        error!(%error, prefix = %watch_prefix, "failed to establish daemon watch");
                    }
                }
                // Backing off before the next subscription attempt.
                info!(
                    delay_secs = backoff.as_secs_f64(),
                    rev = current_rev,
                    "daemon watch disconnected, will resubscribe"
                );
                tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        });
        Self { cancel, task }
    }

    /// Cancel the subscription and wait for the driver task to wind down.
    /// Errors are swallowed; stopping twice is harmless.
    pub(crate) async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MetaError, Result};
    use crate::store::{
        LockGrant, RangeResponse, TxnOp, TxnResponse, UnlockResponse, WatchEvent,
        WatchSubscription,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler() -> WatchHandler {
        WatchHandler::new(
            MetaContext::new(),
            "/nimbus".to_string(),
            "/nimbus/meta_sync_lock".to_string(),
        )
    }

    fn event(kind: WatchEventKind, key: &str, value: &str, rev: Rev) -> WatchEvent {
        WatchEvent {
            kind,
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            mod_rev: rev,
        }
    }

    #[tokio::test]
    async fn test_translate_strips_namespace_prefix() {
        let batch = WatchBatch {
            events: vec![event(WatchEventKind::Put, "/nimbus/data/o1", "{}", 4)],
            rev: 4,
        };
        let ops = handler().translate(&batch);
        assert_eq!(ops, vec![MetaOp::put_at("/data/o1", b"{}".to_vec(), 4)]);
    }

    #[tokio::test]
    async fn test_translate_drops_sync_lock_traffic() {
        let batch = WatchBatch {
            events: vec![
                event(WatchEventKind::Put, "/nimbus/meta_sync_lock/abc", "", 5),
                event(WatchEventKind::Put, "/nimbus/data/o1", "{}", 5),
                event(WatchEventKind::Delete, "/nimbus/meta_sync_lock/abc", "", 6),
            ],
            rev: 6,
        };
        let ops = handler().translate(&batch);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].key(), "/data/o1");
    }

    #[tokio::test]
    async fn test_translate_drops_garbage_keys() {
        let batch = WatchBatch {
            events: vec![
                event(WatchEventKind::Put, "/elsewhere/x", "v", 7),
                event(WatchEventKind::Put, "/nimbusser/x", "v", 7),
                event(WatchEventKind::Delete, "/nimbus/x", "", 7),
            ],
            rev: 7,
        };
        let ops = handler().translate(&batch);
        assert_eq!(ops, vec![MetaOp::del_at("/x", 7)]);
    }

    #[tokio::test]
    async fn test_translate_preserves_order() {
        let batch = WatchBatch {
            events: vec![
                event(WatchEventKind::Put, "/nimbus/a", "1", 8),
                event(WatchEventKind::Delete, "/nimbus/b", "", 8),
                event(WatchEventKind::Put, "/nimbus/c", "3", 8),
            ],
            rev: 8,
        };
        let keys: Vec<_> = handler()
            .translate(&batch)
            .iter()
            .map(|op| op.key().to_string())
            .collect();
        assert_eq!(keys, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn test_dispatch_posts_on_context() {
        let handler = handler();
        let delivered: Arc<Mutex<Vec<(Result<()>, Vec<MetaOp>, Rev)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let callback: WatchCallback =
            Arc::new(move |status, ops, rev| sink.lock().push((status, ops, rev)));

        let batch = WatchBatch {
            events: vec![event(WatchEventKind::Put, "/nimbus/a", "1", 9)],
            rev: 9,
        };
        handler.dispatch(&batch, &callback);
        // Delivery is posted, never inline.
        assert!(delivered.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = delivered.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].0.is_ok());
        assert_eq!(seen[0].2, 9);
    }

    /// Store whose watch construction always fails, counting the attempts.
    struct FailingStore {
        retryable: bool,
        watch_calls: AtomicUsize,
    }

    impl FailingStore {
        fn new(retryable: bool) -> Arc<Self> {
            Arc::new(Self {
                retryable,
                watch_calls: AtomicUsize::new(0),
            })
        }

        fn error(&self) -> MetaError {
            if self.retryable {
                MetaError::backend(14, "store unavailable")
            } else {
                MetaError::Invalid("watch rejected".to_string())
            }
        }
    }

    #[async_trait]
    impl KvStore for FailingStore {
        async fn range(&self, _prefix: &str) -> Result<RangeResponse> {
            Err(self.error())
        }

        async fn get(&self, _key: &str) -> Result<RangeResponse> {
            Err(self.error())
        }

        async fn txn(&self, _ops: Vec<TxnOp>) -> Result<TxnResponse> {
            Err(self.error())
        }

        async fn watch(&self, _prefix: &str, _start_rev: Rev) -> Result<WatchSubscription> {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error())
        }

        async fn lock(&self, _name: &str) -> Result<LockGrant> {
            Err(self.error())
        }

        async fn unlock(&self, _lock_key: &[u8]) -> Result<UnlockResponse> {
            Err(self.error())
        }
    }

    fn spawn_daemon(store: Arc<FailingStore>) -> DaemonWatch {
        let callback: WatchCallback = Arc::new(|_, _, _| {});
        DaemonWatch::spawn(
            store,
            handler(),
            "/nimbus".to_string(),
            0,
            Duration::from_millis(20),
            callback,
        )
    }

    #[tokio::test]
    async fn test_daemon_watch_backs_off_and_retries_retryable_errors() {
        let store = FailingStore::new(true);
        let daemon = spawn_daemon(Arc::clone(&store));

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(store.watch_calls.load(Ordering::SeqCst) >= 2);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_daemon_watch_gives_up_on_non_retryable_errors() {
        let store = FailingStore::new(false);
        let daemon = spawn_daemon(Arc::clone(&store));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.watch_calls.load(Ordering::SeqCst), 1);
        daemon.stop().await;
    }
}
