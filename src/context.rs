//! Serial execution context for caller-visible completions.
//!
//! Backing-store operations run on their own tasks; their completions are
//! posted here and drained one at a time. Callers observe a cooperative
//! single-threaded model while I/O proceeds in parallel underneath.

use std::sync::Arc;
use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The server-provided message loop on which every caller-visible callback
/// is delivered. Completions are posted, never invoked inline.
pub struct MetaContext {
    tx: mpsc::UnboundedSender<Task>,
}

impl MetaContext {
    /// Create a context and spawn its drain task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Arc::new(Self { tx })
    }

    /// Enqueue a task for execution on the serial context.
    ///
    /// Posting after the hosting runtime tears the drain task down is a
    /// no-op; in-flight completions may still land during shutdown.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_posts_run_in_order() {
        let ctx = MetaContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            ctx.post(move || seen.lock().push(i));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_posts_from_multiple_tasks_are_serialized() {
        let ctx = MetaContext::new();
        let running = Arc::new(Mutex::new(0u32));
        let max_seen = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = Arc::clone(&ctx);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let running = Arc::clone(&running);
                    let max_seen = Arc::clone(&max_seen);
                    ctx.post(move || {
                        let now = {
                            let mut r = running.lock();
                            *r += 1;
                            *r
                        };
                        {
                            let mut m = max_seen.lock();
                            *m = (*m).max(now);
                        }
                        *running.lock() -= 1;
                    });
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*max_seen.lock(), 1);
    }
}
