//! The metadata-coordination service.
//!
//! Projects the revision-ordered key-value namespace of the backing
//! consensus store into a server-local event stream, serializes mutations
//! through bounded transactions, and arbitrates cluster-wide critical
//! sections through distributed locks.

mod op;
mod service;
mod watch;

pub use op::MetaOp;
pub use service::{
    EtcdMetaService, KvMetaService, LocalMetaService, MetaService, MAX_CHUNK_OPS,
};

use crate::config::MetaConfig;
use crate::context::MetaContext;
use crate::error::{MetaError, Result};
use crate::lock::DistributedLock;
use crate::store::{EtcdStore, MemoryStore, Rev};
use std::sync::Arc;

/// One-shot completion of a snapshot or catch-up read: status, operation
/// records, and the revision the response was pinned at.
pub type OpsCallback = Box<dyn FnOnce(Result<()>, Vec<MetaOp>, Rev) + Send>;

/// Repeated completion of the daemon watch, one call per delivered batch.
pub type WatchCallback = Arc<dyn Fn(Result<()>, Vec<MetaOp>, Rev) + Send + Sync>;

/// Completion of a commit: status and the revision after the final chunk.
pub type CommitCallback = Box<dyn FnOnce(Result<()>, Rev) + Send>;

/// Completion of a lock acquisition.
pub type LockCallback = Box<dyn FnOnce(Result<DistributedLock>) + Send>;

/// Create a meta service from `config.metastore_spec`.
///
/// `metastore_spec.type` selects the backend: `"etcd"` (the default)
/// connects to the cluster named by `metastore_spec.endpoints`; `"local"`
/// serves single-node deployments from the in-memory store.
pub async fn create(config: MetaConfig, ctx: Arc<MetaContext>) -> Result<Arc<dyn MetaService>> {
    config.validate()?;
    let kind = config
        .metastore_spec
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("etcd");
    match kind {
        "etcd" => {
            let endpoints: Vec<String> = config
                .metastore_spec
                .get("endpoints")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if endpoints.is_empty() {
                return Err(MetaError::InvalidConfig {
                    field: "metastore_spec.endpoints".to_string(),
                    reason: "etcd backend requires at least one endpoint".to_string(),
                });
            }
            let store = Arc::new(EtcdStore::connect(endpoints).await?);
            Ok(KvMetaService::new(store, ctx, config) as Arc<dyn MetaService>)
        }
        "local" => {
            let store = Arc::new(MemoryStore::new());
            Ok(KvMetaService::new(store, ctx, config) as Arc<dyn MetaService>)
        }
        other => Err(MetaError::InvalidConfig {
            field: "metastore_spec.type".to_string(),
            reason: format!("unknown backend '{other}'"),
        }),
    }
}
