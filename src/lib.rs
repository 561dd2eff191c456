//! Nimbus metadata-coordination core.
//!
//! This crate is the metadata backbone of Nimbus, a distributed in-memory
//! object store. It projects a strongly-consistent, revision-ordered
//! key-value namespace (backed by an external consensus store with etcd v3
//! semantics) into a server-local event stream, serializes mutations
//! through bounded transactions, and arbitrates cluster-wide critical
//! sections through distributed locks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Hosting server                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  MetaService: snapshot | catch-up | commit | lock | watch    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  WatchHandler + DaemonWatch: filter, strip, reconnect        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  KvStore adapter: EtcdStore (cluster) | MemoryStore (local)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All caller-visible completions are posted on a serial
//! [`MetaContext`], never invoked inline, so callers observe a cooperative
//! single-threaded model while I/O proceeds in parallel underneath.
//!
//! # Quick start
//!
//! ```no_run
//! use nimbus_meta::{create, MetaConfig, MetaContext};
//!
//! #[tokio::main]
//! async fn main() -> nimbus_meta::Result<()> {
//!     let ctx = MetaContext::new();
//!     let service = create(MetaConfig::development(), ctx).await?;
//!     service.probe().await?;
//!     service.request_all("", 0, Box::new(|status, ops, rev| {
//!         println!("snapshot at {rev}: {} keys ({status:?})", ops.len());
//!     }));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod meta;
pub mod store;

pub use config::MetaConfig;
pub use context::MetaContext;
pub use error::{MetaError, Result};
pub use lock::{DistributedLock, Unlocker};
pub use meta::{
    create, CommitCallback, EtcdMetaService, KvMetaService, LocalMetaService, LockCallback,
    MetaOp, MetaService, OpsCallback, WatchCallback, MAX_CHUNK_OPS,
};
pub use store::{EtcdStore, KvStore, MemoryStore, Rev, MAX_TXN_OPS};
