//! etcd-backed implementation of the backing-store adapter.

use super::{
    KvStore, LockGrant, RangeResponse, StoreKv, TxnOp, TxnResponse, UnlockResponse, WatchBatch,
    WatchEvent, WatchEventKind, WatchSubscription, MAX_TXN_OPS,
};
use crate::error::{MetaError, Result};
use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, Txn, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Thin facade over an etcd v3 cluster.
///
/// The wrapped client is cheaply cloneable; each operation clones it, as its
/// RPC methods take `&mut self`.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to an etcd cluster.
    pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(map_err)?;
        Ok(Self { client })
    }

    /// Wrap an already-connected client (e.g. one handed over by the
    /// embedded launcher).
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_err(e: etcd_client::Error) -> MetaError {
    let code = match &e {
        etcd_client::Error::GRpcStatus(status) => status.code() as i32,
        _ => -1,
    };
    MetaError::Backend {
        code,
        message: e.to_string(),
    }
}

fn header_rev(header: Option<&etcd_client::ResponseHeader>) -> u64 {
    header.map(|h| h.revision() as u64).unwrap_or(0)
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn range(&self, prefix: &str) -> Result<RangeResponse> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| StoreKv {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();
        Ok(RangeResponse {
            kvs,
            rev: header_rev(resp.header()),
        })
    }

    async fn get(&self, key: &str) -> Result<RangeResponse> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(map_err)?;
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| StoreKv {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();
        Ok(RangeResponse {
            kvs,
            rev: header_rev(resp.header()),
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
        let mut client = self.client.clone();
        let etcd_ops: Vec<etcd_client::TxnOp> = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Put { key, value } => etcd_client::TxnOp::put(key, value, None),
                TxnOp::Delete { key } => etcd_client::TxnOp::delete(key, None),
            })
            .collect();
        let resp = client
            .txn(Txn::new().and_then(etcd_ops))
            .await
            .map_err(map_err)?;
        Ok(TxnResponse {
            rev: header_rev(resp.header()),
        })
    }

    async fn watch(&self, prefix: &str, start_rev: u64) -> Result<WatchSubscription> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_rev as i64);
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(map_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            debug!("etcd watch canceled by the server");
                            break;
                        }
                        let rev = header_rev(resp.header());
                        let events: Vec<WatchEvent> = resp
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                let kind = match event.event_type() {
                                    EventType::Put => WatchEventKind::Put,
                                    EventType::Delete => WatchEventKind::Delete,
                                };
                                Some(WatchEvent {
                                    kind,
                                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                                    value: kv.value().to_vec(),
                                    mod_rev: kv.mod_revision() as u64,
                                })
                            })
                            .collect();
                        if tx.send(WatchBatch { events, rev }).is_err() {
                            // Subscriber is gone; tear the watch down at the store.
                            let _ = watcher.cancel().await;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(error = %error, "etcd watch stream error");
                        break;
                    }
                }
            }
        });

        Ok(WatchSubscription::new(rx))
    }

    async fn lock(&self, name: &str) -> Result<LockGrant> {
        let mut client = self.client.clone();
        let resp = client.lock(name, None).await.map_err(map_err)?;
        Ok(LockGrant {
            lock_key: resp.key().to_vec(),
            rev: header_rev(resp.header()),
        })
    }

    async fn unlock(&self, lock_key: &[u8]) -> Result<UnlockResponse> {
        let mut client = self.client.clone();
        let resp = client.unlock(lock_key.to_vec()).await.map_err(map_err)?;
        Ok(UnlockResponse {
            rev: header_rev(resp.header()),
        })
    }
}
