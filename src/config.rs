//! Configuration for the Nimbus metadata service.

use crate::error::{MetaError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default subtree (under the namespace prefix) used by the backing store's
/// lock primitive for the instance sync lock.
const DEFAULT_SYNC_LOCK: &str = "/meta_sync_lock";

/// Default key (under the namespace prefix) read by the readiness probe.
const DEFAULT_PROBE_KEY: &str = "/meta_probe";

/// Default delay before a disconnected daemon watch re-subscribes.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Configuration of a metadata-service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Namespace root for this deployment. Every key this instance reads or
    /// writes is rooted here.
    pub prefix: String,

    /// Opaque configuration forwarded to the embedded backing-store
    /// launcher. The `type` field selects the backend (`etcd` or `local`);
    /// the rest is backend-specific.
    #[serde(default)]
    pub metastore_spec: serde_json::Value,

    /// Subtree whose events are filtered out of watch output. The backing
    /// store's lock primitive mutates keys under it.
    #[serde(default = "default_sync_lock")]
    pub sync_lock: String,

    /// Key used by the readiness probe.
    #[serde(default = "default_probe_key")]
    pub probe_key: String,

    /// Delay before a disconnected daemon watch re-subscribes.
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff: Duration,
}

fn default_sync_lock() -> String {
    DEFAULT_SYNC_LOCK.to_string()
}

fn default_probe_key() -> String {
    DEFAULT_PROBE_KEY.to_string()
}

fn default_backoff() -> Duration {
    DEFAULT_BACKOFF
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            prefix: "/nimbus".to_string(),
            metastore_spec: serde_json::Value::Null,
            sync_lock: default_sync_lock(),
            probe_key: default_probe_key(),
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl MetaConfig {
    /// Create a configuration rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// A minimal development configuration backed by the in-memory store.
    pub fn development() -> Self {
        Self {
            prefix: "/nimbus-dev".to_string(),
            metastore_spec: serde_json::json!({ "type": "local" }),
            ..Default::default()
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || !self.prefix.starts_with('/') {
            return Err(MetaError::InvalidConfig {
                field: "prefix".to_string(),
                reason: "namespace prefix must be non-empty and absolute".to_string(),
            });
        }
        if self.prefix.ends_with('/') {
            return Err(MetaError::InvalidConfig {
                field: "prefix".to_string(),
                reason: "namespace prefix must not end with '/'".to_string(),
            });
        }
        for (field, value) in [("sync_lock", &self.sync_lock), ("probe_key", &self.probe_key)] {
            if !value.starts_with('/') {
                return Err(MetaError::InvalidConfig {
                    field: field.to_string(),
                    reason: "subtree keys must start with '/'".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Root a namespace-relative key under the configured prefix.
    pub fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// The full key subtree of the instance sync lock.
    pub fn sync_lock_prefix(&self) -> String {
        self.scoped(&self.sync_lock)
    }

    /// The full key read by the readiness probe.
    pub fn probe_key_path(&self) -> String {
        self.scoped(&self.probe_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MetaConfig::default();
        assert_eq!(config.sync_lock, "/meta_sync_lock");
        assert_eq!(config.probe_key, "/meta_probe");
        assert_eq!(config.backoff, Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_derived_keys() {
        let config = MetaConfig::new("/nimbus");
        assert_eq!(config.sync_lock_prefix(), "/nimbus/meta_sync_lock");
        assert_eq!(config.probe_key_path(), "/nimbus/meta_probe");
        assert_eq!(config.scoped("/data/o1"), "/nimbus/data/o1");
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        assert!(MetaConfig::new("").validate().is_err());
        assert!(MetaConfig::new("nimbus").validate().is_err());
        assert!(MetaConfig::new("/nimbus/").validate().is_err());
        assert!(MetaConfig::new("/nimbus").validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: MetaConfig = serde_json::from_str(
            r#"{ "prefix": "/n", "metastore_spec": { "type": "local" }, "backoff": "2s" }"#,
        )
        .unwrap();
        assert_eq!(config.backoff, Duration::from_secs(2));
        assert_eq!(config.sync_lock, "/meta_sync_lock");
    }
}
