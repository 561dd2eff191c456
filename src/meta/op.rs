//! Operation records exchanged with the metadata namespace.

use crate::store::Rev;
use std::fmt;

/// A single mutation of the metadata namespace.
///
/// Keys are namespace-relative (the configured prefix is stripped, the
/// leading `/` retained); values are opaque octet strings. The revision is
/// zero for operations built locally for a commit, and carries the store's
/// modification revision for operations observed from a snapshot or watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaOp {
    Put {
        key: String,
        value: Vec<u8>,
        rev: Rev,
    },
    Del {
        key: String,
        rev: Rev,
    },
}

impl MetaOp {
    /// Put operation to send to the backing store.
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MetaOp::Put {
            key: key.into(),
            value: value.into(),
            rev: 0,
        }
    }

    /// Put operation observed from the backing store at `rev`.
    pub fn put_at(key: impl Into<String>, value: impl Into<Vec<u8>>, rev: Rev) -> Self {
        MetaOp::Put {
            key: key.into(),
            value: value.into(),
            rev,
        }
    }

    /// Delete operation to send to the backing store.
    pub fn del(key: impl Into<String>) -> Self {
        MetaOp::Del {
            key: key.into(),
            rev: 0,
        }
    }

    /// Delete operation observed from the backing store at `rev`.
    pub fn del_at(key: impl Into<String>, rev: Rev) -> Self {
        MetaOp::Del {
            key: key.into(),
            rev,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MetaOp::Put { key, .. } | MetaOp::Del { key, .. } => key,
        }
    }

    pub fn rev(&self) -> Rev {
        match self {
            MetaOp::Put { rev, .. } | MetaOp::Del { rev, .. } => *rev,
        }
    }
}

impl fmt::Display for MetaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaOp::Put { key, value, rev } => {
                write!(f, "put [{}] {} -> {}", rev, key, String::from_utf8_lossy(value))
            }
            MetaOp::Del { key, rev } => write!(f, "del [{}] {}", rev, key),
        }
    }
}
