//! Storage backend contract.
//!
//! The booking core never talks to a database directly. It needs four
//! operations over a hierarchical key space (`write`, `read`, `delete`,
//! `subscribe`), where a subscription delivers the full value at its path
//! after every change. [`local::LocalBackend`] is the in-process reference
//! implementation, persisted through the WAL.

pub mod compactor;
pub mod local;
mod notify;
mod path;
pub mod wal;

pub use path::KeyPath;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// Monotonic stamp assigned by the backend to every committed mutation.
pub type Revision = u64;

pub const RESERVATIONS: &str = "reservations";
pub const INSTRUMENTS: &str = "instruments";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The value at a watched path as of `revision`. `None` means absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub revision: Revision,
    pub value: Option<Value>,
}

/// Live view of one path: the value at subscribe time, then every change.
pub struct Watch {
    path: KeyPath,
    initial: Option<Versioned>,
    rx: broadcast::Receiver<Versioned>,
}

impl Watch {
    pub(crate) fn new(path: KeyPath, initial: Versioned, rx: broadcast::Receiver<Versioned>) -> Self {
        Self {
            path,
            initial: Some(initial),
            rx,
        }
    }

    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    /// Next full value at the path. `None` once the backend is gone.
    /// A lagging reader skips to the newest buffered delivery.
    pub async fn next(&mut self) -> Option<Versioned> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("watch {} skipped {skipped} deliveries", self.path);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn write(&self, path: &KeyPath, value: Value) -> Result<Revision, StorageError>;

    /// Current value at `path` together with the revision it was read at.
    async fn read_versioned(&self, path: &KeyPath) -> Result<Versioned, StorageError>;

    async fn read(&self, path: &KeyPath) -> Result<Option<Value>, StorageError> {
        Ok(self.read_versioned(path).await?.value)
    }

    async fn delete(&self, path: &KeyPath) -> Result<Revision, StorageError>;

    async fn subscribe(&self, path: &KeyPath) -> Result<Watch, StorageError>;
}

pub fn collection(name: &str) -> KeyPath {
    KeyPath::root().child(name)
}

pub fn record_path(collection_name: &str, id: u64) -> KeyPath {
    collection(collection_name).child(id)
}
