// Storage surfaces for the shape cache: the per-shape snapshot/log backend
// and the persistent key-value mirror the status registry writes through to.
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use riptide_shapes::{Change, ChangeKind, LogOffset, ShapeHandle};

pub mod file_kv;
pub mod kv;
pub mod memory;

pub use file_kv::FileKv;
pub use kv::{InMemoryKv, KvStore};
pub use memory::{InMemoryStorage, InMemoryStorageProvider};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Queue depth for snapshot/log reader channels. Readers that stall apply
/// backpressure to the feeder task instead of buffering unboundedly.
pub const STREAM_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("snapshot missing")]
    SnapshotMissing,
    #[error("snapshot stream failed: {0}")]
    Stream(String),
    #[error("corrupt entry for key {0}")]
    Corruption(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry in a shape's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    pub offset: LogOffset,
    pub kind: ChangeKind,
    pub key: String,
    pub record: serde_json::Value,
}

impl From<&Change> for LogItem {
    fn from(change: &Change) -> Self {
        Self {
            offset: change.offset,
            kind: change.kind,
            key: change.key.clone(),
            record: change.record.clone(),
        }
    }
}

/// Per-shape storage: a snapshot byte stream plus an append-only log keyed
/// by offset. Exclusively owned by the shape's consumer; no cross-shape
/// sharing.
///
/// Row streams are `mpsc` receivers rather than `Stream` impls so feeder
/// tasks can own their source end-to-end and readers get backpressure for
/// free.
#[async_trait]
pub trait ShapeStorage: Send + Sync {
    /// Whether snapshot creation has begun for this shape. Stays true once
    /// set, until `cleanup`.
    async fn snapshot_started(&self) -> Result<bool>;

    /// Consume `rows` into a new snapshot. An `Err` item from the producer
    /// is recorded and surfaced to later readers of the snapshot.
    async fn make_new_snapshot(
        &self,
        rows: mpsc::Receiver<anyhow::Result<Bytes>>,
    ) -> Result<()>;

    /// The snapshot's commit offset (always [`LogOffset::ZERO`]) and its row
    /// stream. Errors with [`StorageError::SnapshotMissing`] when no
    /// snapshot exists.
    async fn get_snapshot(&self) -> Result<(LogOffset, mpsc::Receiver<Result<Bytes>>)>;

    /// Append log entries. Items must arrive in offset order.
    async fn append_to_log(&self, items: Vec<LogItem>) -> Result<()>;

    /// Entries with offsets strictly greater than `from`, in offset order.
    async fn get_log_stream(&self, from: LogOffset) -> Result<mpsc::Receiver<LogItem>>;

    /// Delete the snapshot and the log.
    async fn cleanup(&self) -> Result<()>;
}

/// Hands out the storage owned by each shape handle. The same handle maps
/// to the same storage for the provider's lifetime, which is what lets a
/// restarted coordinator find the data its previous incarnation wrote.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn for_shape(&self, handle: &ShapeHandle) -> Result<Arc<dyn ShapeStorage>>;
}
