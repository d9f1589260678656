//! Shape cache core for a Postgres-to-client incremental replication
//! service.
//!
//! # Purpose
//! A *shape* is a declarative subset of one table (root table, optional row
//! predicate, projection). Clients resolve a shape to a stable handle, read
//! an initial snapshot from the shape's storage, then tail an append-only
//! log of row changes. This crate is the server-side core that makes that
//! work: the [`ShapeCache`] coordinator assigns handles, builds each
//! snapshot exactly once, supervises one long-lived consumer per shape,
//! recovers all shapes across restarts, and tears shapes down when their
//! table's schema drifts.
//!
//! # What this crate is NOT
//! The HTTP/streaming client API, the logical-replication decoder, the
//! Postgres column inspector and the telemetry exporter are external
//! collaborators. They connect through the types in [`collector`], the
//! [`inspector::Inspector`] trait and the storage traits in
//! `riptide-storage`.
pub mod cache;
pub mod collector;
pub mod config;
pub mod consumer;
pub mod inspector;
pub mod observability;
pub mod snapshotter;
pub mod status;
pub mod supervisor;

pub use cache::{ShapeCache, ShapeCacheOptions};
pub use collector::CollectorMessage;
pub use config::CacheConfig;
pub use consumer::{ConsumerMsg, ShutdownMode};
pub use inspector::{Inspector, NoopInspector};
pub use snapshotter::{
    NoopTablePreparer, PostgresSnapshotSource, SnapshotSession, SnapshotSource, TablePreparer,
};
pub use status::{ShapeRecord, ShapeStatus, SnapshotState};

use riptide_shapes::{LogOffset, ShapeHandle};
use riptide_storage::StorageError;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown shape handle: {0}")]
    UnknownHandle(ShapeHandle),
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("non-monotonic offset for shape {handle}: {current} -> {offset}")]
    NonMonotonicOffset {
        handle: ShapeHandle,
        current: LogOffset,
        offset: LogOffset,
    },
    #[error("timed out waiting for snapshot start")]
    AwaitTimeout,
    #[error("shape cache is shut down")]
    Shutdown,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}
