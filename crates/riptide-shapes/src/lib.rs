// Shared data types for the shape cache: shape definitions, fingerprints,
// handles, log offsets, relations and replication change payloads.
pub mod change;
pub mod offset;
pub mod predicate;
pub mod relation;
pub mod shape;

pub use change::{Change, ChangeKind, Transaction};
pub use offset::LogOffset;
pub use relation::{Relation, RelationChange, RelationColumn};
pub use shape::{Column, Fingerprint, Shape, ShapeHandle, TableRef};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid shape handle: {0}")]
    InvalidHandle(String),
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}
