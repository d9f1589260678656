// Seam to the Postgres inspector owned by the embedding service.
use async_trait::async_trait;

use riptide_shapes::TableRef;

/// Column-introspection cache owned by the embedder. The shape cache only
/// ever needs to invalidate it: when a relation's schema message differs
/// from the cached one, `clean_column_info` is called with the relation's
/// *old* identity (a rename changes the name in the new message).
#[async_trait]
pub trait Inspector: Send + Sync {
    async fn clean_column_info(&self, table: &TableRef);
}

/// For embedders without an inspector.
#[derive(Debug, Default)]
pub struct NoopInspector;

#[async_trait]
impl Inspector for NoopInspector {
    async fn clean_column_info(&self, _table: &TableRef) {}
}
