//! In-memory index of live shapes, mirrored to the persistent KV store.
//!
//! # Purpose
//! The registry every hot path reads: fingerprint → handle for
//! `get_or_create` fast-pathing, handle → record for offsets and snapshot
//! state, relation id → relation for schema-change detection. Pure data; no
//! scheduling.
//!
//! # Durability and consistency
//! Every mutation writes through to the KV store *before* touching the
//! in-memory maps; a failed KV write leaves memory untouched and the
//! operation errors. A crash between the KV flush and the map update is the
//! only divergence window, and boot recovery re-reads the KV as the source
//! of truth, so after [`ShapeStatus::hydrate`] quiesces the index and the
//! KV agree.
//!
//! # Concurrency
//! Maps are `DashMap`s: lock-free for readers, sharded writes. The
//! coordinator serializes shape creation/removal; consumers only write
//! their own handle's offset, xmin and snapshot state.
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use riptide_shapes::{Fingerprint, LogOffset, Relation, Shape, ShapeHandle};
use riptide_storage::{KvStore, StorageError};

use crate::{CacheError, Result};

const SHAPE_PREFIX: &str = "shape/";
const RELATION_PREFIX: &str = "relation/";
const XMIN_PREFIX: &str = "xmin/";
const OFFSET_PREFIX: &str = "offset/";

/// Forward-only snapshot lifecycle per handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Started,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ShapeRecord {
    pub handle: ShapeHandle,
    pub shape: Shape,
    pub xmin: Option<u64>,
    pub latest_offset: LogOffset,
    pub snapshot_state: SnapshotState,
}

pub struct ShapeStatus {
    kv: Arc<dyn KvStore>,
    handles: DashMap<Fingerprint, ShapeHandle>,
    records: DashMap<ShapeHandle, ShapeRecord>,
    relations: DashMap<u32, Relation>,
    handle_counter: AtomicU64,
}

impl ShapeStatus {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            handles: DashMap::new(),
            records: DashMap::new(),
            relations: DashMap::new(),
            handle_counter: AtomicU64::new(0),
        }
    }

    /// Load all shapes and relations from the KV store. Called once at
    /// boot, before any consumer runs. Recovered shapes come back as
    /// `Pending`; their snapshotters re-derive the started state from
    /// storage.
    pub async fn hydrate(&self) -> Result<()> {
        for (key, value) in self.kv.scan(SHAPE_PREFIX).await? {
            let handle = ShapeHandle::from(&key[SHAPE_PREFIX.len()..]);
            let shape: Shape = decode(&key, &value)?;

            let xmin = match self.kv.get(&format!("{XMIN_PREFIX}{handle}")).await? {
                Some(bytes) => Some(decode(&format!("{XMIN_PREFIX}{handle}"), &bytes)?),
                None => None,
            };
            let latest_offset = match self.kv.get(&format!("{OFFSET_PREFIX}{handle}")).await? {
                Some(bytes) => decode(&format!("{OFFSET_PREFIX}{handle}"), &bytes)?,
                None => LogOffset::ZERO,
            };

            self.handles.insert(shape.fingerprint(), handle.clone());
            self.records.insert(
                handle.clone(),
                ShapeRecord {
                    handle,
                    shape,
                    xmin,
                    latest_offset,
                    snapshot_state: SnapshotState::Pending,
                },
            );
        }
        for (key, value) in self.kv.scan(RELATION_PREFIX).await? {
            let relation: Relation = decode(&key, &value)?;
            self.relations.insert(relation.id, relation);
        }
        metrics::gauge!("riptide_shapes_total").set(self.records.len() as f64);
        metrics::gauge!("riptide_relations_total").set(self.relations.len() as f64);
        Ok(())
    }

    /// Persist and index a new shape under a freshly generated handle.
    pub async fn add_shape(&self, shape: Shape) -> Result<(ShapeHandle, LogOffset)> {
        let handle = self.generate_handle();
        let encoded = encode(&shape);
        self.kv
            .put(&format!("{SHAPE_PREFIX}{handle}"), encoded)
            .await?;
        self.handles.insert(shape.fingerprint(), handle.clone());
        self.records.insert(
            handle.clone(),
            ShapeRecord {
                handle: handle.clone(),
                shape,
                xmin: None,
                latest_offset: LogOffset::ZERO,
                snapshot_state: SnapshotState::Pending,
            },
        );
        metrics::gauge!("riptide_shapes_total").set(self.records.len() as f64);
        metrics::counter!("riptide_shape_changes_total", "op" => "created").increment(1);
        Ok((handle, LogOffset::ZERO))
    }

    /// Fast-path lookup by definition.
    pub fn get_existing_shape(&self, shape: &Shape) -> Option<(ShapeHandle, LogOffset)> {
        let handle = self.handles.get(&shape.fingerprint())?.clone();
        let record = self.records.get(&handle)?;
        Some((handle, record.latest_offset))
    }

    pub fn get_record(&self, handle: &ShapeHandle) -> Option<ShapeRecord> {
        self.records.get(handle).map(|record| record.clone())
    }

    pub fn has_handle(&self, handle: &ShapeHandle) -> bool {
        self.records.contains_key(handle)
    }

    pub fn list_shapes(&self) -> Vec<(ShapeHandle, Shape)> {
        self.records
            .iter()
            .map(|entry| (entry.handle.clone(), entry.shape.clone()))
            .collect()
    }

    /// Record a new latest offset. Offsets are monotonic per handle; a
    /// regression is a bug in the caller and is refused.
    pub async fn set_latest_offset(&self, handle: &ShapeHandle, offset: LogOffset) -> Result<()> {
        let current = match self.records.get(handle) {
            Some(record) => record.latest_offset,
            None => {
                warn!("Tried to update latest offset for shape {handle} which doesn't exist");
                return Err(CacheError::UnknownHandle(handle.clone()));
            }
        };
        if offset < current {
            return Err(CacheError::NonMonotonicOffset {
                handle: handle.clone(),
                current,
                offset,
            });
        }
        self.kv
            .put(&format!("{OFFSET_PREFIX}{handle}"), encode(&offset))
            .await?;
        match self.records.get_mut(handle) {
            Some(mut record) => {
                // Re-check under the entry lock; another writer for this
                // handle cannot exist, but the handle may have been removed.
                if offset >= record.latest_offset {
                    record.latest_offset = offset;
                }
                Ok(())
            }
            None => Err(CacheError::UnknownHandle(handle.clone())),
        }
    }

    pub async fn set_snapshot_xmin(&self, handle: &ShapeHandle, xmin: u64) -> Result<()> {
        if !self.records.contains_key(handle) {
            return Err(CacheError::UnknownHandle(handle.clone()));
        }
        self.kv
            .put(&format!("{XMIN_PREFIX}{handle}"), encode(&xmin))
            .await?;
        if let Some(mut record) = self.records.get_mut(handle) {
            record.xmin = Some(xmin);
        }
        Ok(())
    }

    pub fn snapshot_xmin(&self, handle: &ShapeHandle) -> Option<u64> {
        self.records.get(handle).and_then(|record| record.xmin)
    }

    /// Transition `pending -> started`. Started is terminal for a live
    /// handle; marking an already-started shape is a no-op, and a failed
    /// shape stays failed.
    pub fn mark_snapshot_started(&self, handle: &ShapeHandle) {
        if let Some(mut record) = self.records.get_mut(handle)
            && record.snapshot_state == SnapshotState::Pending
        {
            record.snapshot_state = SnapshotState::Started;
        }
    }

    pub fn mark_snapshot_failed(&self, handle: &ShapeHandle, error: &str) {
        if let Some(mut record) = self.records.get_mut(handle)
            && record.snapshot_state == SnapshotState::Pending
        {
            record.snapshot_state = SnapshotState::Failed(error.to_string());
        }
    }

    pub fn snapshot_started(&self, handle: &ShapeHandle) -> bool {
        self.records
            .get(handle)
            .map(|record| record.snapshot_state == SnapshotState::Started)
            .unwrap_or(false)
    }

    /// Erase a shape from the KV store and the index.
    pub async fn remove_shape(&self, handle: &ShapeHandle) -> Result<()> {
        self.kv.delete(&format!("{SHAPE_PREFIX}{handle}")).await?;
        self.kv.delete(&format!("{XMIN_PREFIX}{handle}")).await?;
        self.kv.delete(&format!("{OFFSET_PREFIX}{handle}")).await?;
        if let Some((_, record)) = self.records.remove(handle) {
            self.handles.remove(&record.shape.fingerprint());
        }
        metrics::gauge!("riptide_shapes_total").set(self.records.len() as f64);
        metrics::counter!("riptide_shape_changes_total", "op" => "removed").increment(1);
        Ok(())
    }

    pub async fn store_relation(&self, relation: Relation) -> Result<()> {
        self.kv
            .put(&format!("{RELATION_PREFIX}{}", relation.id), encode(&relation))
            .await?;
        self.relations.insert(relation.id, relation);
        metrics::gauge!("riptide_relations_total").set(self.relations.len() as f64);
        Ok(())
    }

    pub fn get_relation(&self, id: u32) -> Option<Relation> {
        self.relations.get(&id).map(|relation| relation.clone())
    }

    /// Whether a relation with this table identity is known. Used to spot
    /// changes that reference tables the replication stream never described.
    pub fn knows_table(&self, table: &riptide_shapes::TableRef) -> bool {
        self.relations
            .iter()
            .any(|entry| entry.schema == table.schema && entry.table == table.table)
    }

    /// Handles must differ across restarts and across rapid successive
    /// creations: wall-clock millis in the high bits, a process-wide
    /// counter in the low 20.
    fn generate_handle(&self) -> ShapeHandle {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let count = self.handle_counter.fetch_add(1, Ordering::Relaxed);
        ShapeHandle::new(((millis << 20) | (count & 0xFFFFF)).to_string())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).expect("kv value serialization is infallible"))
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &Bytes) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|_| CacheError::Storage(StorageError::Corruption(key.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_shapes::{Column, RelationColumn, TableRef};
    use riptide_storage::InMemoryKv;

    fn items_shape() -> Shape {
        Shape {
            root_table: TableRef::new("public", "items"),
            where_clause: None,
            projection: vec![Column::new("id", "int8")],
            pk: vec!["id".into()],
        }
    }

    fn status() -> ShapeStatus {
        ShapeStatus::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn add_then_lookup_by_shape() {
        let status = status();
        let (handle, offset) = status.add_shape(items_shape()).await.expect("add");
        assert_eq!(offset, LogOffset::ZERO);
        let (found, found_offset) = status.get_existing_shape(&items_shape()).expect("lookup");
        assert_eq!(found, handle);
        assert_eq!(found_offset, LogOffset::ZERO);
    }

    #[tokio::test]
    async fn handles_generated_within_one_millisecond_differ() {
        let status = status();
        let first = status.generate_handle();
        let second = status.generate_handle();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn offsets_are_monotonic() {
        let status = status();
        let (handle, _) = status.add_shape(items_shape()).await.expect("add");
        status
            .set_latest_offset(&handle, LogOffset::new(10, 0))
            .await
            .expect("advance");
        let regress = status.set_latest_offset(&handle, LogOffset::new(9, 0)).await;
        assert!(matches!(regress, Err(CacheError::NonMonotonicOffset { .. })));
        assert_eq!(
            status.get_record(&handle).expect("record").latest_offset,
            LogOffset::new(10, 0)
        );
    }

    #[tokio::test]
    async fn unknown_handle_offset_update_errors() {
        let status = status();
        let result = status
            .set_latest_offset(&ShapeHandle::from("foo"), LogOffset::new(1, 0))
            .await;
        assert!(matches!(result, Err(CacheError::UnknownHandle(_))));
    }

    #[tokio::test]
    async fn snapshot_state_transitions_are_forward_only() {
        let status = status();
        let (handle, _) = status.add_shape(items_shape()).await.expect("add");
        assert!(!status.snapshot_started(&handle));

        status.mark_snapshot_started(&handle);
        assert!(status.snapshot_started(&handle));

        // A late failure report cannot un-start the snapshot.
        status.mark_snapshot_failed(&handle, "late");
        assert!(status.snapshot_started(&handle));
    }

    #[tokio::test]
    async fn removal_erases_index_and_kv() {
        let kv = Arc::new(InMemoryKv::new());
        let status = ShapeStatus::new(kv.clone());
        let (handle, _) = status.add_shape(items_shape()).await.expect("add");

        status.remove_shape(&handle).await.expect("remove");
        assert!(!status.has_handle(&handle));
        assert!(status.get_existing_shape(&items_shape()).is_none());
        assert!(
            kv.get(&format!("shape/{handle}"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn hydrate_restores_shapes_offsets_and_relations() {
        let kv = Arc::new(InMemoryKv::new());
        let (handle, xmin) = {
            let status = ShapeStatus::new(kv.clone());
            let (handle, _) = status.add_shape(items_shape()).await.expect("add");
            status
                .set_latest_offset(&handle, LogOffset::new(13, 2))
                .await
                .expect("offset");
            status.set_snapshot_xmin(&handle, 10).await.expect("xmin");
            status
                .store_relation(Relation {
                    id: 99,
                    schema: "public".into(),
                    table: "items".into(),
                    columns: vec![RelationColumn {
                        name: "id".into(),
                        type_oid: 20,
                    }],
                })
                .await
                .expect("relation");
            (handle, 10)
        };

        let recovered = ShapeStatus::new(kv);
        recovered.hydrate().await.expect("hydrate");
        let record = recovered.get_record(&handle).expect("record");
        assert_eq!(record.latest_offset, LogOffset::new(13, 2));
        assert_eq!(record.xmin, Some(xmin));
        assert_eq!(record.snapshot_state, SnapshotState::Pending);
        assert_eq!(
            recovered.get_existing_shape(&items_shape()).expect("lookup").0,
            handle
        );
        assert!(recovered.get_relation(99).is_some());
        assert!(recovered.knows_table(&TableRef::new("public", "items")));
    }
}
