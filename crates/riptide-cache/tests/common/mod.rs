// Shared fixtures: stub strategy objects and a cache harness wired to
// in-memory storage and KV.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};

use riptide_cache::{
    CacheConfig, Inspector, ShapeCache, ShapeCacheOptions, SnapshotSession, SnapshotSource,
    TablePreparer,
};
use riptide_shapes::{
    Change, ChangeKind, Column, LogOffset, Relation, RelationColumn, Shape, TableRef, Transaction,
};
use riptide_storage::{InMemoryKv, InMemoryStorageProvider, KvStore, StorageProvider};

pub struct CountingPreparer {
    calls: AtomicUsize,
}

impl CountingPreparer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TablePreparer for CountingPreparer {
    async fn prepare_tables(&self, _tables: &[TableRef]) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Snapshot source scripted by the test: counts opens, optionally waits for
/// a gate, optionally fails, otherwise streams the given row documents.
pub struct ScriptedSource {
    pub xmin: u64,
    pub rows: Vec<Bytes>,
    pub fail_with: Option<String>,
    gate: Option<watch::Receiver<bool>>,
    opens: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(xmin: u64, rows: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            xmin,
            rows,
            fail_with: None,
            gate: None,
            opens: AtomicUsize::new(0),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            xmin: 0,
            rows: Vec::new(),
            fail_with: Some(message.to_string()),
            gate: None,
            opens: AtomicUsize::new(0),
        })
    }

    /// Like `new`, but `open` blocks until the returned sender publishes
    /// `true`, so tests can register waiters first.
    pub fn gated(xmin: u64, rows: Vec<Bytes>) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let source = Arc::new(Self {
            xmin,
            rows,
            fail_with: None,
            gate: Some(rx),
            opens: AtomicUsize::new(0),
        });
        (source, tx)
    }

    /// Like `failing`, but gated.
    pub fn failing_gated(message: &str) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let source = Arc::new(Self {
            xmin: 0,
            rows: Vec::new(),
            fail_with: Some(message.to_string()),
            gate: Some(rx),
            opens: AtomicUsize::new(0),
        });
        (source, tx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn open(&self, _shape: &Shape) -> anyhow::Result<SnapshotSession> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| anyhow::anyhow!("gate dropped"))?;
        }
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{message}");
        }
        let rows = self.rows.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    return;
                }
            }
        });
        Ok(SnapshotSession {
            xmin: self.xmin,
            rows: rx,
        })
    }
}

pub struct RecordingInspector {
    cleaned: Mutex<Vec<TableRef>>,
}

impl RecordingInspector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cleaned: Mutex::new(Vec::new()),
        })
    }

    pub async fn cleaned(&self) -> Vec<TableRef> {
        self.cleaned.lock().await.clone()
    }
}

#[async_trait]
impl Inspector for RecordingInspector {
    async fn clean_column_info(&self, table: &TableRef) {
        self.cleaned.lock().await.push(table.clone());
    }
}

pub struct Harness {
    pub cache: ShapeCache,
    pub kv: Arc<InMemoryKv>,
    pub provider: InMemoryStorageProvider,
    pub preparer: Arc<CountingPreparer>,
    pub inspector: Arc<RecordingInspector>,
}

pub async fn start_cache(source: Arc<dyn SnapshotSource>) -> Harness {
    let kv = Arc::new(InMemoryKv::new());
    let provider = InMemoryStorageProvider::new();
    start_cache_with(kv, provider, source).await
}

pub async fn start_cache_with(
    kv: Arc<InMemoryKv>,
    provider: InMemoryStorageProvider,
    source: Arc<dyn SnapshotSource>,
) -> Harness {
    let preparer = CountingPreparer::new();
    let inspector = RecordingInspector::new();
    let cache = ShapeCache::start(ShapeCacheOptions {
        config: CacheConfig::default(),
        kv: kv.clone() as Arc<dyn KvStore>,
        storage: Arc::new(provider.clone()) as Arc<dyn StorageProvider>,
        preparer: preparer.clone(),
        source,
        inspector: inspector.clone(),
    })
    .await
    .expect("start cache");
    Harness {
        cache,
        kv,
        provider,
        preparer,
        inspector,
    }
}

pub fn items_shape() -> Shape {
    shape_on("public", "items")
}

pub fn shape_on(schema: &str, table: &str) -> Shape {
    Shape {
        root_table: TableRef::new(schema, table),
        where_clause: None,
        projection: vec![Column::new("id", "int8"), Column::new("value", "text")],
        pk: vec!["id".into()],
    }
}

pub fn shape_where(schema: &str, table: &str, clause: &str) -> Shape {
    let mut shape = shape_on(schema, table);
    shape.where_clause = Some(clause.to_string());
    shape
}

pub fn relation(id: u32, schema: &str, table: &str) -> Relation {
    Relation {
        id,
        schema: schema.into(),
        table: table.into(),
        columns: vec![
            RelationColumn {
                name: "id".into(),
                type_oid: 20,
            },
            RelationColumn {
                name: "value".into(),
                type_oid: 25,
            },
        ],
    }
}

pub fn insert_tx(table: &TableRef, lsn: u64, rows: &[(&str, &str)]) -> Transaction {
    let changes: Vec<Change> = rows
        .iter()
        .enumerate()
        .map(|(index, (id, value))| Change {
            relation: table.clone(),
            offset: LogOffset::new(lsn, index as u64),
            kind: ChangeKind::Insert,
            key: format!("\"{id}\""),
            record: serde_json::json!({"id": id, "value": value}),
        })
        .collect();
    let last = LogOffset::new(lsn, changes.len().saturating_sub(1) as u64);
    Transaction {
        xid: lsn as u32,
        lsn,
        last_log_offset: last,
        changes,
        affected_relations: HashSet::from([table.clone()]),
    }
}

/// A request that round-trips through the coordinator queue, so everything
/// enqueued before it (relation messages included) has been processed when
/// it returns.
pub async fn drain_coordinator(cache: &ShapeCache) {
    cache
        .clean_shape(&riptide_shapes::ShapeHandle::from("coordinator-barrier"))
        .await
        .expect("barrier clean");
}

pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
