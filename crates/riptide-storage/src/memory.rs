// In-memory shape storage for development and tests.
//
// State lives behind the provider, not the coordinator, so a restarted
// coordinator sharing the provider observes the data written before the
// restart. That mirrors how a durable backend behaves across process
// restarts.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use riptide_shapes::{LogOffset, ShapeHandle};

use crate::{LogItem, Result, STREAM_QUEUE_DEPTH, ShapeStorage, StorageError, StorageProvider};

#[derive(Debug, Default)]
struct SnapshotState {
    rows: Vec<Bytes>,
    // Error raised by the row producer mid-stream; replayed to readers
    // after the rows that made it in.
    error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    snapshot: Option<SnapshotState>,
    log: BTreeMap<LogOffset, LogItem>,
}

/// Shape storage backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log entries currently held. Test hook.
    pub async fn log_len(&self) -> usize {
        self.state.read().await.log.len()
    }
}

#[async_trait]
impl ShapeStorage for InMemoryStorage {
    async fn snapshot_started(&self) -> Result<bool> {
        Ok(self.state.read().await.snapshot.is_some())
    }

    async fn make_new_snapshot(
        &self,
        mut rows: mpsc::Receiver<anyhow::Result<Bytes>>,
    ) -> Result<()> {
        self.state.write().await.snapshot = Some(SnapshotState::default());
        while let Some(row) = rows.recv().await {
            match row {
                Ok(bytes) => {
                    let mut state = self.state.write().await;
                    if let Some(snapshot) = state.snapshot.as_mut() {
                        snapshot.rows.push(bytes);
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    let mut state = self.state.write().await;
                    if let Some(snapshot) = state.snapshot.as_mut() {
                        snapshot.error = Some(message.clone());
                    }
                    return Err(StorageError::Stream(message));
                }
            }
        }
        Ok(())
    }

    async fn get_snapshot(&self) -> Result<(LogOffset, mpsc::Receiver<Result<Bytes>>)> {
        let (rows, error) = {
            let state = self.state.read().await;
            let snapshot = state.snapshot.as_ref().ok_or(StorageError::SnapshotMissing)?;
            (snapshot.rows.clone(), snapshot.error.clone())
        };
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        tokio::spawn(async move {
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    return;
                }
            }
            if let Some(message) = error {
                let _ = tx.send(Err(StorageError::Stream(message))).await;
            }
        });
        Ok((LogOffset::ZERO, rx))
    }

    async fn append_to_log(&self, items: Vec<LogItem>) -> Result<()> {
        let mut state = self.state.write().await;
        for item in items {
            state.log.insert(item.offset, item);
        }
        Ok(())
    }

    async fn get_log_stream(&self, from: LogOffset) -> Result<mpsc::Receiver<LogItem>> {
        let items: Vec<LogItem> = {
            let state = self.state.read().await;
            state
                .log
                .range((std::ops::Bound::Excluded(from), std::ops::Bound::Unbounded))
                .map(|(_, item)| item.clone())
                .collect()
        };
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        tokio::spawn(async move {
            for item in items {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn cleanup(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.snapshot = None;
        state.log.clear();
        Ok(())
    }
}

/// Provider keeping one [`InMemoryStorage`] per handle for its lifetime.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorageProvider {
    shapes: Arc<RwLock<HashMap<ShapeHandle, Arc<InMemoryStorage>>>>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn for_shape(&self, handle: &ShapeHandle) -> Result<Arc<dyn ShapeStorage>> {
        {
            let shapes = self.shapes.read().await;
            if let Some(storage) = shapes.get(handle) {
                return Ok(storage.clone());
            }
        }
        let mut shapes = self.shapes.write().await;
        let storage = shapes
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(InMemoryStorage::new()))
            .clone();
        Ok(storage)
    }
}
