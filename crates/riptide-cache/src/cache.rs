//! The shape cache coordinator.
//!
//! # Purpose
//! Singleton entry point for everything that mutates the set of live
//! shapes: handle assignment, single-flight snapshot creation, recovery at
//! boot, relation-change reaction and truncate/clean teardown. Reads
//! (existing-handle lookups, shape listings, offset reads) go straight to
//! the in-memory status index and never queue.
//!
//! # Design notes
//! All mutating requests flow through one `mpsc` queue consumed by a single
//! coordinator task, so concurrent callers cannot race handle creation and
//! a relation-change reaction completes before the next message is looked
//! at. Consumers report snapshot failures on a side channel into the same
//! loop. Per-shape work (log appends, snapshot waits, transaction routing)
//! bypasses the queue via a shared mailbox registry, keeping the
//! coordinator off the hot path.
//!
//! # Recovery
//! [`ShapeCache::start`] hydrates the status registry from the KV store and
//! starts a consumer/snapshotter pair for every recovered shape before the
//! coordinator loop serves its first request; wire the collector feed after
//! `start` returns and no consumer misses an event it needed.
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use riptide_shapes::{LogOffset, Relation, RelationChange, Shape, ShapeHandle, Transaction};
use riptide_storage::{KvStore, StorageProvider};

use crate::collector::CollectorMessage;
use crate::config::CacheConfig;
use crate::consumer::{self, ConsumerMsg, ShutdownMode};
use crate::inspector::Inspector;
use crate::snapshotter::{SnapshotSource, TablePreparer};
use crate::status::{ShapeStatus, SnapshotState};
use crate::supervisor::ConsumerSupervisor;
use crate::{CacheError, Result};

const FAILURE_QUEUE_DEPTH: usize = 64;

pub struct ShapeCacheOptions {
    pub config: CacheConfig,
    pub kv: Arc<dyn KvStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub preparer: Arc<dyn TablePreparer>,
    pub source: Arc<dyn SnapshotSource>,
    pub inspector: Arc<dyn Inspector>,
}

/// Cheaply cloneable front to the coordinator. Clones share the status
/// index, the request queue and the consumer mailbox registry.
#[derive(Clone)]
pub struct ShapeCache {
    status: Arc<ShapeStatus>,
    requests: mpsc::Sender<CacheRequest>,
    mailboxes: Arc<DashMap<ShapeHandle, mpsc::Sender<ConsumerMsg>>>,
    await_timeout: Duration,
}

enum CacheRequest {
    GetOrCreate {
        shape: Shape,
        reply: oneshot::Sender<Result<(ShapeHandle, LogOffset)>>,
    },
    HasShape {
        handle: ShapeHandle,
        reply: oneshot::Sender<bool>,
    },
    Truncate {
        handle: ShapeHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Clean {
        handle: ShapeHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    CleanAll {
        reply: oneshot::Sender<Result<()>>,
    },
    Relation(Relation),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl ShapeCache {
    /// Recover all persisted shapes and spin up the coordinator.
    pub async fn start(opts: ShapeCacheOptions) -> Result<ShapeCache> {
        let await_timeout = opts.config.await_snapshot_timeout();
        let status = Arc::new(ShapeStatus::new(opts.kv));
        status.hydrate().await?;

        let mailboxes: Arc<DashMap<ShapeHandle, mpsc::Sender<ConsumerMsg>>> =
            Arc::new(DashMap::new());
        let (requests_tx, requests_rx) = mpsc::channel(opts.config.request_queue_depth);
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_QUEUE_DEPTH);

        let mut coordinator = Coordinator {
            status: status.clone(),
            supervisor: ConsumerSupervisor::new(
                mailboxes.clone(),
                opts.config.consumer_queue_depth,
                opts.config.log_append_retries,
            ),
            storage: opts.storage,
            preparer: opts.preparer,
            source: opts.source,
            inspector: opts.inspector,
            failures: failures_tx,
        };

        let recovered = status.list_shapes();
        if !recovered.is_empty() {
            info!("recovering {} shape(s) from persistent state", recovered.len());
        }
        for (handle, shape) in recovered {
            coordinator.start_shape(handle, shape).await?;
        }

        tokio::spawn(coordinator.run(requests_rx, failures_rx));

        Ok(ShapeCache {
            status,
            requests: requests_tx,
            mailboxes,
            await_timeout,
        })
    }

    /// Resolve a shape definition to its handle and latest offset, creating
    /// the shape (and starting its snapshot) on first sight. Concurrent
    /// callers with equivalent shapes all receive the same handle and at
    /// most one snapshot runs.
    pub async fn get_or_create_shape_handle(
        &self,
        shape: Shape,
    ) -> Result<(ShapeHandle, LogOffset)> {
        if let Some(existing) = self.status.get_existing_shape(&shape) {
            return Ok(existing);
        }
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(CacheRequest::GetOrCreate { shape, reply })
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)?
    }

    /// Wait until the handle's snapshot has started. Returns immediately
    /// when it already has; errors with [`CacheError::UnknownHandle`] for
    /// handles this cache does not know, [`CacheError::SnapshotFailed`]
    /// when snapshot creation failed, and [`CacheError::AwaitTimeout`]
    /// after the configured wait.
    pub async fn await_snapshot_start(&self, handle: &ShapeHandle) -> Result<()> {
        if self.status.snapshot_started(handle) {
            return Ok(());
        }
        let Some(record) = self.status.get_record(handle) else {
            return Err(CacheError::UnknownHandle(handle.clone()));
        };
        if let SnapshotState::Failed(error) = record.snapshot_state {
            return Err(CacheError::SnapshotFailed(error));
        }
        let Some(sender) = self.mailboxes.get(handle).map(|entry| entry.value().clone()) else {
            return Err(CacheError::UnknownHandle(handle.clone()));
        };
        let (reply, rx) = oneshot::channel();
        if !consumer::forward_await(&sender, reply).await {
            return Err(CacheError::UnknownHandle(handle.clone()));
        }
        match tokio::time::timeout(self.await_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CacheError::UnknownHandle(handle.clone())),
            Err(_) => Err(CacheError::AwaitTimeout),
        }
    }

    /// Record a new latest offset for a handle. Called by the shape's
    /// consumer after appending a transaction.
    pub async fn update_shape_latest_offset(
        &self,
        handle: &ShapeHandle,
        offset: LogOffset,
    ) -> Result<()> {
        self.status.set_latest_offset(handle, offset).await
    }

    pub fn list_shapes(&self) -> Vec<(ShapeHandle, Shape)> {
        self.status.list_shapes()
    }

    /// Index check with a coordinator fallback: a handle whose creation is
    /// still queued is found once the queue drains.
    pub async fn has_shape(&self, handle: &ShapeHandle) -> bool {
        if self.status.has_handle(handle) {
            return true;
        }
        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(CacheRequest::HasShape {
                handle: handle.clone(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn get_relation(&self, id: u32) -> Option<Relation> {
        self.status.get_relation(id)
    }

    pub fn snapshot_xmin(&self, handle: &ShapeHandle) -> Option<u64> {
        self.status.snapshot_xmin(handle)
    }

    /// Stop the shape's consumer, wipe its storage and erase the handle.
    /// An equivalent shape requested later gets a fresh handle.
    pub async fn handle_truncate(&self, handle: &ShapeHandle) -> Result<()> {
        self.roundtrip(|reply| CacheRequest::Truncate {
            handle: handle.clone(),
            reply,
        })
        .await
    }

    /// Delete the shape. Idempotent: cleaning an unknown handle succeeds.
    pub async fn clean_shape(&self, handle: &ShapeHandle) -> Result<()> {
        self.roundtrip(|reply| CacheRequest::Clean {
            handle: handle.clone(),
            reply,
        })
        .await
    }

    pub async fn clean_all_shapes(&self) -> Result<()> {
        self.roundtrip(|reply| CacheRequest::CleanAll { reply }).await
    }

    /// Feed one collector message into the cache.
    pub async fn ingest(&self, message: CollectorMessage) {
        match message {
            CollectorMessage::Transaction(tx) => self.ingest_transaction(tx).await,
            CollectorMessage::Relation(relation) => self.ingest_relation(relation).await,
        }
    }

    /// Route a committed transaction to every consumer whose shape's root
    /// table it touches. Consumers apply transactions in arrival order, so
    /// feeding this in LSN order preserves LSN order per shape.
    pub async fn ingest_transaction(&self, tx: Transaction) {
        for (handle, shape) in self.status.list_shapes() {
            if !tx.touches(&shape.root_table) {
                continue;
            }
            let Some(sender) = self.mailboxes.get(&handle).map(|entry| entry.value().clone())
            else {
                continue;
            };
            if sender.send(ConsumerMsg::Transaction(tx.clone())).await.is_err() {
                debug!("consumer for shape {handle} is gone; transaction not delivered");
            }
        }
    }

    /// Hand a relation schema message to the coordinator.
    pub async fn ingest_relation(&self, relation: Relation) {
        if self
            .requests
            .send(CacheRequest::Relation(relation))
            .await
            .is_err()
        {
            warn!("shape cache is shut down; relation message dropped");
        }
    }

    /// Stop every consumer (keeping storage) and the coordinator loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(CacheRequest::Shutdown { reply })
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    async fn roundtrip(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<()>>) -> CacheRequest,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)?
    }
}

struct Coordinator {
    status: Arc<ShapeStatus>,
    supervisor: ConsumerSupervisor,
    storage: Arc<dyn StorageProvider>,
    preparer: Arc<dyn TablePreparer>,
    source: Arc<dyn SnapshotSource>,
    inspector: Arc<dyn Inspector>,
    failures: mpsc::Sender<ShapeHandle>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<CacheRequest>,
        mut failures: mpsc::Receiver<ShapeHandle>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    match request {
                        Some(CacheRequest::Shutdown { reply }) => {
                            self.supervisor.stop_all().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(request) => self.handle_request(request).await,
                        None => {
                            self.supervisor.stop_all().await;
                            return;
                        }
                    }
                }
                Some(handle) = failures.recv() => {
                    self.handle_snapshot_failure(handle).await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: CacheRequest) {
        match request {
            CacheRequest::GetOrCreate { shape, reply } => {
                let _ = reply.send(self.get_or_create(shape).await);
            }
            CacheRequest::HasShape { handle, reply } => {
                let _ = reply.send(self.status.has_handle(&handle));
            }
            CacheRequest::Truncate { handle, reply } => {
                let result = if self.status.has_handle(&handle) {
                    info!("Truncating shape {handle}; an equivalent shape will get a new handle");
                    self.remove_shape(&handle).await
                } else {
                    debug!("truncate for unknown shape {handle}");
                    Ok(())
                };
                let _ = reply.send(result);
            }
            CacheRequest::Clean { handle, reply } => {
                let result = if self.status.has_handle(&handle) {
                    info!("Cleaning shape {handle}");
                    self.remove_shape(&handle).await
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            CacheRequest::CleanAll { reply } => {
                let mut result = Ok(());
                for (handle, _) in self.status.list_shapes() {
                    if let Err(err) = self.remove_shape(&handle).await {
                        result = Err(err);
                    }
                }
                let _ = reply.send(result);
            }
            CacheRequest::Relation(relation) => {
                self.handle_relation(relation).await;
            }
            CacheRequest::Shutdown { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn get_or_create(&mut self, shape: Shape) -> Result<(ShapeHandle, LogOffset)> {
        // Another caller may have won while this request sat in the queue.
        if let Some(existing) = self.status.get_existing_shape(&shape) {
            return Ok(existing);
        }
        let (handle, offset) = self.status.add_shape(shape.clone()).await?;
        if let Err(err) = self.start_shape(handle.clone(), shape).await {
            // No storage, no consumer: undo the registration so a retry
            // starts from scratch.
            if let Err(remove_err) = self.status.remove_shape(&handle).await {
                warn!("failed to roll back shape {handle}: {remove_err}");
            }
            return Err(err);
        }
        debug!("created shape {handle}");
        Ok((handle, offset))
    }

    async fn start_shape(&mut self, handle: ShapeHandle, shape: Shape) -> Result<()> {
        let storage = self.storage.for_shape(&handle).await?;
        self.supervisor.start_shape(
            handle,
            shape,
            storage,
            self.status.clone(),
            self.preparer.clone(),
            self.source.clone(),
            self.failures.clone(),
        );
        Ok(())
    }

    async fn remove_shape(&mut self, handle: &ShapeHandle) -> Result<()> {
        self.supervisor.stop_shape(handle, ShutdownMode::Wipe).await;
        self.status.remove_shape(handle).await
    }

    async fn handle_snapshot_failure(&mut self, handle: ShapeHandle) {
        self.supervisor.forget(&handle).await;
        if let Err(err) = self.status.remove_shape(&handle).await {
            warn!("failed to erase shape {handle} after snapshot failure: {err}");
        }
    }

    /// React to a relation schema message: persist any difference, then
    /// tear down every shape the change invalidates. Not strongly
    /// consistent with in-flight transactions; affected clients reconnect
    /// and resnapshot under a new handle.
    async fn handle_relation(&mut self, new: Relation) {
        let old = self.status.get_relation(new.id);
        let changed = match &old {
            None => true,
            Some(old) => *old != new,
        };
        if !changed {
            return;
        }
        if let Err(err) = self.status.store_relation(new.clone()).await {
            warn!("failed to persist relation {}: {err}", new.id);
            return;
        }
        let Some(old) = old else {
            return;
        };

        // Invalidate cached column info under the relation's old identity;
        // a rename changes the name in the new message.
        self.inspector.clean_column_info(&old.table_ref()).await;
        metrics::counter!("riptide_relation_changes_total").increment(1);

        let change = RelationChange { old, new };
        let affected: Vec<ShapeHandle> = self
            .status
            .list_shapes()
            .into_iter()
            .filter(|(_, shape)| shape.is_affected_by(&change))
            .map(|(handle, _)| handle)
            .collect();
        if affected.is_empty() {
            return;
        }
        info!("Schema for the table {} changed", change.old.table_ref());
        for handle in affected {
            if let Err(err) = self.remove_shape(&handle).await {
                warn!("failed to clean shape {handle} after relation change: {err}");
            }
        }
    }
}
