//! Per-shape consumer: the single owner of a shape's storage.
//!
//! One consumer task runs per live handle. It ingests the shape's slice of
//! the replication stream, appends matching changes to the log, tracks the
//! snapshot lifecycle and answers snapshot-start waiters. The matching
//! snapshotter holds only this task's mailbox sender, never the task
//! itself.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use riptide_shapes::{Shape, ShapeHandle, Transaction};
use riptide_storage::{LogItem, ShapeStorage};

use crate::status::ShapeStatus;
use crate::{CacheError, Result};

const APPEND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What to do with the shape's storage when the consumer stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Process shutdown or restart: data stays for recovery.
    Keep,
    /// Truncate, clean or relation change: snapshot and log are deleted.
    Wipe,
}

#[derive(Debug)]
pub enum ConsumerMsg {
    SnapshotXminKnown(u64),
    SnapshotStarted,
    /// Recovery path: storage already holds a snapshot.
    SnapshotExists,
    SnapshotFailed(String),
    Transaction(Transaction),
    AwaitSnapshotStart { reply: oneshot::Sender<Result<()>> },
    Shutdown {
        mode: ShutdownMode,
        done: oneshot::Sender<()>,
    },
}

pub(crate) struct ConsumerContext {
    pub handle: ShapeHandle,
    pub shape: Shape,
    pub storage: Arc<dyn ShapeStorage>,
    pub status: Arc<ShapeStatus>,
    /// Reports a failed snapshot back to the coordinator, which erases the
    /// handle so an equivalent shape gets a fresh one.
    pub failures: mpsc::Sender<ShapeHandle>,
    pub append_retries: u32,
}

pub(crate) fn spawn_consumer(
    context: ConsumerContext,
    mailbox_depth: usize,
) -> (mpsc::Sender<ConsumerMsg>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_depth);
    let task = tokio::spawn(run_consumer(context, rx));
    (tx, task)
}

async fn run_consumer(context: ConsumerContext, mut rx: mpsc::Receiver<ConsumerMsg>) {
    let ConsumerContext {
        handle,
        shape,
        storage,
        status,
        failures,
        append_retries,
    } = context;

    let mut started = status.snapshot_started(&handle);
    let mut waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            ConsumerMsg::SnapshotXminKnown(xmin) => {
                if let Err(err) = status.set_snapshot_xmin(&handle, xmin).await {
                    warn!("failed to record xmin for shape {handle}: {err}");
                }
            }
            ConsumerMsg::SnapshotStarted | ConsumerMsg::SnapshotExists => {
                status.mark_snapshot_started(&handle);
                started = true;
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConsumerMsg::SnapshotFailed(error) => {
                if started {
                    // Forward-only state: a stream error after the start
                    // signal is surfaced to snapshot readers by storage.
                    warn!("snapshot stream for shape {handle} failed after start: {error}");
                    continue;
                }
                error!("Snapshot creation failed for {handle}: {error}");
                status.mark_snapshot_failed(&handle, &error);
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(CacheError::SnapshotFailed(error.clone())));
                }
                metrics::counter!("riptide_snapshot_failures_total").increment(1);
                let _ = failures.send(handle.clone()).await;
                return;
            }
            ConsumerMsg::Transaction(tx) => {
                apply_transaction(&handle, &shape, &*storage, &status, append_retries, tx).await;
            }
            ConsumerMsg::AwaitSnapshotStart { reply } => {
                if started {
                    let _ = reply.send(Ok(()));
                } else {
                    waiters.push(reply);
                }
            }
            ConsumerMsg::Shutdown { mode, done } => {
                if mode == ShutdownMode::Wipe
                    && let Err(err) = storage.cleanup().await
                {
                    warn!("failed to clean storage for shape {handle}: {err}");
                }
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(CacheError::UnknownHandle(handle.clone())));
                }
                let _ = done.send(());
                return;
            }
        }
    }

    // Mailbox closed without an explicit shutdown.
    for waiter in waiters.drain(..) {
        let _ = waiter.send(Err(CacheError::UnknownHandle(handle.clone())));
    }
}

/// Append the transaction's matching changes in offset order, then advance
/// the shape's latest offset to the transaction's last offset.
async fn apply_transaction(
    handle: &ShapeHandle,
    shape: &Shape,
    storage: &dyn ShapeStorage,
    status: &ShapeStatus,
    append_retries: u32,
    tx: Transaction,
) {
    let mut items: Vec<LogItem> = Vec::new();
    for change in shape.changes_for(&tx) {
        if !status.knows_table(&change.relation) {
            warn!(
                "skipping change for {} at {}: relation has no cached schema",
                change.relation, change.offset
            );
            continue;
        }
        items.push(LogItem::from(change));
    }

    if !items.is_empty() {
        debug!(
            "appending {} change(s) from xid {} to shape {handle}",
            items.len(),
            tx.xid
        );
        let mut attempt = 0;
        loop {
            match storage.append_to_log(items.clone()).await {
                Ok(()) => break,
                Err(err) if attempt < append_retries => {
                    attempt += 1;
                    warn!(
                        "log append for shape {handle} failed (attempt {attempt}): {err}; retrying"
                    );
                    tokio::time::sleep(APPEND_RETRY_DELAY).await;
                }
                Err(err) => {
                    error!("log append for shape {handle} failed permanently: {err}");
                    return;
                }
            }
        }
    }

    if let Err(err) = status.set_latest_offset(handle, tx.last_log_offset).await {
        warn!("offset update for shape {handle} refused: {err}");
    }
}

/// Register `reply` with a live consumer, or answer immediately when the
/// snapshot already started. Used by the cache's `await_snapshot_start`.
pub(crate) async fn forward_await(
    sender: &mpsc::Sender<ConsumerMsg>,
    reply: oneshot::Sender<Result<()>>,
) -> bool {
    sender
        .send(ConsumerMsg::AwaitSnapshotStart { reply })
        .await
        .is_ok()
}

/// Ask a consumer to stop and wait for it to finish.
pub(crate) async fn shutdown(
    sender: &mpsc::Sender<ConsumerMsg>,
    task: JoinHandle<()>,
    handle: &ShapeHandle,
    mode: ShutdownMode,
) {
    let (done_tx, done_rx) = oneshot::channel();
    if sender
        .send(ConsumerMsg::Shutdown {
            mode,
            done: done_tx,
        })
        .await
        .is_ok()
    {
        let _ = done_rx.await;
    }
    if let Err(err) = task.await {
        if err.is_panic() {
            error!("consumer for shape {handle} panicked during shutdown");
        }
    } else {
        info!("consumer for shape {handle} stopped");
    }
}
