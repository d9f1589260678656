// Child registry for consumer/snapshotter pairs, keyed by shape handle.
//
// Owned by the coordinator task, so starts and stops are serialized. The
// consumer mailbox senders live in a shared DashMap: transaction routing
// and snapshot-start waits reach consumers directly without queueing behind
// the coordinator.
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use riptide_shapes::{Shape, ShapeHandle};
use riptide_storage::ShapeStorage;

use crate::consumer::{self, ConsumerContext, ConsumerMsg, ShutdownMode, spawn_consumer};
use crate::snapshotter::{SnapshotSource, TablePreparer, spawn_snapshotter};
use crate::status::ShapeStatus;

struct ShapeTasks {
    sender: mpsc::Sender<ConsumerMsg>,
    consumer: JoinHandle<()>,
    snapshotter: JoinHandle<()>,
}

pub(crate) struct ConsumerSupervisor {
    mailboxes: Arc<DashMap<ShapeHandle, mpsc::Sender<ConsumerMsg>>>,
    tasks: HashMap<ShapeHandle, ShapeTasks>,
    mailbox_depth: usize,
    append_retries: u32,
}

impl ConsumerSupervisor {
    pub fn new(
        mailboxes: Arc<DashMap<ShapeHandle, mpsc::Sender<ConsumerMsg>>>,
        mailbox_depth: usize,
        append_retries: u32,
    ) -> Self {
        Self {
            mailboxes,
            tasks: HashMap::new(),
            mailbox_depth,
            append_retries,
        }
    }

    /// Start the consumer and its snapshotter as a unit and register the
    /// consumer's mailbox.
    #[allow(clippy::too_many_arguments)]
    pub fn start_shape(
        &mut self,
        handle: ShapeHandle,
        shape: Shape,
        storage: Arc<dyn ShapeStorage>,
        status: Arc<ShapeStatus>,
        preparer: Arc<dyn TablePreparer>,
        source: Arc<dyn SnapshotSource>,
        failures: mpsc::Sender<ShapeHandle>,
    ) {
        let (sender, consumer_task) = spawn_consumer(
            ConsumerContext {
                handle: handle.clone(),
                shape: shape.clone(),
                storage: storage.clone(),
                status,
                failures,
                append_retries: self.append_retries,
            },
            self.mailbox_depth,
        );
        let snapshotter_task = spawn_snapshotter(
            handle.clone(),
            shape,
            storage,
            preparer,
            source,
            sender.clone(),
        );
        self.mailboxes.insert(handle.clone(), sender.clone());
        self.tasks.insert(
            handle,
            ShapeTasks {
                sender,
                consumer: consumer_task,
                snapshotter: snapshotter_task,
            },
        );
    }

    /// Stop a shape's pair: shut the consumer down (wiping storage when
    /// asked), then terminate its snapshotter.
    pub async fn stop_shape(&mut self, handle: &ShapeHandle, mode: ShutdownMode) {
        self.mailboxes.remove(handle);
        let Some(tasks) = self.tasks.remove(handle) else {
            return;
        };
        consumer::shutdown(&tasks.sender, tasks.consumer, handle, mode).await;
        tasks.snapshotter.abort();
        let _ = tasks.snapshotter.await;
    }

    /// Drop the registry entry for a consumer that terminated on its own
    /// (snapshot failure).
    pub async fn forget(&mut self, handle: &ShapeHandle) {
        self.mailboxes.remove(handle);
        if let Some(tasks) = self.tasks.remove(handle) {
            tasks.snapshotter.abort();
            let _ = tasks.snapshotter.await;
            let _ = tasks.consumer.await;
        }
    }

    pub fn running(&self) -> Vec<ShapeHandle> {
        self.tasks.keys().cloned().collect()
    }

    /// Stop everything, keeping storage. Used on coordinator shutdown.
    pub async fn stop_all(&mut self) {
        for handle in self.running() {
            self.stop_shape(&handle, ShutdownMode::Keep).await;
        }
    }
}
