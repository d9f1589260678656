// Inbound surface for the log collector.
//
// The collector (the logical-replication decoder pipeline) produces two
// kinds of messages: committed transactions, routed to the consumers of
// every affected shape, and relation schema messages, which only the
// coordinator consumes.
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use riptide_shapes::{Relation, Transaction};

use crate::cache::ShapeCache;

#[derive(Debug)]
pub enum CollectorMessage {
    Transaction(Transaction),
    Relation(Relation),
}

/// Drain a collector feed into the cache. The caller wires the decoder's
/// output channel here after [`ShapeCache::start`] returns, so recovery has
/// already registered every consumer by the time events flow.
pub fn spawn_collector_feed(
    cache: ShapeCache,
    mut feed: mpsc::Receiver<CollectorMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = feed.recv().await {
            cache.ingest(message).await;
        }
        debug!("collector feed closed");
    })
}
