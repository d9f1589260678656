//! One-shot snapshot worker.
//!
//! # Purpose
//! Started together with each consumer. Prepares the shape's table, opens a
//! repeatable-read read-only transaction, reports the snapshot xmin, then
//! streams the shape's initial rows into storage. Every message goes
//! through the consumer's mailbox sender; the snapshotter never holds the
//! consumer itself.
//!
//! # Strategy objects
//! Table preparation and snapshot production are injected so tests can run
//! without Postgres: [`TablePreparer`] and [`SnapshotSource`]. The
//! production source is [`PostgresSnapshotSource`].
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use riptide_shapes::{Shape, ShapeHandle, TableRef};
use riptide_storage::{STREAM_QUEUE_DEPTH, ShapeStorage};

use crate::consumer::ConsumerMsg;

/// Hook run before the snapshot transaction opens, e.g. to create publica-
/// tion entries or analyze tables. May be a no-op.
#[async_trait]
pub trait TablePreparer: Send + Sync {
    async fn prepare_tables(&self, tables: &[TableRef]) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopTablePreparer;

#[async_trait]
impl TablePreparer for NoopTablePreparer {
    async fn prepare_tables(&self, _tables: &[TableRef]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An open snapshot: the xmin horizon captured when the transaction began
/// and the stream of initial rows, one serialized document per row.
pub struct SnapshotSession {
    pub xmin: u64,
    pub rows: mpsc::Receiver<anyhow::Result<Bytes>>,
}

/// Produces the initial data for a shape. Implementations must capture the
/// xmin and format rows inside one consistent read transaction.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn open(&self, shape: &Shape) -> anyhow::Result<SnapshotSession>;
}

pub(crate) fn spawn_snapshotter(
    handle: ShapeHandle,
    shape: Shape,
    storage: Arc<dyn ShapeStorage>,
    preparer: Arc<dyn TablePreparer>,
    source: Arc<dyn SnapshotSource>,
    consumer: mpsc::Sender<ConsumerMsg>,
) -> JoinHandle<()> {
    tokio::spawn(run_snapshotter(
        handle, shape, storage, preparer, source, consumer,
    ))
}

async fn run_snapshotter(
    handle: ShapeHandle,
    shape: Shape,
    storage: Arc<dyn ShapeStorage>,
    preparer: Arc<dyn TablePreparer>,
    source: Arc<dyn SnapshotSource>,
    consumer: mpsc::Sender<ConsumerMsg>,
) {
    match storage.snapshot_started().await {
        Ok(true) => {
            debug!("snapshot for shape {handle} already exists");
            let _ = consumer.send(ConsumerMsg::SnapshotExists).await;
            return;
        }
        Ok(false) => {}
        Err(err) => {
            let _ = consumer
                .send(ConsumerMsg::SnapshotFailed(format!("{err:#}")))
                .await;
            return;
        }
    }

    let session = match open_session(&shape, &*preparer, &*source).await {
        Ok(session) => session,
        Err(err) => {
            let _ = consumer
                .send(ConsumerMsg::SnapshotFailed(format!("{err:#}")))
                .await;
            return;
        }
    };

    if consumer
        .send(ConsumerMsg::SnapshotXminKnown(session.xmin))
        .await
        .is_err()
    {
        return;
    }
    if consumer.send(ConsumerMsg::SnapshotStarted).await.is_err() {
        return;
    }

    // Past this point the snapshot counts as started; a stream error is
    // recorded by storage and surfaced to snapshot readers.
    if let Err(err) = storage.make_new_snapshot(session.rows).await {
        warn!("snapshot stream for shape {handle} ended with error: {err}");
        let _ = consumer
            .send(ConsumerMsg::SnapshotFailed(format!("{err:#}")))
            .await;
    }
}

async fn open_session(
    shape: &Shape,
    preparer: &dyn TablePreparer,
    source: &dyn SnapshotSource,
) -> anyhow::Result<SnapshotSession> {
    preparer
        .prepare_tables(std::slice::from_ref(&shape.root_table))
        .await?;
    source.open(shape).await
}

/// Session settings applied before any row is read, so snapshot and
/// live-log formatting agree exactly no matter what the server or role
/// defaults are.
const SESSION_SETTINGS: [&str; 5] = [
    "SET LOCAL DateStyle = 'ISO, DMY'",
    "SET LOCAL TimeZone = 'UTC'",
    "SET LOCAL extra_float_digits = 1",
    "SET LOCAL bytea_output = 'hex'",
    "SET LOCAL IntervalStyle = 'iso_8601'",
];

/// Reads the initial rows out of Postgres with every projected column cast
/// to text, one JSON document per row in projection order.
pub struct PostgresSnapshotSource {
    pool: sqlx::PgPool,
}

impl PostgresSnapshotSource {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotSource for PostgresSnapshotSource {
    async fn open(&self, shape: &Shape) -> anyhow::Result<SnapshotSession> {
        use anyhow::Context;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin snapshot transaction")?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .context("set snapshot isolation")?;
        for setting in SESSION_SETTINGS {
            sqlx::query(setting)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("apply session setting: {setting}"))?;
        }

        let xmin_text: String =
            sqlx::query_scalar("SELECT pg_snapshot_xmin(pg_current_snapshot())::text")
                .fetch_one(&mut *tx)
                .await
                .context("read snapshot xmin")?;
        let xmin: u64 = xmin_text.trim().parse().context("parse snapshot xmin")?;

        let sql = select_sql(shape);
        let columns: Vec<String> = shape
            .projection
            .iter()
            .map(|column| column.name.clone())
            .collect();
        let (row_tx, row_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        tokio::spawn(async move {
            use futures::StreamExt;

            let mut rows = sqlx::query(&sql).fetch(&mut *tx);
            while let Some(row) = rows.next().await {
                let document = row
                    .map_err(anyhow::Error::from)
                    .and_then(|row| row_document(&columns, &row));
                let failed = document.is_err();
                if row_tx.send(document).await.is_err() || failed {
                    break;
                }
            }
            drop(rows);
            // Read-only transaction; commit just releases the snapshot.
            let _ = tx.commit().await;
        });

        Ok(SnapshotSession { xmin, rows: row_rx })
    }
}

fn row_document(columns: &[String], row: &sqlx::postgres::PgRow) -> anyhow::Result<Bytes> {
    use sqlx::Row;

    let mut doc = String::with_capacity(columns.len() * 24);
    doc.push('{');
    for (index, name) in columns.iter().enumerate() {
        if index > 0 {
            doc.push(',');
        }
        doc.push_str(&serde_json::to_string(name)?);
        doc.push(':');
        let value: Option<String> = row.try_get(index)?;
        match value {
            Some(text) => doc.push_str(&serde_json::to_string(&text)?),
            None => doc.push_str("null"),
        }
    }
    doc.push('}');
    Ok(Bytes::from(doc))
}

fn select_sql(shape: &Shape) -> String {
    let columns: Vec<String> = shape
        .projection
        .iter()
        .map(|column| {
            let ident = quote_ident(&column.name);
            format!("{ident}::text AS {ident}")
        })
        .collect();
    let mut sql = format!(
        "SELECT {} FROM {}.{}",
        columns.join(", "),
        quote_ident(&shape.root_table.schema),
        quote_ident(&shape.root_table.table),
    );
    if let Some(clause) = &shape.where_clause {
        sql.push_str(&format!(" WHERE ({clause})"));
    }
    sql
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
