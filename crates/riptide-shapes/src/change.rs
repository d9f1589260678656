// Row-level changes decoded from the replication stream.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::offset::LogOffset;
use crate::shape::TableRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row-level change. `record` holds the row's column values as
/// decoded text (deletes may carry key columns only); `key` is the encoded
/// primary key used as the log record key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub relation: TableRef,
    pub offset: LogOffset,
    pub kind: ChangeKind,
    pub key: String,
    pub record: serde_json::Value,
}

/// A committed transaction from the log collector, already split into
/// row-level changes. `affected_relations` is the set of tables touched,
/// used to route the transaction to interested consumers without scanning
/// every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub xid: u32,
    pub lsn: u64,
    pub last_log_offset: LogOffset,
    pub changes: Vec<Change>,
    pub affected_relations: HashSet<TableRef>,
}

impl Transaction {
    pub fn touches(&self, table: &TableRef) -> bool {
        self.affected_relations.contains(table)
    }
}
