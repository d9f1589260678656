// Shape definitions and their content-addressed identity.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::relation::RelationChange;
use crate::{Error, Result, predicate::Predicate};

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Projected column: name plus the Postgres type it is read as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub pg_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, pg_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pg_type: pg_type.into(),
        }
    }
}

/// Declarative subset of a table: root table, optional row predicate,
/// ordered projection and primary-key columns.
///
/// Two shapes are equivalent iff these fields are structurally equal;
/// equivalence is what [`Shape::fingerprint`] hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub root_table: TableRef,
    pub where_clause: Option<String>,
    pub projection: Vec<Column>,
    pub pk: Vec<String>,
}

impl Shape {
    /// Content-addressed identity of this definition: SHA-256 over the
    /// canonical JSON serialization. Field order in the struct is the
    /// canonical order, so equal shapes always hash identically.
    pub fn fingerprint(&self) -> Fingerprint {
        let canonical =
            serde_json::to_vec(self).expect("shape serialization is infallible for valid UTF-8");
        let digest = Sha256::digest(&canonical);
        Fingerprint(digest.into())
    }

    /// Column names this shape reads: projection plus primary key plus any
    /// column named by the row predicate.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> =
            self.projection.iter().map(|c| c.name.clone()).collect();
        for key in &self.pk {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
        if let Some(clause) = &self.where_clause
            && let Some(predicate) = Predicate::parse(clause)
        {
            for name in predicate.columns() {
                if !columns.iter().any(|column| column == name) {
                    columns.push(name.to_string());
                }
            }
        }
        columns
    }

    /// Whether a relation-schema change invalidates this shape.
    ///
    /// Matching the old identity covers in-place column changes; matching
    /// the new identity covers renames onto the shape's table. When the
    /// identity is unchanged, only changes to columns the shape actually
    /// reads count. An unparseable predicate makes every column change
    /// count, never the reverse.
    pub fn is_affected_by(&self, change: &RelationChange) -> bool {
        let old_ref = change.old.table_ref();
        let new_ref = change.new.table_ref();
        if self.root_table != old_ref && self.root_table != new_ref {
            return false;
        }
        if old_ref != new_ref {
            return true;
        }
        let changed = change.changed_columns();
        if changed.is_empty() {
            return false;
        }
        if let Some(clause) = &self.where_clause
            && Predicate::parse(clause).is_none()
        {
            return true;
        }
        let referenced = self.referenced_columns();
        changed.iter().any(|name| referenced.contains(name))
    }

    /// Changes from `tx` that land in this shape's log: the change's
    /// relation is the shape's root table and the row satisfies the
    /// predicate.
    pub fn changes_for<'a>(
        &'a self,
        tx: &'a crate::Transaction,
    ) -> impl Iterator<Item = &'a crate::Change> {
        let predicate = self
            .where_clause
            .as_deref()
            .and_then(Predicate::parse);
        tx.changes.iter().filter(move |change| {
            change.relation == self.root_table
                && predicate
                    .as_ref()
                    .map(|p| p.matches(&change.record))
                    .unwrap_or(true)
        })
    }
}

/// SHA-256 digest identifying a shape definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        if input.len() != 64 {
            return Err(Error::InvalidFingerprint(input.into()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in input.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .map_err(|_| Error::InvalidFingerprint(input.into()))?;
            bytes[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::InvalidFingerprint(input.into()))?;
        }
        Ok(Fingerprint(bytes))
    }
}

/// Opaque stable identifier for a shape instance, assigned by the cache on
/// first creation and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ShapeHandle(String);

impl ShapeHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeHandle {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl FromStr for ShapeHandle {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(Error::InvalidHandle(input.into()));
        }
        Ok(Self(input.to_string()))
    }
}
