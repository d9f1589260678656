// Postgres relation schemas as decoded from the replication stream.
use serde::{Deserialize, Serialize};

use crate::shape::TableRef;

/// Table schema as reported by logical replication, identified by the
/// relation OID. The OID is stable across renames, which is what lets a
/// rename be observed as old/new identities under one id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
}

impl Relation {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.schema.clone(), self.table.clone())
    }
}

/// Before/after pair for a relation whose schema message differed from the
/// cached one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationChange {
    pub old: Relation,
    pub new: Relation,
}

impl RelationChange {
    /// Names of columns that were retyped, dropped or renamed. A renamed
    /// column shows up twice, under its old and its new name, so shapes
    /// referencing either side observe the change.
    pub fn changed_columns(&self) -> Vec<String> {
        let mut changed = Vec::new();
        for old_col in &self.old.columns {
            match self.new.columns.iter().find(|c| c.name == old_col.name) {
                Some(new_col) if new_col.type_oid == old_col.type_oid => {}
                _ => changed.push(old_col.name.clone()),
            }
        }
        for new_col in &self.new.columns {
            if !self.old.columns.iter().any(|c| c.name == new_col.name) {
                changed.push(new_col.name.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(columns: &[(&str, u32)]) -> Relation {
        Relation {
            id: 7,
            schema: "public".into(),
            table: "test_table".into(),
            columns: columns
                .iter()
                .map(|(name, oid)| RelationColumn {
                    name: (*name).into(),
                    type_oid: *oid,
                })
                .collect(),
        }
    }

    #[test]
    fn unchanged_columns_yield_nothing() {
        let change = RelationChange {
            old: relation(&[("id", 20), ("value", 25)]),
            new: relation(&[("id", 20), ("value", 25)]),
        };
        assert!(change.changed_columns().is_empty());
    }

    #[test]
    fn retyped_column_is_reported_once() {
        let change = RelationChange {
            old: relation(&[("id", 20), ("value", 25)]),
            new: relation(&[("id", 20), ("value", 1043)]),
        };
        assert_eq!(change.changed_columns(), vec!["value".to_string()]);
    }

    #[test]
    fn renamed_column_is_reported_under_both_names() {
        let change = RelationChange {
            old: relation(&[("id", 20), ("value", 25)]),
            new: relation(&[("id", 20), ("label", 25)]),
        };
        let mut changed = change.changed_columns();
        changed.sort();
        assert_eq!(changed, vec!["label".to_string(), "value".to_string()]);
    }

    #[test]
    fn dropped_column_is_reported() {
        let change = RelationChange {
            old: relation(&[("id", 20), ("value", 25)]),
            new: relation(&[("id", 20)]),
        };
        assert_eq!(change.changed_columns(), vec!["value".to_string()]);
    }
}
