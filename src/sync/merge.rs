//! Merge decision for incoming remote documents.
//!
//! Decides, per table, whether to keep the local version or take the remote
//! one. Tables are never merged field by field: a table that differs in any
//! compared aspect is replaced as a whole.
//!
//! The decision is a pure function of the two documents; the cooldown and
//! authority gates that follow it live in the engine.

use std::fmt;
use tracing::debug;

use crate::model::{SeatingDocument, Table, TableId};

/// One aspect in which two versions of a table differ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    Name,
    SeatCount,
    Position,
    Guests,
}

impl fmt::Display for TableChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableChange::Name => write!(f, "name"),
            TableChange::SeatCount => write!(f, "seat count"),
            TableChange::Position => write!(f, "position"),
            TableChange::Guests => write!(f, "guests"),
        }
    }
}

/// Why the remote document is being adopted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeKind {
    /// Local plan was empty
    InitialFill,
    /// Table counts differ; tables were added or removed
    CountChanged { local: usize, remote: usize },
    /// Same count; some tables were added or differ
    TablesChanged,
}

/// Result of comparing a local and a remote document
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub kind: MergeKind,
    /// Local document with the adopted tables swapped in
    pub merged: SeatingDocument,
    /// Ids of tables taken from the remote document
    pub adopted: Vec<TableId>,
}

/// Aspects in which `remote` differs from `local`.
///
/// Guests are compared as sorted multisets of trimmed names; seat order is
/// irrelevant.
pub fn table_changes(local: &Table, remote: &Table) -> Vec<TableChange> {
    let mut changes = Vec::new();

    if local.name != remote.name {
        changes.push(TableChange::Name);
    }
    if local.seat_count != remote.seat_count {
        changes.push(TableChange::SeatCount);
    }
    if local.left != remote.left || local.top != remote.top {
        changes.push(TableChange::Position);
    }
    if local.sorted_guests() != remote.sorted_guests() {
        changes.push(TableChange::Guests);
    }

    changes
}

/// Compare the local plan with an incoming remote document.
///
/// Returns `None` when nothing needs adopting. Write metadata on `remote` is
/// ignored here; callers pass the document as received.
pub fn plan_merge(local: &SeatingDocument, remote: &SeatingDocument) -> Option<MergePlan> {
    let local_count = local.table_count();
    let remote_count = remote.table_count();
    let mut merged = local.clone();

    if local_count == 0 && remote_count > 0 {
        merged.tables = remote.tables.clone();
        return Some(MergePlan {
            kind: MergeKind::InitialFill,
            adopted: remote.tables.keys().cloned().collect(),
            merged,
        });
    }

    if local_count != remote_count {
        merged.tables = remote.tables.clone();
        return Some(MergePlan {
            kind: MergeKind::CountChanged {
                local: local_count,
                remote: remote_count,
            },
            adopted: remote.tables.keys().cloned().collect(),
            merged,
        });
    }

    let mut adopted = Vec::new();
    for (table_id, incoming) in &remote.tables {
        let take = match local.tables.get(table_id) {
            None => {
                debug!("Adopting new table {}", table_id);
                true
            }
            Some(current) => {
                let changes = table_changes(current, incoming);
                if !changes.is_empty() {
                    debug!(
                        "Table {} changed: {}",
                        table_id,
                        changes
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                !changes.is_empty()
            }
        };

        if take {
            merged.tables.insert(table_id.clone(), incoming.clone());
            adopted.push(table_id.clone());
        }
    }

    if adopted.is_empty() {
        return None;
    }

    Some(MergePlan {
        kind: MergeKind::TablesChanged,
        merged,
        adopted,
    })
}
