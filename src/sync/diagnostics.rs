//! Sync diagnostics.
//!
//! Side-by-side comparison of the local plan and the remote document, used
//! to investigate clients that drifted apart. Guests are compared in seat
//! order here, unlike the merge decision, so reordered seats show up too.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::model::{SeatingDocument, SessionId, TableId};

/// Snapshot of the engine's bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub session_id: Option<SessionId>,
    pub collaborating: bool,
    pub merge_guard_held: bool,
    pub has_last_written: bool,
    pub last_written_at: Option<i64>,
    pub push_pending: bool,
}

/// How one table compares between local and remote
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum TableStatus {
    Match,
    GuestMismatch {
        local: Vec<String>,
        remote: Vec<String>,
    },
    LocalOnly,
    RemoteOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableReport {
    pub id: TableId,
    pub name: String,
    #[serde(flatten)]
    pub status: TableStatus,
}

/// Full diagnostic report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub engine: EngineStatus,
    pub remote_present: bool,
    pub remote_updated_by: Option<SessionId>,
    pub remote_last_updated: Option<i64>,
    pub local_table_count: usize,
    pub remote_table_count: usize,
    pub tables: Vec<TableReport>,
}

impl SyncReport {
    pub fn build(
        engine: EngineStatus,
        local: &SeatingDocument,
        remote: Option<&SeatingDocument>,
    ) -> Self {
        let empty = SeatingDocument::default();
        let remote_doc = remote.unwrap_or(&empty);

        let ids: BTreeSet<&TableId> = local
            .tables
            .keys()
            .chain(remote_doc.tables.keys())
            .collect();

        let tables = ids
            .into_iter()
            .map(|id| {
                let (name, status) = match (local.tables.get(id), remote_doc.tables.get(id)) {
                    (Some(mine), Some(theirs)) => {
                        let local_guests = mine.guests_in_order();
                        let remote_guests = theirs.guests_in_order();
                        let status = if local_guests == remote_guests {
                            TableStatus::Match
                        } else {
                            TableStatus::GuestMismatch {
                                local: local_guests,
                                remote: remote_guests,
                            }
                        };
                        (mine.name.clone(), status)
                    }
                    (Some(mine), None) => (mine.name.clone(), TableStatus::LocalOnly),
                    (None, Some(theirs)) => (theirs.name.clone(), TableStatus::RemoteOnly),
                    (None, None) => unreachable!("id comes from one of the two plans"),
                };
                TableReport {
                    id: id.clone(),
                    name,
                    status,
                }
            })
            .collect();

        Self {
            engine,
            remote_present: remote.is_some(),
            remote_updated_by: remote.and_then(|doc| doc.updated_by.clone()),
            remote_last_updated: remote.and_then(|doc| doc.last_updated_ms()),
            local_table_count: local.table_count(),
            remote_table_count: remote_doc.table_count(),
            tables,
        }
    }

    /// Tables that are not identical on both sides
    pub fn mismatches(&self) -> impl Iterator<Item = &TableReport> {
        self.tables
            .iter()
            .filter(|table| table.status != TableStatus::Match)
    }

    pub fn is_in_sync(&self) -> bool {
        self.remote_present && self.mismatches().next().is_none()
    }
}
