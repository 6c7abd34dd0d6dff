//! In-memory seating plan.
//!
//! Holds the tables and the guest roster behind a lock so the sync engine and
//! the editing surface can share one instance. Seat moves follow the
//! drag-and-drop rules of the editor: dropping a seated guest onto an occupied
//! seat swaps the two, dropping an unseated guest sends the occupant back to
//! the unassigned pool.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use super::{LocalModel, ModelError, ModelResult, SeatingDocument, Table, TableId};

#[derive(Debug, Default)]
struct PlanState {
    tables: BTreeMap<TableId, Table>,
    /// Every known guest, seated or not, in insertion order
    roster: Vec<String>,
}

impl PlanState {
    fn table_mut(&mut self, table_id: &str) -> ModelResult<&mut Table> {
        self.tables
            .get_mut(table_id)
            .ok_or_else(|| ModelError::TableNotFound(table_id.to_string()))
    }

    fn check_seat(&self, table_id: &str, seat: usize) -> ModelResult<()> {
        let table = self
            .tables
            .get(table_id)
            .ok_or_else(|| ModelError::TableNotFound(table_id.to_string()))?;
        if seat >= table.seats.len() {
            return Err(ModelError::SeatOutOfRange {
                table: table_id.to_string(),
                seat,
                seat_count: table.seats.len(),
            });
        }
        Ok(())
    }

    /// Locate a seated guest
    fn find_guest(&self, guest: &str) -> Option<(TableId, usize)> {
        self.tables
            .iter()
            .find_map(|(id, table)| table.seat_of(guest).map(|seat| (id.clone(), seat)))
    }

    fn remember(&mut self, guest: &str) {
        if !self.roster.iter().any(|g| g == guest) {
            self.roster.push(guest.to_string());
        }
    }
}

/// The local seating plan
#[derive(Debug, Default)]
pub struct SeatingPlan {
    state: RwLock<PlanState>,
}

impl SeatingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a plan from an existing document
    pub fn from_document(doc: &SeatingDocument) -> Self {
        let plan = Self::new();
        plan.replace_tables(doc.tables.clone());
        plan
    }

    /// Add a guest to the roster without seating them
    pub fn add_guest(&self, name: &str) -> ModelResult<()> {
        let name = clean_name(name)?;
        self.state.write().remember(&name);
        Ok(())
    }

    /// Add a new table with empty seats
    pub fn add_table(
        &self,
        table_id: &str,
        name: &str,
        seat_count: usize,
        left: f64,
        top: f64,
    ) -> ModelResult<()> {
        let mut state = self.state.write();
        if state.tables.contains_key(table_id) {
            return Err(ModelError::TableExists(table_id.to_string()));
        }
        state
            .tables
            .insert(table_id.to_string(), Table::new(name, seat_count, left, top));
        debug!("Added table {} ({} seats)", table_id, seat_count);
        Ok(())
    }

    /// Remove a table; its guests return to the unassigned pool
    pub fn remove_table(&self, table_id: &str) -> ModelResult<Table> {
        self.state
            .write()
            .tables
            .remove(table_id)
            .ok_or_else(|| ModelError::TableNotFound(table_id.to_string()))
    }

    pub fn rename_table(&self, table_id: &str, name: &str) -> ModelResult<()> {
        self.state.write().table_mut(table_id)?.name = name.to_string();
        Ok(())
    }

    pub fn move_table(&self, table_id: &str, left: f64, top: f64) -> ModelResult<()> {
        let mut state = self.state.write();
        let table = state.table_mut(table_id)?;
        table.left = left;
        table.top = top;
        Ok(())
    }

    /// Resize a table; guests in truncated seats become unassigned
    pub fn set_seat_count(&self, table_id: &str, seat_count: usize) -> ModelResult<()> {
        let mut state = self.state.write();
        let table = state.table_mut(table_id)?;
        table.seats.resize(seat_count, super::Seat::empty());
        table.seat_count = seat_count;
        Ok(())
    }

    /// Seat a guest, moving them if they already sit elsewhere.
    ///
    /// Returns the guest displaced from the target seat, if any. A displaced
    /// guest takes the mover's previous seat when the mover came from a seat,
    /// otherwise they become unassigned.
    pub fn seat_guest(
        &self,
        table_id: &str,
        seat: usize,
        guest: &str,
    ) -> ModelResult<Option<String>> {
        let guest = clean_name(guest)?;
        let mut state = self.state.write();
        state.check_seat(table_id, seat)?;

        let source = state.find_guest(&guest);
        if source.as_ref() == Some(&(table_id.to_string(), seat)) {
            return Ok(None);
        }

        let displaced = state.table_mut(table_id)?.seats[seat]
            .guest
            .take()
            .filter(|name| !name.trim().is_empty());

        if let Some((source_table, source_seat)) = source {
            // Swap when the mover came from a seat; otherwise just vacate it.
            state.table_mut(&source_table)?.seats[source_seat].guest = displaced.clone();
        }

        state.table_mut(table_id)?.seats[seat].guest = Some(guest.clone());
        state.remember(&guest);

        debug!("Seated {} at {}[{}]", guest, table_id, seat);
        Ok(displaced)
    }

    /// Free a seat; the guest returns to the unassigned pool
    pub fn unseat(&self, table_id: &str, seat: usize) -> ModelResult<Option<String>> {
        let mut state = self.state.write();
        state.check_seat(table_id, seat)?;
        Ok(state.table_mut(table_id)?.seats[seat].guest.take())
    }

    /// Roster guests without a seat, in roster order
    pub fn unassigned_guests(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .roster
            .iter()
            .filter(|guest| state.find_guest(guest).is_none())
            .cloned()
            .collect()
    }

    /// Number of guests in the roster
    pub fn guest_count(&self) -> usize {
        self.state.read().roster.len()
    }

    /// Total number of seats across all tables
    pub fn seat_total(&self) -> usize {
        self.state
            .read()
            .tables
            .values()
            .map(|table| table.seat_count)
            .sum()
    }

    pub fn table(&self, table_id: &str) -> Option<Table> {
        self.state.read().tables.get(table_id).cloned()
    }

    fn replace_tables(&self, tables: BTreeMap<TableId, Table>) {
        let mut state = self.state.write();
        let seated: Vec<String> = tables
            .values()
            .flat_map(|table| table.guests_in_order())
            .collect();
        state.tables = tables;
        for guest in seated {
            state.remember(&guest);
        }
    }
}

impl LocalModel for SeatingPlan {
    fn get_state(&self) -> SeatingDocument {
        SeatingDocument::new(self.state.read().tables.clone())
    }

    fn import_state(&self, json: &str) -> ModelResult<()> {
        let doc: SeatingDocument = serde_json::from_str(json)?;
        self.replace_tables(doc.tables);
        Ok(())
    }
}

fn clean_name(name: &str) -> ModelResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ModelError::EmptyGuestName);
    }
    Ok(name.to_string())
}
