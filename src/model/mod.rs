//! Seating-plan data model.
//!
//! This module defines the shape of the shared document and the local model:
//! - `SeatingDocument`, the unit of remote synchronization
//! - `Table` and `Seat`, replaced as whole units when merged
//! - `PresenceRecord`, the ephemeral per-session marker
//! - `LocalModel`, the seam between the sync engine and the local plan

mod plan;

pub use plan::SeatingPlan;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

/// Identifier of a table within a document
pub type TableId = String;

/// Identifier of a collaborating session (one browser tab or client)
pub type SessionId = String;

/// Priority value paired with `bulletproof: true`
pub const BULLETPROOF_PRIORITY: u64 = 999_999_999;

/// Priority value paired with `forceCorrect: true`
pub const FORCE_CORRECT_PRIORITY: u64 = 999_999;

/// Errors raised by the local seating plan
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Table not found: {0}")]
    TableNotFound(TableId),

    #[error("Table already exists: {0}")]
    TableExists(TableId),

    #[error("Seat {seat} out of range for table {table} ({seat_count} seats)")]
    SeatOutOfRange {
        table: TableId,
        seat: usize,
        seat_count: usize,
    },

    #[error("Guest name is empty")]
    EmptyGuestName,

    #[error("Invalid state document: {0}")]
    InvalidState(#[from] serde_json::Error),
}

pub type ModelResult<T> = Result<T, ModelError>;

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// A write timestamp as it appears in a stored value.
///
/// Clients write `Server`, which serializes as the store's sentinel object
/// `{".sv":"timestamp"}`; the store replaces it with the milliseconds of the
/// write before persisting, so readers only ever see `At`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTimestamp {
    /// Resolved timestamp, milliseconds since the Unix epoch
    At(i64),
    /// Placeholder resolved by the store at write time
    Server,
}

impl WriteTimestamp {
    /// Key of the sentinel object
    pub const SENTINEL_KEY: &'static str = ".sv";
    /// Value of the sentinel object
    pub const SENTINEL_VALUE: &'static str = "timestamp";

    /// Resolved milliseconds, if any
    pub fn millis(&self) -> Option<i64> {
        match self {
            WriteTimestamp::At(ms) => Some(*ms),
            WriteTimestamp::Server => None,
        }
    }

    /// The sentinel as a raw JSON value
    pub fn sentinel() -> serde_json::Value {
        serde_json::json!({ Self::SENTINEL_KEY: Self::SENTINEL_VALUE })
    }

    /// Whether a raw JSON value is the server sentinel
    pub fn is_sentinel(value: &serde_json::Value) -> bool {
        match value.as_object() {
            Some(map) => {
                map.len() == 1
                    && map.get(Self::SENTINEL_KEY).and_then(|v| v.as_str())
                        == Some(Self::SENTINEL_VALUE)
            }
            None => false,
        }
    }
}

impl Serialize for WriteTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WriteTimestamp::At(ms) => serializer.serialize_i64(*ms),
            WriteTimestamp::Server => Self::sentinel().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WriteTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i64),
            Float(f64),
            Sentinel {
                #[serde(rename = ".sv")]
                sv: String,
            },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Int(ms) => Ok(WriteTimestamp::At(ms)),
            Repr::Float(ms) => Ok(WriteTimestamp::At(ms as i64)),
            Repr::Sentinel { sv } if sv == Self::SENTINEL_VALUE => Ok(WriteTimestamp::Server),
            Repr::Sentinel { sv } => Err(serde::de::Error::custom(format!(
                "unknown server value: {}",
                sv
            ))),
        }
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

/// One seat slot within a table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Seat {
    /// Full guest name, `None` when the seat is free
    #[serde(default)]
    pub guest: Option<String>,
}

impl Seat {
    pub fn empty() -> Self {
        Self { guest: None }
    }

    pub fn occupied(guest: impl Into<String>) -> Self {
        Self {
            guest: Some(guest.into()),
        }
    }

    /// Trimmed guest name, ignoring blank entries
    pub fn guest_name(&self) -> Option<&str> {
        self.guest
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// One seating table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Display name
    pub name: String,
    /// Number of seats
    pub seat_count: usize,
    /// Canvas x position
    #[serde(default)]
    pub left: f64,
    /// Canvas y position
    #[serde(default)]
    pub top: f64,
    /// Seat slots, expected to hold `seat_count` entries
    #[serde(default)]
    pub seats: Vec<Seat>,
}

impl Table {
    /// Create a table with `seat_count` empty seats
    pub fn new(name: impl Into<String>, seat_count: usize, left: f64, top: f64) -> Self {
        Self {
            name: name.into(),
            seat_count,
            left,
            top,
            seats: vec![Seat::empty(); seat_count],
        }
    }

    pub fn with_guests<I, S>(mut self, guests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (seat, guest) in self.seats.iter_mut().zip(guests) {
            seat.guest = Some(guest.into());
        }
        self
    }

    /// Seated guest names, trimmed and sorted
    pub fn sorted_guests(&self) -> Vec<String> {
        let mut guests: Vec<String> = self
            .seats
            .iter()
            .filter_map(Seat::guest_name)
            .map(str::to_string)
            .collect();
        guests.sort();
        guests
    }

    /// Seated guest names in seat order
    pub fn guests_in_order(&self) -> Vec<String> {
        self.seats
            .iter()
            .filter_map(Seat::guest_name)
            .map(str::to_string)
            .collect()
    }

    /// Find the seat a guest occupies
    pub fn seat_of(&self, guest: &str) -> Option<usize> {
        self.seats
            .iter()
            .position(|seat| seat.guest_name() == Some(guest))
    }
}

/// Decode an optional marker field, treating a value of the wrong type as absent
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

/// The shared seating-plan document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatingDocument {
    /// Tables keyed by id
    #[serde(default)]
    pub tables: BTreeMap<TableId, Table>,
    /// Server-assigned write timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<WriteTimestamp>,
    /// Session that wrote this document
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_by: Option<SessionId>,
    /// Authority marker, honoured together with `BULLETPROOF_PRIORITY`
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub bulletproof: Option<bool>,
    /// Authority marker, honoured together with `FORCE_CORRECT_PRIORITY`
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub force_correct: Option<bool>,
    /// Magic marker value, not an ordering field
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub priority: Option<u64>,
    /// Any other fields a writer attached (diagnostic markers and the like)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SeatingDocument {
    pub fn new(tables: BTreeMap<TableId, Table>) -> Self {
        Self {
            tables,
            ..Default::default()
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn has_tables(&self) -> bool {
        !self.tables.is_empty()
    }

    /// Resolved `lastUpdated`, if present
    pub fn last_updated_ms(&self) -> Option<i64> {
        self.last_updated.and_then(|ts| ts.millis())
    }

    /// Whether the writer marked this document as authoritative
    pub fn is_authoritative(&self) -> bool {
        match self.priority {
            Some(BULLETPROOF_PRIORITY) => self.bulletproof == Some(true),
            Some(FORCE_CORRECT_PRIORITY) => self.force_correct == Some(true),
            _ => false,
        }
    }

    /// Mark the document as authoritative for other clients
    pub fn with_authority(mut self) -> Self {
        self.bulletproof = Some(true);
        self.priority = Some(BULLETPROOF_PRIORITY);
        self
    }

    /// Drop write metadata, override flags and extras, keeping only the plan
    pub fn stripped(&self) -> Self {
        Self::new(self.tables.clone())
    }

    /// Attach write metadata for a push by `session_id`
    pub fn stamped(mut self, session_id: &str) -> Self {
        self.last_updated = Some(WriteTimestamp::Server);
        self.updated_by = Some(session_id.to_string());
        self
    }
}

// ============================================================================
// PRESENCE
// ============================================================================

/// Ephemeral marker that a session is connected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(default)]
    pub online: bool,
    /// Missing when a touch-up raced with a sweep
    #[serde(default)]
    pub last_seen: Option<WriteTimestamp>,
    /// Diagnostic only
    #[serde(default)]
    pub user_agent: String,
}

impl PresenceRecord {
    /// A fresh online record stamped by the server
    pub fn online(user_agent: impl Into<String>) -> Self {
        Self {
            online: true,
            last_seen: Some(WriteTimestamp::Server),
            user_agent: user_agent.into(),
        }
    }

    pub fn last_seen_ms(&self) -> Option<i64> {
        self.last_seen.and_then(|ts| ts.millis())
    }
}

// ============================================================================
// LOCAL MODEL
// ============================================================================

/// Operations the sync engine needs from the local seating plan
pub trait LocalModel: Send + Sync {
    /// Serialize the plan (no write metadata)
    fn get_state(&self) -> SeatingDocument;

    /// Replace the plan from a JSON document; idempotent for identical input
    fn import_state(&self, json: &str) -> ModelResult<()>;
}
