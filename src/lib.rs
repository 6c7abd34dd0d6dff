//! Seating-plan sync core.
//!
//! Keeps a local seating plan in step with a shared realtime document store:
//! - `model`: tables, seats and the shared document format
//! - `storage`: the realtime JSON tree, in memory or persisted in Sled
//! - `sync`: sessions, presence, debounced pushes and heuristic merges
//! - `config`: environment-driven settings for the binary

pub mod config;
pub mod model;
pub mod storage;
pub mod sync;
