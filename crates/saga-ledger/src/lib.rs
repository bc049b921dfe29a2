// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod db;
mod error;
mod repo;
mod schema;
mod verify;

pub use db::Db;
pub use error::LedgerError;
pub use repo::{AppendEvent, EventLedger, Transcript};
pub use schema::{POSTGRES_SCHEMA, SQLITE_SCHEMA};
pub use verify::{ChainReport, ChainStatus, verify_hash_chain};

// Re-export the event record so consumers can depend on saga-ledger alone.
pub use saga_envelope::{Event, GENESIS_EVENT_TYPE, envelope_hash};
