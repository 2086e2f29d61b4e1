// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Pool Storage
//!
//! Persistent state lives in one embedded redb database under `DATA_DIR`:
//!
//! ```text
//! $DATA_DIR/
//!   ledger.redb   # legs, ledger entries, dispatch outbox, audit trail
//!   broker.redb   # message channel (see crate::broker)
//! ```
//!
//! Outstanding one-time codes are short-lived and kept in process
//! ([`InMemoryOtpStore`]).

pub mod audit;
pub mod ledger_db;
pub mod otp_cache;

pub use audit::{AuditEvent, AuditEventType};
pub use ledger_db::{
    BatchMode, CommittedBatch, Completion, LedgerDb, LedgerDbError, LedgerDbResult, LegAmount,
};
pub use otp_cache::InMemoryOtpStore;

/// File name of the ledger database inside the data directory.
pub const LEDGER_DB_FILE: &str = "ledger.redb";
/// File name of the broker database inside the data directory.
pub const BROKER_DB_FILE: &str = "broker.redb";
