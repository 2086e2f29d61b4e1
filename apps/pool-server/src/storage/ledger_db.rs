// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded pool ledger backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `legs`: leg_id → serialized Leg
//! - `customer_legs`: `customer_id ‖ leg_id` (32 bytes) → ()
//! - `entries`: entry_id → serialized LedgerEntry
//! - `parent_entries`: `parent_ref ‖ entry_id` (32 bytes) → ()
//! - `idempotency_keys`: idempotency key → entry_id (unique)
//! - `rail_tracking`: payment-rail tracking id → entry_id
//! - `dispatches`: parent_ref → serialized DispatchRecord
//! - `audit`: `date|timestamp_ns|event_id` → serialized AuditEvent
//!
//! ## Exclusive Access
//!
//! redb admits one write transaction at a time. Every state-checked
//! operation here (claiming an entry, settling a deposit, starting a
//! dispatch attempt) reads, validates and writes inside a single write
//! transaction, which makes it an exclusive "lock, check, mutate, release"
//! unit. None of them await, so no lock is ever held across an external
//! call.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::audit::AuditEvent;
use crate::models::{
    DispatchKind, DispatchRecord, DispatchStatus, EntryKind, EntryStatus, Leg, LedgerEntry, Track,
};

// =============================================================================
// Table Definitions
// =============================================================================

const LEGS: TableDefinition<&str, &[u8]> = TableDefinition::new("legs");
const CUSTOMER_LEGS: TableDefinition<&[u8], ()> = TableDefinition::new("customer_legs");
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const PARENT_ENTRIES: TableDefinition<&[u8], ()> = TableDefinition::new("parent_entries");
const IDEMPOTENCY_KEYS: TableDefinition<&str, &str> = TableDefinition::new("idempotency_keys");
const RAIL_TRACKING: TableDefinition<&str, &str> = TableDefinition::new("rail_tracking");
const DISPATCHES: TableDefinition<&str, &[u8]> = TableDefinition::new("dispatches");
const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

type JsonTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerDbError {
    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("leg {leg_id} holds {available}, cannot debit {requested}")]
    InsufficientFunds {
        leg_id: Uuid,
        available: i64,
        requested: i64,
    },

    #[error("leg {0} is inactive or belongs to another customer")]
    LegUnavailable(Uuid),

    #[error("idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("batch {0} already committed")]
    DuplicateBatch(Uuid),

    #[error("batch has no positive leg amounts")]
    EmptyBatch,

    #[error("entry {entry_id} is a {kind:?} entry, expected {expected:?}")]
    WrongEntryKind {
        entry_id: Uuid,
        kind: EntryKind,
        expected: EntryKind,
    },

    #[error("corrupt index key: {0}")]
    Corrupt(String),
}

pub type LedgerDbResult<T> = Result<T, LedgerDbError>;

// =============================================================================
// Key and JSON Helpers
// =============================================================================

fn pair_key(a: Uuid, b: Uuid) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(a.as_bytes());
    key[16..].copy_from_slice(b.as_bytes());
    key
}

/// Inclusive bounds covering every `a ‖ *` key.
fn pair_bounds(a: Uuid) -> ([u8; 32], [u8; 32]) {
    let mut end = pair_key(a, Uuid::nil());
    end[16..].fill(0xff);
    (pair_key(a, Uuid::nil()), end)
}

fn second_of_pair(key: &[u8]) -> LedgerDbResult<Uuid> {
    Uuid::from_slice(key.get(16..).unwrap_or_default())
        .map_err(|e| LedgerDbError::Corrupt(e.to_string()))
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> LedgerDbResult<Option<T>> {
    match table.get(key)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> LedgerDbResult<()> {
    let json = serde_json::to_vec(value)?;
    table.insert(key, json.as_slice())?;
    Ok(())
}

// =============================================================================
// Batch Types
// =============================================================================

/// One leg's share of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegAmount {
    pub leg_id: Uuid,
    pub amount: i64,
}

/// What a batch commit does to balances and entries.
#[derive(Debug, Clone)]
pub enum BatchMode {
    /// Debit every leg and write `pending` withdrawal entries plus a
    /// withdrawal dispatch record.
    Withdrawal,
    /// Credit every leg and write `success` deposit entries.
    DepositCredited,
    /// Leave balances alone, write `pending` deposit entries plus a
    /// deposit-sequence dispatch record pushing from `phone`.
    DepositPending { phone: String },
}

#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub parent_ref: Uuid,
    pub entries: Vec<LedgerEntry>,
    /// Legs as written, in entry order.
    pub legs: Vec<Leg>,
    pub dispatch: Option<DispatchRecord>,
}

impl CommittedBatch {
    pub fn total(&self) -> i64 {
        self.entries.iter().map(LedgerEntry::magnitude).sum()
    }
}

/// Result of finishing a processing entry.
#[derive(Debug, Clone)]
pub struct Completion {
    pub entry: LedgerEntry,
    /// Compensating credit written when a withdrawal leg failed.
    pub refund: Option<LedgerEntry>,
}

// =============================================================================
// LedgerDb
// =============================================================================

/// Embedded ACID pool ledger.
pub struct LedgerDb {
    db: Database,
}

impl LedgerDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> LedgerDbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LEGS)?;
            let _ = write_txn.open_table(CUSTOMER_LEGS)?;
            let _ = write_txn.open_table(ENTRIES)?;
            let _ = write_txn.open_table(PARENT_ENTRIES)?;
            let _ = write_txn.open_table(IDEMPOTENCY_KEYS)?;
            let _ = write_txn.open_table(RAIL_TRACKING)?;
            let _ = write_txn.open_table(DISPATCHES)?;
            let _ = write_txn.open_table(AUDIT)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Legs
    // =========================================================================

    /// Insert or replace a leg and index it under its customer.
    pub fn upsert_leg(&self, leg: &Leg) -> LedgerDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut legs = write_txn.open_table(LEGS)?;
            put_json(&mut legs, &leg.id.to_string(), leg)?;
            let mut index = write_txn.open_table(CUSTOMER_LEGS)?;
            index.insert(pair_key(leg.customer_id, leg.id).as_slice(), ())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_leg(&self, leg_id: Uuid) -> LedgerDbResult<Option<Leg>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEGS)?;
        get_json(&table, &leg_id.to_string())
    }

    /// Every leg of a customer, active or not.
    pub fn customer_legs(&self, customer_id: Uuid) -> LedgerDbResult<Vec<Leg>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(CUSTOMER_LEGS)?;
        let legs = read_txn.open_table(LEGS)?;

        let (start, end) = pair_bounds(customer_id);
        let mut out = Vec::new();
        for entry in index.range(start.as_slice()..=end.as_slice())? {
            let (key, _) = entry?;
            let leg_id = second_of_pair(key.value())?;
            if let Some(leg) = get_json::<Leg>(&legs, &leg_id.to_string())? {
                out.push(leg);
            }
        }
        Ok(out)
    }

    pub fn active_legs(&self, customer_id: Uuid) -> LedgerDbResult<Vec<Leg>> {
        let mut legs = self.customer_legs(customer_id)?;
        legs.retain(|l| l.active);
        Ok(legs)
    }

    /// Sum of active leg balances on `track`.
    pub fn pool_balance(&self, customer_id: Uuid, track: Track) -> LedgerDbResult<i64> {
        Ok(self
            .active_legs(customer_id)?
            .iter()
            .map(|l| l.balance(track))
            .sum())
    }

    // =========================================================================
    // Batch commits
    // =========================================================================

    /// Atomically apply one allocation to the ledger.
    ///
    /// Balances are re-read inside the write transaction; a leg that can no
    /// longer cover its debit aborts the whole batch with
    /// [`LedgerDbError::InsufficientFunds`]. Nothing is written unless every
    /// leg succeeds.
    pub fn commit_batch(
        &self,
        customer_id: Uuid,
        track: Track,
        parent_ref: Uuid,
        amounts: &[LegAmount],
        mode: BatchMode,
        metadata: &Map<String, Value>,
    ) -> LedgerDbResult<CommittedBatch> {
        if !amounts.iter().any(|a| a.amount > 0) {
            return Err(LedgerDbError::EmptyBatch);
        }

        let write_txn = self.db.begin_write()?;
        let batch = {
            let mut legs = write_txn.open_table(LEGS)?;
            let mut entries = write_txn.open_table(ENTRIES)?;
            let mut parents = write_txn.open_table(PARENT_ENTRIES)?;
            let mut keys = write_txn.open_table(IDEMPOTENCY_KEYS)?;
            let mut dispatches = write_txn.open_table(DISPATCHES)?;

            let parent_key = parent_ref.to_string();
            let (start, end) = pair_bounds(parent_ref);
            let already_committed = dispatches.get(parent_key.as_str())?.is_some()
                || parents
                    .range(start.as_slice()..=end.as_slice())?
                    .next()
                    .is_some();
            if already_committed {
                return Err(LedgerDbError::DuplicateBatch(parent_ref));
            }

            let (kind, status) = match mode {
                BatchMode::Withdrawal => (EntryKind::Withdrawal, EntryStatus::Pending),
                BatchMode::DepositCredited => (EntryKind::Deposit, EntryStatus::Success),
                BatchMode::DepositPending { .. } => (EntryKind::Deposit, EntryStatus::Pending),
            };

            let mut written_entries = Vec::new();
            let mut written_legs = Vec::new();
            for share in amounts.iter().filter(|a| a.amount > 0) {
                let mut leg: Leg = get_json(&legs, &share.leg_id.to_string())?
                    .ok_or_else(|| LedgerDbError::NotFound(format!("Leg {}", share.leg_id)))?;
                if leg.customer_id != customer_id || !leg.active {
                    return Err(LedgerDbError::LegUnavailable(leg.id));
                }

                let signed_amount = match mode {
                    BatchMode::Withdrawal => {
                        let available = leg.balance(track);
                        if !leg.debit(track, share.amount) {
                            return Err(LedgerDbError::InsufficientFunds {
                                leg_id: leg.id,
                                available,
                                requested: share.amount,
                            });
                        }
                        put_json(&mut legs, &leg.id.to_string(), &leg)?;
                        -share.amount
                    }
                    BatchMode::DepositCredited => {
                        leg.credit(track, share.amount);
                        put_json(&mut legs, &leg.id.to_string(), &leg)?;
                        share.amount
                    }
                    BatchMode::DepositPending { .. } => share.amount,
                };

                let mut entry = LedgerEntry::new(
                    customer_id,
                    leg.id,
                    kind,
                    signed_amount,
                    track,
                    status,
                    parent_ref,
                )
                .with_metadata("leg_name", leg.display_name.clone())
                .with_metadata("asset_class", serde_json::to_value(leg.asset_class)?);
                for (k, v) in metadata {
                    entry.metadata.insert(k.clone(), v.clone());
                }
                if matches!(mode, BatchMode::DepositCredited) {
                    entry = entry.with_metadata("final_status", "instant_credited");
                }

                insert_entry(&mut entries, &mut parents, &mut keys, &entry)?;
                written_entries.push(entry);
                written_legs.push(leg);
            }

            let dispatch = match &mode {
                BatchMode::Withdrawal => Some(DispatchRecord::new_unsent(
                    parent_ref,
                    customer_id,
                    DispatchKind::Withdrawal,
                    track,
                    None,
                )),
                BatchMode::DepositPending { phone } => Some(DispatchRecord::new_unsent(
                    parent_ref,
                    customer_id,
                    DispatchKind::DepositSequence,
                    track,
                    Some(phone.clone()),
                )),
                BatchMode::DepositCredited => None,
            };
            if let Some(record) = &dispatch {
                put_json(&mut dispatches, &parent_key, record)?;
            }

            CommittedBatch {
                parent_ref,
                entries: written_entries,
                legs: written_legs,
                dispatch,
            }
        };
        write_txn.commit()?;
        Ok(batch)
    }

    // =========================================================================
    // Entries
    // =========================================================================

    pub fn get_entry(&self, entry_id: Uuid) -> LedgerDbResult<Option<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        get_json(&table, &entry_id.to_string())
    }

    /// All entries sharing a parent reference, including refunds.
    pub fn entries_for_parent(&self, parent_ref: Uuid) -> LedgerDbResult<Vec<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(PARENT_ENTRIES)?;
        let entries = read_txn.open_table(ENTRIES)?;

        let (start, end) = pair_bounds(parent_ref);
        let mut out: Vec<LedgerEntry> = Vec::new();
        for item in index.range(start.as_slice()..=end.as_slice())? {
            let (key, _) = item?;
            let entry_id = second_of_pair(key.value())?;
            if let Some(entry) = get_json(&entries, &entry_id.to_string())? {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    pub fn entry_by_idempotency_key(&self, key: &str) -> LedgerDbResult<Option<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(IDEMPOTENCY_KEYS)?;
        let entry_id = match keys.get(key)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let entries = read_txn.open_table(ENTRIES)?;
        get_json(&entries, &entry_id)
    }

    pub fn entry_by_tracking(&self, tracking_id: &str) -> LedgerDbResult<Option<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let tracking = read_txn.open_table(RAIL_TRACKING)?;
        let entry_id = match tracking.get(tracking_id)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let entries = read_txn.open_table(ENTRIES)?;
        get_json(&entries, &entry_id)
    }

    /// Exclusively move a `pending` entry to `processing`.
    ///
    /// Returns `None` if the entry was already claimed or finished, so only
    /// the first claimant acts on it.
    pub fn claim_entry(&self, entry_id: Uuid) -> LedgerDbResult<Option<LedgerEntry>> {
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let key = entry_id.to_string();
            let mut entry: LedgerEntry = get_json(&entries, &key)?
                .ok_or_else(|| LedgerDbError::NotFound(format!("Entry {entry_id}")))?;
            if entry.status == EntryStatus::Pending {
                let now = chrono::Utc::now();
                entry.status = EntryStatus::Processing;
                entry.claimed_at = Some(now);
                entry.updated_at = now;
                put_json(&mut entries, &key, &entry)?;
                Some(entry)
            } else {
                None
            }
        };
        if claimed.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(claimed)
    }

    /// Finish a claimed entry as `success` or `failed`, merging `metadata`.
    ///
    /// A failed withdrawal writes a `refund` entry crediting the leg back in
    /// the same transaction. Returns `None` if the entry is already terminal.
    pub fn complete_entry(
        &self,
        entry_id: Uuid,
        success: bool,
        metadata: Map<String, Value>,
    ) -> LedgerDbResult<Option<Completion>> {
        let reason = if success { None } else { Some("execution_failed") };
        self.finish_entry(entry_id, None, success, metadata, reason)
    }

    /// Withdrawal entries still `processing` that were claimed at or before
    /// `claimed_before`, oldest claim first.
    pub fn stalled_withdrawals(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> LedgerDbResult<Vec<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let entry: LedgerEntry = serde_json::from_slice(value.value())?;
            let stalled = entry.kind == EntryKind::Withdrawal
                && entry.status == EntryStatus::Processing
                && entry.claimed_at.is_some_and(|at| at <= claimed_before);
            if stalled {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.claimed_at);
        Ok(out)
    }

    /// Fail a claimed withdrawal whose worker never reported back and refund
    /// its leg. Returns `None` if the entry finished in the meantime.
    pub fn expire_stalled_entry(
        &self,
        entry_id: Uuid,
        reason: &str,
    ) -> LedgerDbResult<Option<Completion>> {
        let mut metadata = Map::new();
        metadata.insert("reason".to_string(), Value::from(reason));
        self.finish_entry(
            entry_id,
            Some(EntryKind::Withdrawal),
            false,
            metadata,
            Some(reason),
        )
    }

    /// Index a payment-rail tracking id for a deposit entry.
    pub fn attach_tracking(&self, entry_id: Uuid, tracking_id: &str) -> LedgerDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let key = entry_id.to_string();
            let mut entry: LedgerEntry = get_json(&entries, &key)?
                .ok_or_else(|| LedgerDbError::NotFound(format!("Entry {entry_id}")))?;
            entry
                .metadata
                .insert("tracking_id".to_string(), Value::from(tracking_id));
            put_json(&mut entries, &key, &entry)?;

            let mut tracking = write_txn.open_table(RAIL_TRACKING)?;
            tracking.insert(tracking_id, key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Apply a payment-rail result to a deposit entry.
    ///
    /// Success credits the leg. Returns `None` for an entry that is already
    /// terminal, so repeated callbacks are harmless.
    pub fn settle_deposit(
        &self,
        entry_id: Uuid,
        success: bool,
        metadata: Map<String, Value>,
    ) -> LedgerDbResult<Option<LedgerEntry>> {
        let reason = if success { None } else { Some("rail_rejected") };
        Ok(self
            .finish_entry(entry_id, Some(EntryKind::Deposit), success, metadata, reason)?
            .map(|c| c.entry))
    }

    fn finish_entry(
        &self,
        entry_id: Uuid,
        expected_kind: Option<EntryKind>,
        success: bool,
        metadata: Map<String, Value>,
        failure_reason: Option<&str>,
    ) -> LedgerDbResult<Option<Completion>> {
        let write_txn = self.db.begin_write()?;
        let completion = {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let key = entry_id.to_string();
            let mut entry: LedgerEntry = get_json(&entries, &key)?
                .ok_or_else(|| LedgerDbError::NotFound(format!("Entry {entry_id}")))?;

            if let Some(expected) = expected_kind {
                if entry.kind != expected {
                    return Err(LedgerDbError::WrongEntryKind {
                        entry_id,
                        kind: entry.kind,
                        expected,
                    });
                }
            }

            let next = if success {
                EntryStatus::Success
            } else {
                EntryStatus::Failed
            };
            if !entry.status.can_transition_to(next) || entry.status.is_terminal() {
                None
            } else {
                entry.status = next;
                entry.updated_at = chrono::Utc::now();
                entry.metadata.extend(metadata);
                if let Some(reason) = failure_reason {
                    entry
                        .metadata
                        .entry("reason")
                        .or_insert_with(|| Value::from(reason));
                }
                put_json(&mut entries, &key, &entry)?;

                let mut legs = write_txn.open_table(LEGS)?;
                let refund = match (entry.kind, success) {
                    (EntryKind::Deposit, true) => {
                        credit_leg(&mut legs, entry.leg_id, entry.track, entry.magnitude())?;
                        None
                    }
                    (EntryKind::Withdrawal, false) => {
                        let mut parents = write_txn.open_table(PARENT_ENTRIES)?;
                        let mut keys = write_txn.open_table(IDEMPOTENCY_KEYS)?;
                        Some(write_refund(
                            &mut legs,
                            &mut entries,
                            &mut parents,
                            &mut keys,
                            &entry,
                            failure_reason.unwrap_or("execution_failed"),
                        )?)
                    }
                    _ => None,
                };
                Some(Completion { entry, refund })
            }
        };
        if completion.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(completion)
    }

    // =========================================================================
    // Dispatch records
    // =========================================================================

    pub fn get_dispatch(&self, parent_ref: Uuid) -> LedgerDbResult<Option<DispatchRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DISPATCHES)?;
        get_json(&table, &parent_ref.to_string())
    }

    pub fn unsent_dispatches(&self) -> LedgerDbResult<Vec<DispatchRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DISPATCHES)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let record: DispatchRecord = serde_json::from_slice(value.value())?;
            if record.status == DispatchStatus::Unsent {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    /// Start a publish attempt for an `unsent` batch.
    ///
    /// Returns `None` when the batch was already published or abandoned,
    /// which makes a repeated dispatch a no-op.
    pub fn begin_dispatch_attempt(&self, parent_ref: Uuid) -> LedgerDbResult<Option<DispatchRecord>> {
        self.update_dispatch(parent_ref, |record| {
            if record.status != DispatchStatus::Unsent {
                return false;
            }
            record.attempts += 1;
            record.last_attempt_at = Some(chrono::Utc::now());
            true
        })
    }

    pub fn mark_dispatch_published(
        &self,
        parent_ref: Uuid,
        broker_sequence: u64,
        payload_sha256: String,
    ) -> LedgerDbResult<Option<DispatchRecord>> {
        self.update_dispatch(parent_ref, |record| {
            if record.status != DispatchStatus::Unsent {
                return false;
            }
            record.status = DispatchStatus::Published;
            record.broker_sequence = Some(broker_sequence);
            record.payload_sha256 = Some(payload_sha256);
            record.last_error = None;
            true
        })
    }

    pub fn record_dispatch_failure(
        &self,
        parent_ref: Uuid,
        error: &str,
    ) -> LedgerDbResult<Option<DispatchRecord>> {
        self.update_dispatch(parent_ref, |record| {
            if record.status != DispatchStatus::Unsent {
                return false;
            }
            record.last_error = Some(error.to_string());
            true
        })
    }

    fn update_dispatch(
        &self,
        parent_ref: Uuid,
        apply: impl FnOnce(&mut DispatchRecord) -> bool,
    ) -> LedgerDbResult<Option<DispatchRecord>> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(DISPATCHES)?;
            let key = parent_ref.to_string();
            let mut record: DispatchRecord = get_json(&table, &key)?
                .ok_or_else(|| LedgerDbError::NotFound(format!("Dispatch {parent_ref}")))?;
            if apply(&mut record) {
                record.updated_at = chrono::Utc::now();
                put_json(&mut table, &key, &record)?;
                Some(record)
            } else {
                None
            }
        };
        if updated.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(updated)
    }

    /// Give up on an `unsent` batch.
    ///
    /// Every still-pending entry is marked `failed`; each failed withdrawal
    /// entry gets a compensating `refund`. Returns the refunds written, or
    /// `None` if the batch was no longer unsent.
    pub fn abandon_dispatch(
        &self,
        parent_ref: Uuid,
        reason: &str,
    ) -> LedgerDbResult<Option<Vec<LedgerEntry>>> {
        let write_txn = self.db.begin_write()?;
        let refunds = {
            let mut dispatches = write_txn.open_table(DISPATCHES)?;
            let key = parent_ref.to_string();
            let mut record: DispatchRecord = get_json(&dispatches, &key)?
                .ok_or_else(|| LedgerDbError::NotFound(format!("Dispatch {parent_ref}")))?;

            if record.status != DispatchStatus::Unsent {
                None
            } else {
                let now = chrono::Utc::now();
                record.status = DispatchStatus::Abandoned;
                record.last_error = Some(reason.to_string());
                record.updated_at = now;
                put_json(&mut dispatches, &key, &record)?;

                let mut entries = write_txn.open_table(ENTRIES)?;
                let mut parents = write_txn.open_table(PARENT_ENTRIES)?;
                let mut keys = write_txn.open_table(IDEMPOTENCY_KEYS)?;
                let mut legs = write_txn.open_table(LEGS)?;

                let (start, end) = pair_bounds(parent_ref);
                let entry_ids = parents
                    .range(start.as_slice()..=end.as_slice())?
                    .map(|item| {
                        item.map_err(LedgerDbError::from)
                            .and_then(|(k, _)| second_of_pair(k.value()))
                    })
                    .collect::<LedgerDbResult<Vec<Uuid>>>()?;

                let mut refunds = Vec::new();
                for entry_id in entry_ids {
                    let entry_key = entry_id.to_string();
                    let Some(mut entry) = get_json::<LedgerEntry>(&entries, &entry_key)? else {
                        continue;
                    };
                    if entry.status != EntryStatus::Pending {
                        continue;
                    }
                    entry.status = EntryStatus::Failed;
                    entry.updated_at = now;
                    entry
                        .metadata
                        .insert("reason".to_string(), Value::from(reason));
                    put_json(&mut entries, &entry_key, &entry)?;

                    if entry.kind == EntryKind::Withdrawal {
                        refunds.push(write_refund(
                            &mut legs,
                            &mut entries,
                            &mut parents,
                            &mut keys,
                            &entry,
                            reason,
                        )?);
                    }
                }
                Some(refunds)
            }
        };
        if refunds.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(refunds)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    pub fn append_audit(&self, event: &AuditEvent) -> LedgerDbResult<()> {
        let nanos = event.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let key = format!("{}|{:020}|{}", event.date(), nanos, event.event_id);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIT)?;
            put_json(&mut table, &key, event)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Events of one day (`YYYY-MM-DD`), oldest first.
    pub fn audit_events(&self, date: &str) -> LedgerDbResult<Vec<AuditEvent>> {
        let start = format!("{date}|");
        let end = format!("{date}|\u{7f}");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT)?;
        let mut events = Vec::new();
        for item in table.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            events.push(serde_json::from_slice(value.value())?);
        }
        Ok(events)
    }

    pub fn audit_events_for_customer(
        &self,
        customer_id: Uuid,
        date: &str,
    ) -> LedgerDbResult<Vec<AuditEvent>> {
        Ok(self
            .audit_events(date)?
            .into_iter()
            .filter(|e| e.customer_id == Some(customer_id))
            .collect())
    }
}

// =============================================================================
// In-transaction helpers
// =============================================================================

fn insert_entry(
    entries: &mut JsonTable<'_>,
    parents: &mut Table<'_, &'static [u8], ()>,
    keys: &mut Table<'_, &'static str, &'static str>,
    entry: &LedgerEntry,
) -> LedgerDbResult<()> {
    if keys.get(entry.idempotency_key.as_str())?.is_some() {
        return Err(LedgerDbError::DuplicateIdempotencyKey(
            entry.idempotency_key.clone(),
        ));
    }
    let id = entry.id.to_string();
    put_json(entries, &id, entry)?;
    parents.insert(pair_key(entry.parent_ref, entry.id).as_slice(), ())?;
    keys.insert(entry.idempotency_key.as_str(), id.as_str())?;
    Ok(())
}

fn credit_leg(legs: &mut JsonTable<'_>, leg_id: Uuid, track: Track, amount: i64) -> LedgerDbResult<Leg> {
    let key = leg_id.to_string();
    let mut leg: Leg =
        get_json(legs, &key)?.ok_or_else(|| LedgerDbError::NotFound(format!("Leg {leg_id}")))?;
    leg.credit(track, amount);
    put_json(legs, &key, &leg)?;
    Ok(leg)
}

/// Credit back a failed withdrawal entry with a `success` refund entry.
fn write_refund(
    legs: &mut JsonTable<'_>,
    entries: &mut JsonTable<'_>,
    parents: &mut Table<'_, &'static [u8], ()>,
    keys: &mut Table<'_, &'static str, &'static str>,
    failed: &LedgerEntry,
    reason: &str,
) -> LedgerDbResult<LedgerEntry> {
    credit_leg(legs, failed.leg_id, failed.track, failed.magnitude())?;
    let refund = LedgerEntry::new(
        failed.customer_id,
        failed.leg_id,
        EntryKind::Refund,
        failed.magnitude(),
        failed.track,
        EntryStatus::Success,
        failed.parent_ref,
    )
    .with_metadata("refund_of", failed.id.to_string())
    .with_metadata("reason", reason);
    insert_entry(entries, parents, keys, &refund)?;
    Ok(refund)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetClass;

    fn temp_db() -> (LedgerDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();
        (db, dir)
    }

    fn funded_leg(db: &LedgerDb, customer: Uuid, real: i64) -> Leg {
        let mut leg = Leg::new(customer, AssetClass::Bookie, "Venue", "+254700000001", 0, 1_000_000)
            .unwrap();
        leg.credit(Track::Real, real);
        db.upsert_leg(&leg).unwrap();
        leg
    }

    fn share(leg: &Leg, amount: i64) -> LegAmount {
        LegAmount {
            leg_id: leg.id,
            amount,
        }
    }

    #[test]
    fn legs_are_indexed_per_customer() {
        let (db, _dir) = temp_db();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a1 = funded_leg(&db, alice, 100);
        let mut a2 = funded_leg(&db, alice, 200);
        funded_leg(&db, bob, 300);

        assert_eq!(db.customer_legs(alice).unwrap().len(), 2);
        assert_eq!(db.pool_balance(alice, Track::Real).unwrap(), 300);

        a2.active = false;
        db.upsert_leg(&a2).unwrap();
        let active = db.active_legs(alice).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a1.id);
        assert_eq!(db.get_leg(a2.id).unwrap().unwrap().active, false);
    }

    #[test]
    fn withdrawal_commit_debits_and_writes_pending_entries() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let l1 = funded_leg(&db, customer, 3000);
        let l2 = funded_leg(&db, customer, 7000);
        let parent = Uuid::new_v4();

        let batch = db
            .commit_batch(
                customer,
                Track::Real,
                parent,
                &[share(&l1, 3000), share(&l2, 7000)],
                BatchMode::Withdrawal,
                &Map::new(),
            )
            .unwrap();

        assert_eq!(batch.total(), 10_000);
        assert!(batch
            .entries
            .iter()
            .all(|e| e.status == EntryStatus::Pending && e.amount_cents < 0));
        assert_eq!(db.pool_balance(customer, Track::Real).unwrap(), 0);
        assert_eq!(db.entries_for_parent(parent).unwrap().len(), 2);

        let dispatch = db.get_dispatch(parent).unwrap().unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Unsent);
        assert_eq!(dispatch.kind, DispatchKind::Withdrawal);

        let by_key = db
            .entry_by_idempotency_key(&batch.entries[0].idempotency_key)
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, batch.entries[0].id);
    }

    #[test]
    fn insufficient_leg_aborts_the_whole_batch() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let l1 = funded_leg(&db, customer, 500);
        let l2 = funded_leg(&db, customer, 100);
        let parent = Uuid::new_v4();

        let err = db
            .commit_batch(
                customer,
                Track::Real,
                parent,
                &[share(&l1, 500), share(&l2, 101)],
                BatchMode::Withdrawal,
                &Map::new(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerDbError::InsufficientFunds {
                available: 100,
                requested: 101,
                ..
            }
        ));
        assert_eq!(db.get_leg(l1.id).unwrap().unwrap().real_balance, 500);
        assert!(db.entries_for_parent(parent).unwrap().is_empty());
        assert!(db.get_dispatch(parent).unwrap().is_none());
    }

    #[test]
    fn foreign_leg_and_duplicate_parent_are_rejected() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let other = funded_leg(&db, Uuid::new_v4(), 100);
        let mine = funded_leg(&db, customer, 100);

        assert!(matches!(
            db.commit_batch(
                customer,
                Track::Real,
                Uuid::new_v4(),
                &[share(&other, 10)],
                BatchMode::Withdrawal,
                &Map::new()
            ),
            Err(LedgerDbError::LegUnavailable(_))
        ));

        let parent = Uuid::new_v4();
        db.commit_batch(
            customer,
            Track::Real,
            parent,
            &[share(&mine, 10)],
            BatchMode::Withdrawal,
            &Map::new(),
        )
        .unwrap();
        assert!(matches!(
            db.commit_batch(
                customer,
                Track::Real,
                parent,
                &[share(&mine, 10)],
                BatchMode::Withdrawal,
                &Map::new()
            ),
            Err(LedgerDbError::DuplicateBatch(_))
        ));
        assert!(matches!(
            db.commit_batch(
                customer,
                Track::Real,
                Uuid::new_v4(),
                &[share(&mine, 0)],
                BatchMode::Withdrawal,
                &Map::new()
            ),
            Err(LedgerDbError::EmptyBatch)
        ));
    }

    #[test]
    fn claim_is_exclusive_and_completion_is_final() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 1000);
        let batch = db
            .commit_batch(
                customer,
                Track::Real,
                Uuid::new_v4(),
                &[share(&leg, 400)],
                BatchMode::Withdrawal,
                &Map::new(),
            )
            .unwrap();
        let entry_id = batch.entries[0].id;

        assert!(db.claim_entry(entry_id).unwrap().is_some());
        assert!(db.claim_entry(entry_id).unwrap().is_none());

        let mut meta = Map::new();
        meta.insert("receipt".into(), Value::from("RCPT-1"));
        let done = db.complete_entry(entry_id, true, meta).unwrap().unwrap();
        assert_eq!(done.entry.status, EntryStatus::Success);
        assert_eq!(done.entry.metadata["receipt"], "RCPT-1");
        assert!(done.refund.is_none());

        assert!(db.complete_entry(entry_id, false, Map::new()).unwrap().is_none());
        assert_eq!(db.get_leg(leg.id).unwrap().unwrap().real_balance, 600);
    }

    #[test]
    fn stalled_claims_are_expired_and_refunded() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 1000);
        let other = funded_leg(&db, customer, 1000);
        let batch = db
            .commit_batch(
                customer,
                Track::Real,
                Uuid::new_v4(),
                &[share(&leg, 300), share(&other, 200)],
                BatchMode::Withdrawal,
                &Map::new(),
            )
            .unwrap();
        let claimed = batch.entries[0].id;
        let untouched = batch.entries[1].id;

        let entry = db.claim_entry(claimed).unwrap().unwrap();
        let claimed_at = entry.claimed_at.unwrap();
        assert!(db
            .stalled_withdrawals(claimed_at - chrono::Duration::seconds(1))
            .unwrap()
            .is_empty());

        let stalled = db.stalled_withdrawals(Utc::now()).unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, claimed);

        let done = db.expire_stalled_entry(claimed, "execution_stalled").unwrap().unwrap();
        assert_eq!(done.entry.status, EntryStatus::Failed);
        assert_eq!(done.entry.metadata["reason"], "execution_stalled");
        assert_eq!(done.refund.unwrap().amount_cents, 300);
        assert_eq!(db.get_leg(leg.id).unwrap().unwrap().real_balance, 1000);

        assert!(db.stalled_withdrawals(Utc::now()).unwrap().is_empty());
        assert!(db.expire_stalled_entry(claimed, "execution_stalled").unwrap().is_none());
        assert_eq!(db.get_entry(untouched).unwrap().unwrap().status, EntryStatus::Pending);
    }

    #[test]
    fn failed_withdrawal_leg_is_refunded() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 1000);
        let parent = Uuid::new_v4();
        let batch = db
            .commit_batch(
                customer,
                Track::Real,
                parent,
                &[share(&leg, 400)],
                BatchMode::Withdrawal,
                &Map::new(),
            )
            .unwrap();
        let entry_id = batch.entries[0].id;
        db.claim_entry(entry_id).unwrap();

        let mut meta = Map::new();
        meta.insert("error".into(), Value::from("venue timeout"));
        let done = db.complete_entry(entry_id, false, meta).unwrap().unwrap();

        assert_eq!(done.entry.status, EntryStatus::Failed);
        assert_eq!(done.entry.metadata["error"], "venue timeout");
        let refund = done.refund.unwrap();
        assert_eq!(refund.kind, EntryKind::Refund);
        assert_eq!(refund.amount_cents, 400);
        assert_eq!(refund.status, EntryStatus::Success);
        assert_eq!(db.get_leg(leg.id).unwrap().unwrap().real_balance, 1000);
        assert_eq!(db.entries_for_parent(parent).unwrap().len(), 2);
    }

    #[test]
    fn credited_deposit_updates_balances_immediately() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 0);

        let batch = db
            .commit_batch(
                customer,
                Track::Sandbox,
                Uuid::new_v4(),
                &[share(&leg, 250)],
                BatchMode::DepositCredited,
                &Map::new(),
            )
            .unwrap();

        assert!(batch.dispatch.is_none());
        assert_eq!(batch.entries[0].status, EntryStatus::Success);
        assert_eq!(batch.entries[0].metadata["final_status"], "instant_credited");
        let stored = db.get_leg(leg.id).unwrap().unwrap();
        assert_eq!(stored.sandbox_balance, 250);
        assert_eq!(stored.real_balance, 0);
    }

    #[test]
    fn pending_deposit_credits_only_on_successful_settlement() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let l1 = funded_leg(&db, customer, 0);
        let l2 = funded_leg(&db, customer, 0);

        let batch = db
            .commit_batch(
                customer,
                Track::Real,
                Uuid::new_v4(),
                &[share(&l1, 100), share(&l2, 200)],
                BatchMode::DepositPending {
                    phone: "+254700000002".into(),
                },
                &Map::new(),
            )
            .unwrap();
        assert_eq!(db.pool_balance(customer, Track::Real).unwrap(), 0);
        assert_eq!(
            batch.dispatch.as_ref().unwrap().phone.as_deref(),
            Some("+254700000002")
        );

        let (e1, e2) = (batch.entries[0].id, batch.entries[1].id);
        db.claim_entry(e1).unwrap();
        db.attach_tracking(e1, "TRK-1").unwrap();
        assert_eq!(db.entry_by_tracking("TRK-1").unwrap().unwrap().id, e1);

        let settled = db.settle_deposit(e1, true, Map::new()).unwrap().unwrap();
        assert_eq!(settled.status, EntryStatus::Success);
        assert!(db.settle_deposit(e1, true, Map::new()).unwrap().is_none());
        assert_eq!(db.get_leg(l1.id).unwrap().unwrap().real_balance, 100);

        let failed = db.settle_deposit(e2, false, Map::new()).unwrap().unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(db.get_leg(l2.id).unwrap().unwrap().real_balance, 0);
    }

    #[test]
    fn settle_rejects_withdrawal_entries() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 100);
        let batch = db
            .commit_batch(
                customer,
                Track::Real,
                Uuid::new_v4(),
                &[share(&leg, 100)],
                BatchMode::Withdrawal,
                &Map::new(),
            )
            .unwrap();
        assert!(matches!(
            db.settle_deposit(batch.entries[0].id, true, Map::new()),
            Err(LedgerDbError::WrongEntryKind { .. })
        ));
    }

    #[test]
    fn dispatch_attempts_stop_once_published() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 100);
        let parent = Uuid::new_v4();
        db.commit_batch(
            customer,
            Track::Real,
            parent,
            &[share(&leg, 100)],
            BatchMode::Withdrawal,
            &Map::new(),
        )
        .unwrap();

        let first = db.begin_dispatch_attempt(parent).unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        db.record_dispatch_failure(parent, "broker down").unwrap();
        let second = db.begin_dispatch_attempt(parent).unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.last_error.as_deref(), Some("broker down"));
        assert_eq!(db.unsent_dispatches().unwrap().len(), 1);

        let published = db
            .mark_dispatch_published(parent, 7, "abc".into())
            .unwrap()
            .unwrap();
        assert_eq!(published.broker_sequence, Some(7));
        assert!(db.begin_dispatch_attempt(parent).unwrap().is_none());
        assert!(db.unsent_dispatches().unwrap().is_empty());
        assert!(db.abandon_dispatch(parent, "x").unwrap().is_none());
    }

    #[test]
    fn abandoning_a_withdrawal_fails_entries_and_refunds() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let l1 = funded_leg(&db, customer, 3000);
        let l2 = funded_leg(&db, customer, 7000);
        let parent = Uuid::new_v4();
        db.commit_batch(
            customer,
            Track::Real,
            parent,
            &[share(&l1, 3000), share(&l2, 7000)],
            BatchMode::Withdrawal,
            &Map::new(),
        )
        .unwrap();

        let refunds = db
            .abandon_dispatch(parent, "dispatch_exhausted")
            .unwrap()
            .unwrap();
        assert_eq!(refunds.len(), 2);
        assert_eq!(db.pool_balance(customer, Track::Real).unwrap(), 10_000);

        let entries = db.entries_for_parent(parent).unwrap();
        let failed: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Withdrawal)
            .collect();
        assert!(failed.iter().all(|e| e.status == EntryStatus::Failed
            && e.metadata["reason"] == "dispatch_exhausted"));
        assert_eq!(
            db.get_dispatch(parent).unwrap().unwrap().status,
            DispatchStatus::Abandoned
        );
    }

    #[test]
    fn abandoning_a_deposit_does_not_refund() {
        let (db, _dir) = temp_db();
        let customer = Uuid::new_v4();
        let leg = funded_leg(&db, customer, 0);
        let parent = Uuid::new_v4();
        db.commit_batch(
            customer,
            Track::Real,
            parent,
            &[share(&leg, 500)],
            BatchMode::DepositPending {
                phone: "+254700000003".into(),
            },
            &Map::new(),
        )
        .unwrap();

        let refunds = db.abandon_dispatch(parent, "dispatch_exhausted").unwrap().unwrap();
        assert!(refunds.is_empty());
        assert_eq!(db.get_leg(leg.id).unwrap().unwrap().real_balance, 0);
        assert_eq!(
            db.entries_for_parent(parent).unwrap()[0].status,
            EntryStatus::Failed
        );
    }
}
