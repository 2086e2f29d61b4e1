// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Domain records shared by the allocation, ledger and dispatch layers.
//!
//! All amounts are integer minor units (cents). Ledger amounts are signed:
//! debits are negative, credits positive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::SealedSecret;

// =============================================================================
// Tracks and account types
// =============================================================================

/// One of the two parallel balance ledgers kept on every leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// Real money.
    Real,
    /// Practice balance. Never touches an external rail.
    Sandbox,
}

impl Track {
    pub fn from_is_real(is_real: bool) -> Self {
        if is_real {
            Track::Real
        } else {
            Track::Sandbox
        }
    }

    pub fn is_real(self) -> bool {
        matches!(self, Track::Real)
    }

    pub(crate) fn as_byte(self) -> u8 {
        match self {
            Track::Real => 1,
            Track::Sandbox => 0,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Track::Real),
            0 => Some(Track::Sandbox),
            _ => None,
        }
    }
}

/// Venue category of a leg. Carried as data; every class shares the same
/// balance arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Bookie,
    Sharp,
    Sports,
    Stock,
    Forex,
    Crypto,
}

// =============================================================================
// Leg
// =============================================================================

/// A funding destination held at an external venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub asset_class: AssetClass,
    pub display_name: String,
    /// External payout address (an MSISDN for mobile-money venues).
    pub payout_address: String,
    /// Smallest non-zero amount this leg accepts.
    pub min_amount: i64,
    /// Largest amount this leg accepts in one allocation.
    pub max_amount: i64,
    /// EWMA of recent log returns.
    pub recent_log_return: f64,
    /// EWMA of recent volatility.
    pub recent_volatility: f64,
    pub real_balance: i64,
    pub sandbox_balance: i64,
    pub active: bool,
    /// Venue credential sealed with the execution engine's shared secret,
    /// bound to this leg's id. Empty until provisioned.
    #[serde(default)]
    pub sealed_credential: SealedSecret,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Leg {
    /// Create an active leg with zero balances and no credential.
    ///
    /// Returns `None` when the constraints are inconsistent
    /// (`min_amount < 0` or `min_amount > max_amount`).
    pub fn new(
        customer_id: Uuid,
        asset_class: AssetClass,
        display_name: impl Into<String>,
        payout_address: impl Into<String>,
        min_amount: i64,
        max_amount: i64,
    ) -> Option<Self> {
        if min_amount < 0 || min_amount > max_amount {
            return None;
        }
        let now = Utc::now();
        Some(Self {
            id: Uuid::new_v4(),
            customer_id,
            asset_class,
            display_name: display_name.into(),
            payout_address: payout_address.into(),
            min_amount,
            max_amount,
            recent_log_return: 0.0,
            recent_volatility: 0.0,
            real_balance: 0,
            sandbox_balance: 0,
            active: true,
            sealed_credential: SealedSecret::default(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_credential(mut self, sealed: SealedSecret) -> Self {
        self.sealed_credential = sealed;
        self
    }

    /// Set the performance/risk signals used by deposit scoring.
    pub fn with_signals(mut self, recent_log_return: f64, recent_volatility: f64) -> Self {
        self.recent_log_return = recent_log_return;
        self.recent_volatility = recent_volatility;
        self
    }

    pub fn balance(&self, track: Track) -> i64 {
        match track {
            Track::Real => self.real_balance,
            Track::Sandbox => self.sandbox_balance,
        }
    }

    fn balance_mut(&mut self, track: Track) -> &mut i64 {
        match track {
            Track::Real => &mut self.real_balance,
            Track::Sandbox => &mut self.sandbox_balance,
        }
    }

    /// Add `amount` to the balance on `track`.
    pub fn credit(&mut self, track: Track, amount: i64) {
        let balance = self.balance_mut(track);
        *balance = balance.saturating_add(amount);
        self.updated_at = Utc::now();
    }

    /// Subtract `amount` from the balance on `track`.
    ///
    /// Returns `false` and leaves the balance untouched if it cannot cover
    /// the debit.
    pub fn debit(&mut self, track: Track, amount: i64) -> bool {
        let balance = self.balance_mut(track);
        if amount < 0 || *balance < amount {
            return false;
        }
        *balance -= amount;
        self.updated_at = Utc::now();
        true
    }
}

// =============================================================================
// Ledger entries
// =============================================================================

/// Lifecycle of a ledger entry.
///
/// `pending → processing → {success, failed}`. Deposit callbacks may settle
/// straight from `pending`. `reversed` is only reachable from `success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Reversed,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryStatus::Success | EntryStatus::Failed | EntryStatus::Reversed
        )
    }

    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Success)
                | (Pending, Failed)
                | (Processing, Success)
                | (Processing, Failed)
                | (Success, Reversed)
        )
    }
}

/// What kind of money movement an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    /// Compensating credit for a withdrawal that was never dispatched.
    Refund,
}

/// One physical side-effect attempt against one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub leg_id: Uuid,
    pub kind: EntryKind,
    /// Signed amount in cents (negative = debit).
    pub amount_cents: i64,
    pub track: Track,
    pub status: EntryStatus,
    /// Correlates all legs of one request.
    pub parent_ref: Uuid,
    /// Human-readable reference.
    pub reference: String,
    /// Unique per physical side-effect attempt.
    pub idempotency_key: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Set when the entry moves to `processing`.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create an entry with a fresh id and idempotency key.
    pub fn new(
        customer_id: Uuid,
        leg_id: Uuid,
        kind: EntryKind,
        amount_cents: i64,
        track: Track,
        status: EntryStatus,
        parent_ref: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            leg_id,
            kind,
            amount_cents,
            track,
            status,
            parent_ref,
            reference: human_reference(kind, parent_ref),
            idempotency_key: Uuid::new_v4().to_string(),
            metadata: serde_json::Map::new(),
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Absolute amount moved by this entry.
    pub fn magnitude(&self) -> i64 {
        self.amount_cents.saturating_abs()
    }
}

/// `DEP-1a2b3c4d`, `WDR-…`, `RFD-…`: kind prefix plus the first eight hex
/// digits of the parent reference.
pub fn human_reference(kind: EntryKind, parent_ref: Uuid) -> String {
    let prefix = match kind {
        EntryKind::Deposit => "DEP",
        EntryKind::Withdrawal => "WDR",
        EntryKind::Refund => "RFD",
    };
    let simple = parent_ref.simple().to_string();
    format!("{prefix}-{}", &simple[..8])
}

// =============================================================================
// Dispatch records
// =============================================================================

/// Which outbound message a dispatch record publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// Signed envelope for the execution engine.
    Withdrawal,
    /// Sequencing message for the payment-rail pusher.
    DepositSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// Committed to the ledger but not yet acknowledged by the broker.
    Unsent,
    /// Durably stored by the broker.
    Published,
    /// Retries exhausted; entries failed and compensated.
    Abandoned,
}

/// Outbox row for one committed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub parent_ref: Uuid,
    pub customer_id: Uuid,
    pub kind: DispatchKind,
    pub track: Track,
    /// Broker dedup token, fixed for the lifetime of the batch.
    pub dedup_token: String,
    pub status: DispatchStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_sha256: Option<String>,
    /// Phone number to push deposits from. Only set for deposit sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn new_unsent(
        parent_ref: Uuid,
        customer_id: Uuid,
        kind: DispatchKind,
        track: Track,
        phone: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            parent_ref,
            customer_id,
            kind,
            track,
            dedup_token: Uuid::new_v4().to_string(),
            status: DispatchStatus::Unsent,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
            broker_sequence: None,
            payload_sha256: None,
            phone,
            created_at: now,
            updated_at: now,
        }
    }
}
