// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Outbound Dispatch
//!
//! Turns a committed batch into its broker message and publishes it.
//!
//! | Batch kind | Subject | Payload |
//! |------------|---------|---------|
//! | withdrawal | `withdrawal.secure` | sealed [`WithdrawalEnvelope`](crate::crypto::WithdrawalEnvelope) |
//! | real deposit | `deposit.sequence` | JSON [`DepositSequence`] |
//!
//! Every publish attempt first moves the batch's dispatch record through
//! [`LedgerDb::begin_dispatch_attempt`], which refuses batches that are
//! already published or abandoned. All attempts reuse the dedup token fixed
//! at commit time, so a retry after an ambiguous failure is collapsed by the
//! broker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{MessageChannel, DEPOSIT_SUBJECT, WITHDRAWAL_SUBJECT};
use crate::crypto::{EnvelopeLeg, EnvelopeSealer, SealBatch};
use crate::error::PoolError;
use crate::models::{DispatchKind, DispatchRecord, EntryKind};
use crate::storage::{audit, AuditEvent, AuditEventType, LedgerDb, LedgerDbError};

/// Schema version of [`DepositSequence`] messages.
pub const DEPOSIT_SEQUENCE_VERSION: u16 = 1;

/// One leg the deposit sequencer must push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedLeg {
    pub entry_id: Uuid,
    pub leg_id: Uuid,
    pub amount_cents: i64,
    pub idempotency_key: String,
}

/// Message on `deposit.sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSequence {
    pub schema_version: u16,
    pub parent_ref: Uuid,
    pub customer_id: Uuid,
    pub phone: String,
    pub legs: Vec<SequencedLeg>,
}

impl DepositSequence {
    /// Decode and check the schema version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let message: Self = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        if message.schema_version != DEPOSIT_SEQUENCE_VERSION {
            return Err(format!(
                "unsupported deposit sequence version {}",
                message.schema_version
            ));
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published { sequence: u64, duplicate: bool },
    /// The batch was already published or abandoned; nothing was sent.
    AlreadyHandled,
}

pub struct Dispatcher {
    ledger: Arc<LedgerDb>,
    channel: Arc<dyn MessageChannel>,
    sealer: EnvelopeSealer,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<LedgerDb>,
        channel: Arc<dyn MessageChannel>,
        sealer: EnvelopeSealer,
    ) -> Self {
        Self {
            ledger,
            channel,
            sealer,
        }
    }

    /// Publish the message for batch `parent_ref`.
    ///
    /// A failure is recorded on the dispatch record and returned; the ledger
    /// entries stay `pending` for the reconciler.
    pub async fn dispatch(&self, parent_ref: Uuid) -> Result<DispatchOutcome, PoolError> {
        let Some(record) = self.ledger.begin_dispatch_attempt(parent_ref)? else {
            return Ok(DispatchOutcome::AlreadyHandled);
        };

        match self.publish(&record).await {
            Ok((sequence, duplicate, digest)) => {
                self.ledger
                    .mark_dispatch_published(parent_ref, sequence, digest)?;
                info!(
                    parent_ref = %parent_ref,
                    kind = ?record.kind,
                    sequence,
                    duplicate,
                    attempt = record.attempts,
                    "Batch published"
                );
                audit::record(
                    &self.ledger,
                    AuditEvent::new(AuditEventType::DispatchPublished)
                        .with_customer(record.customer_id)
                        .with_resource("batch", parent_ref)
                        .with_details(serde_json::json!({
                            "sequence": sequence,
                            "duplicate": duplicate,
                            "attempt": record.attempts,
                        })),
                );
                Ok(DispatchOutcome::Published {
                    sequence,
                    duplicate,
                })
            }
            Err(e) => {
                warn!(
                    parent_ref = %parent_ref,
                    attempt = record.attempts,
                    error = %e,
                    "Batch publish failed; left for reconciliation"
                );
                self.ledger
                    .record_dispatch_failure(parent_ref, &e.to_string())?;
                audit::record(
                    &self.ledger,
                    AuditEvent::new(AuditEventType::DispatchFailed)
                        .with_customer(record.customer_id)
                        .with_resource("batch", parent_ref)
                        .failed(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn publish(&self, record: &DispatchRecord) -> Result<(u64, bool, String), PoolError> {
        let (subject, payload) = match record.kind {
            DispatchKind::Withdrawal => (WITHDRAWAL_SUBJECT, self.withdrawal_payload(record)?),
            DispatchKind::DepositSequence => (DEPOSIT_SUBJECT, self.deposit_payload(record)?),
        };
        let digest = hex::encode(Sha256::digest(&payload));
        let ack = self
            .channel
            .publish(subject, payload, &record.dedup_token)
            .await?;
        Ok((ack.sequence, ack.duplicate, digest))
    }

    fn withdrawal_payload(&self, record: &DispatchRecord) -> Result<Vec<u8>, PoolError> {
        let token = Uuid::parse_str(&record.dedup_token)
            .map_err(|e| PoolError::Persistence(LedgerDbError::Corrupt(e.to_string())))?;

        let mut legs = Vec::new();
        for entry in self.ledger.entries_for_parent(record.parent_ref)? {
            if entry.kind != EntryKind::Withdrawal {
                continue;
            }
            let leg = self
                .ledger
                .get_leg(entry.leg_id)?
                .ok_or_else(|| PoolError::not_found(format!("Leg {}", entry.leg_id)))?;
            legs.push(EnvelopeLeg {
                leg_id: leg.id,
                entry_id: entry.id,
                amount_cents: entry.magnitude(),
                credential: leg.sealed_credential,
            });
        }

        let envelope = self.sealer.seal(
            SealBatch {
                transaction_id: record.parent_ref,
                customer_id: record.customer_id,
                track: record.track,
                legs,
            },
            token,
        )?;
        Ok(envelope.to_bytes())
    }

    fn deposit_payload(&self, record: &DispatchRecord) -> Result<Vec<u8>, PoolError> {
        let phone = record
            .phone
            .clone()
            .ok_or_else(|| PoolError::validation("deposit batch has no phone number"))?;
        let legs = self
            .ledger
            .entries_for_parent(record.parent_ref)?
            .into_iter()
            .filter(|e| e.kind == EntryKind::Deposit)
            .map(|e| SequencedLeg {
                entry_id: e.id,
                leg_id: e.leg_id,
                amount_cents: e.magnitude(),
                idempotency_key: e.idempotency_key,
            })
            .collect();

        let message = DepositSequence {
            schema_version: DEPOSIT_SEQUENCE_VERSION,
            parent_ref: record.parent_ref,
            customer_id: record.customer_id,
            phone,
            legs,
        };
        Ok(serde_json::to_vec(&message).map_err(LedgerDbError::from)?)
    }
}
