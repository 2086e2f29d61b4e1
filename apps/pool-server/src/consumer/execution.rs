// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Execution Consumer
//!
//! Drains `withdrawal.secure` and performs each envelope leg through the
//! [`ExecutionEngine`].
//!
//! ## Per message
//!
//! 1. Verify the envelope signature before reading any field. A bad
//!    envelope is dead-lettered.
//! 2. For every leg: check it against its ledger entry, claim the entry
//!    (`pending → processing`), decrypt the credential and start the engine
//!    call on the worker pool.
//! 3. Ack once every leg has been started. Legs already claimed by an
//!    earlier delivery are skipped, so a redelivery never executes twice.
//!
//! Legs run independently: one failure never touches its siblings. Each
//! engine call carries a deadline; a timeout marks the leg `failed` and the
//! ledger refunds it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{ChannelError, Delivery, MessageChannel, WITHDRAWAL_SUBJECT};
use crate::crypto::{EnvelopeLeg, EnvelopeOpener};
use crate::models::{EntryKind, LedgerEntry};
use crate::providers::ExecutionEngine;
use crate::storage::{audit, AuditEvent, AuditEventType, LedgerDb};

/// Pause after a channel error before asking for the next delivery.
const CHANNEL_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ExecutionConsumer {
    channel: Arc<dyn MessageChannel>,
    ledger: Arc<LedgerDb>,
    opener: Arc<EnvelopeOpener>,
    engine: Arc<dyn ExecutionEngine>,
    workers: Arc<Semaphore>,
    timeout: Duration,
}

/// What happened to one delivery.
#[derive(Debug)]
pub enum HandleOutcome {
    /// Acked; one handle per leg started.
    Dispatched(Vec<JoinHandle<()>>),
    /// Failed verification and was dead-lettered.
    Rejected,
    /// A ledger error left legs unstarted; the message will be redelivered.
    Deferred,
}

impl ExecutionConsumer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        ledger: Arc<LedgerDb>,
        opener: Arc<EnvelopeOpener>,
        engine: Arc<dyn ExecutionEngine>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            ledger,
            opener,
            engine,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Run the consumer loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            workers = self.workers.available_permits(),
            timeout_secs = self.timeout.as_secs(),
            "Execution consumer starting"
        );

        loop {
            let next = tokio::select! {
                next = self.channel.next_delivery(WITHDRAWAL_SUBJECT) => next,
                _ = shutdown.cancelled() => {
                    info!("Execution consumer shutting down");
                    return;
                }
            };

            let result = match next {
                Ok(delivery) => self.handle(&delivery).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %e, "Execution consumer channel error, will retry");
                tokio::select! {
                    _ = tokio::time::sleep(CHANNEL_RETRY_DELAY) => {},
                    _ = shutdown.cancelled() => {
                        info!("Execution consumer shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process one delivery. Spawned leg tasks keep running after return.
    pub async fn handle(&self, delivery: &Delivery) -> Result<HandleOutcome, ChannelError> {
        let opened = match self.opener.open(&delivery.payload) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(
                    sequence = delivery.sequence,
                    error = %e,
                    "Rejecting withdrawal envelope"
                );
                audit::record(
                    &self.ledger,
                    AuditEvent::new(AuditEventType::EnvelopeRejected)
                        .with_resource("message", delivery.sequence)
                        .failed(e.to_string()),
                );
                self.channel.dead_letter(delivery, &e.to_string()).await?;
                return Ok(HandleOutcome::Rejected);
            }
        };

        let envelope = &opened.envelope;
        debug!(
            parent_ref = %envelope.transaction_id,
            legs = envelope.legs.len(),
            attempt = delivery.attempt,
            "Envelope verified"
        );

        let mut handles = Vec::with_capacity(envelope.legs.len());
        let mut deferred = false;
        for leg in &envelope.legs {
            let entry = match self.claim(envelope.transaction_id, leg) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        entry_id = %leg.entry_id,
                        error = %e,
                        "Could not claim withdrawal leg"
                    );
                    deferred = true;
                    continue;
                }
            };

            let credential = match self.opener.credential(leg) {
                Ok(credential) => credential,
                Err(e) => {
                    warn!(leg_id = %leg.leg_id, error = %e, "Leg credential unreadable");
                    finish(
                        &self.ledger,
                        &entry,
                        Err(format!("credential unreadable: {e}")),
                    );
                    continue;
                }
            };

            // Waiting here bounds concurrent engine calls across messages.
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                deferred = true;
                break;
            };
            let ledger = self.ledger.clone();
            let engine = self.engine.clone();
            let otp = opened.otp.clone();
            let timeout = self.timeout;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let deadline = Instant::now() + timeout;
                let outcome = match tokio::time::timeout_at(
                    deadline,
                    engine.execute(&credential, &otp, entry.magnitude(), deadline),
                )
                .await
                {
                    Ok(Ok(receipt)) => Ok(receipt),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("execution timed out".to_string()),
                };
                finish(&ledger, &entry, outcome);
            }));
        }

        if deferred {
            warn!(
                parent_ref = %envelope.transaction_id,
                "Envelope left unacked for redelivery"
            );
            return Ok(HandleOutcome::Deferred);
        }
        self.channel.ack(delivery).await?;
        Ok(HandleOutcome::Dispatched(handles))
    }

    /// Claim the entry behind `leg` if it matches the envelope.
    fn claim(
        &self,
        parent_ref: Uuid,
        leg: &EnvelopeLeg,
    ) -> Result<Option<LedgerEntry>, crate::storage::LedgerDbError> {
        let Some(entry) = self.ledger.get_entry(leg.entry_id)? else {
            warn!(entry_id = %leg.entry_id, "Envelope names an unknown entry");
            return Ok(None);
        };
        let matches = entry.kind == EntryKind::Withdrawal
            && entry.parent_ref == parent_ref
            && entry.leg_id == leg.leg_id
            && entry.magnitude() == leg.amount_cents;
        if !matches {
            warn!(
                entry_id = %entry.id,
                parent_ref = %parent_ref,
                "Envelope leg does not match its ledger entry"
            );
            return Ok(None);
        }

        let claimed = self.ledger.claim_entry(entry.id)?;
        if claimed.is_none() {
            debug!(entry_id = %entry.id, status = ?entry.status, "Leg already claimed");
        }
        Ok(claimed)
    }
}

/// Record a leg's outcome. Failures refund the leg inside the ledger.
fn finish(ledger: &LedgerDb, entry: &LedgerEntry, outcome: Result<String, String>) {
    let mut metadata = Map::new();
    let success = match &outcome {
        Ok(receipt) => {
            metadata.insert("receipt".to_string(), Value::String(receipt.clone()));
            true
        }
        Err(message) => {
            metadata.insert("error".to_string(), Value::String(message.clone()));
            false
        }
    };

    match ledger.complete_entry(entry.id, success, metadata) {
        Ok(Some(completion)) => {
            let event = AuditEvent::new(if success {
                AuditEventType::LegExecuted
            } else {
                AuditEventType::LegFailed
            })
            .with_customer(entry.customer_id)
            .with_resource("entry", entry.id);
            match &outcome {
                Ok(_) => info!(
                    entry_id = %entry.id,
                    parent_ref = %entry.parent_ref,
                    amount_cents = entry.magnitude(),
                    "Withdrawal leg executed"
                ),
                Err(message) => warn!(
                    entry_id = %entry.id,
                    parent_ref = %entry.parent_ref,
                    error = %message,
                    refunded = completion.refund.is_some(),
                    "Withdrawal leg failed"
                ),
            }
            let event = match outcome {
                Ok(_) => event,
                Err(message) => event.failed(message),
            };
            audit::record(ledger, event);
        }
        Ok(None) => debug!(entry_id = %entry.id, "Leg already final"),
        Err(e) => error!(entry_id = %entry.id, error = %e, "Could not record leg outcome"),
    }
}
