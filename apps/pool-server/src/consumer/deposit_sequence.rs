// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Deposit Sequencer
//!
//! Drains `deposit.sequence` and pushes each leg of a real deposit through
//! the [`PaymentRail`], one at a time with a fixed pause between pushes.
//!
//! A push only starts the payment. The leg is credited later, when the rail
//! reports the result and [`DepositCoordinator::on_rail_result`] settles it.
//! A push the rail refuses outright fails the leg immediately.
//!
//! [`DepositCoordinator::on_rail_result`]: crate::coordinator::DepositCoordinator::on_rail_result

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{ChannelError, Delivery, MessageChannel, DEPOSIT_SUBJECT};
use crate::coordinator::{DepositSequence, SequencedLeg};
use crate::providers::PaymentRail;
use crate::storage::{LedgerDb, LedgerDbError};

const CHANNEL_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct DepositSequencer {
    channel: Arc<dyn MessageChannel>,
    ledger: Arc<LedgerDb>,
    rail: Arc<dyn PaymentRail>,
    push_interval: Duration,
}

/// Per-message counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequenceReport {
    pub pushed: usize,
    pub refused: usize,
    pub skipped: usize,
}

impl DepositSequencer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        ledger: Arc<LedgerDb>,
        rail: Arc<dyn PaymentRail>,
        push_interval: Duration,
    ) -> Self {
        Self {
            channel,
            ledger,
            rail,
            push_interval,
        }
    }

    /// Run the sequencer loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            push_interval_ms = self.push_interval.as_millis() as u64,
            "Deposit sequencer starting"
        );

        loop {
            let next = tokio::select! {
                next = self.channel.next_delivery(DEPOSIT_SUBJECT) => next,
                _ = shutdown.cancelled() => {
                    info!("Deposit sequencer shutting down");
                    return;
                }
            };

            let result = match next {
                Ok(delivery) => self.handle(&delivery).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %e, "Deposit sequencer channel error, will retry");
                tokio::select! {
                    _ = tokio::time::sleep(CHANNEL_RETRY_DELAY) => {},
                    _ = shutdown.cancelled() => {
                        info!("Deposit sequencer shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Push every leg of one deposit sequence, then ack it.
    ///
    /// Legs whose entries were already claimed are skipped. A ledger error
    /// leaves the message unacked for redelivery and returns `Ok(None)`.
    pub async fn handle(
        &self,
        delivery: &Delivery,
    ) -> Result<Option<SequenceReport>, ChannelError> {
        let sequence = match DepositSequence::from_bytes(&delivery.payload) {
            Ok(sequence) => sequence,
            Err(reason) => {
                warn!(sequence = delivery.sequence, %reason, "Undecodable deposit sequence");
                self.channel.dead_letter(delivery, &reason).await?;
                return Ok(None);
            }
        };

        let mut report = SequenceReport::default();
        for (i, leg) in sequence.legs.iter().enumerate() {
            if i > 0 && !self.push_interval.is_zero() {
                tokio::time::sleep(self.push_interval).await;
            }
            match self.push_leg(&sequence.phone, leg).await {
                Ok(Some(true)) => report.pushed += 1,
                Ok(Some(false)) => report.refused += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(
                        parent_ref = %sequence.parent_ref,
                        entry_id = %leg.entry_id,
                        error = %e,
                        "Deposit leg bookkeeping failed, leaving message for redelivery"
                    );
                    return Ok(None);
                }
            }
        }

        info!(
            parent_ref = %sequence.parent_ref,
            pushed = report.pushed,
            refused = report.refused,
            skipped = report.skipped,
            "Deposit sequence pushed"
        );
        self.channel.ack(delivery).await?;
        Ok(Some(report))
    }

    /// `Some(true)` pushed, `Some(false)` refused by the rail, `None` skipped.
    async fn push_leg(
        &self,
        phone: &str,
        leg: &SequencedLeg,
    ) -> Result<Option<bool>, LedgerDbError> {
        if self.ledger.claim_entry(leg.entry_id)?.is_none() {
            debug!(entry_id = %leg.entry_id, "Deposit leg already claimed");
            return Ok(None);
        }

        match self
            .rail
            .push(phone, leg.amount_cents, &leg.idempotency_key)
            .await
        {
            Ok(tracking_id) => {
                debug!(entry_id = %leg.entry_id, %tracking_id, "Deposit leg pushed");
                self.ledger.attach_tracking(leg.entry_id, &tracking_id)?;
                Ok(Some(true))
            }
            Err(e) => {
                warn!(entry_id = %leg.entry_id, error = %e, "Payment rail refused push");
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), Value::String(e.to_string()));
                self.ledger.settle_deposit(leg.entry_id, false, metadata)?;
                Ok(Some(false))
            }
        }
    }
}
