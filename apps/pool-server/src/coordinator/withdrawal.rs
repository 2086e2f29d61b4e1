// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Smart Withdrawal
//!
//! Every check below runs before any ledger mutation and fails the whole
//! request:
//!
//! 1. Positive amount.
//! 2. One-time code (consumed on success).
//! 3. HMAC over `customer_id:otp:amount`, binding the signature to this code
//!    and amount.
//! 4. At least one active leg.
//! 5. Pot on the requested track covers the amount.
//!
//! The amount is then split in proportion to leg balances and committed in
//! one ledger transaction (debits, `pending` entries, dispatch record) while
//! the customer lock is held. Publishing happens after the commit; a publish
//! failure is logged and left to the reconciler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::{info, warn};
use uuid::Uuid;

use super::dispatch::{DispatchOutcome, Dispatcher};
use super::locks::CustomerLocks;
use crate::allocation::{allocate_proportional, ProportionalLeg};
use crate::auth::{withdrawal_payload, AuthFailure, KeyStore, OtpService};
use crate::error::PoolError;
use crate::models::Track;
use crate::storage::{audit, AuditEvent, AuditEventType, BatchMode, LedgerDb, LegAmount};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub customer_id: Uuid,
    pub amount_cents: i64,
    pub track: Track,
    pub otp: String,
    /// base64 HMAC-SHA256 over `customer_id:otp:amount_cents`.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub parent_ref: Uuid,
    pub legs: Vec<LegAmount>,
    /// `false` when the publish failed and the batch awaits reconciliation.
    pub dispatched: bool,
}

impl WithdrawalReceipt {
    pub fn total(&self) -> i64 {
        self.legs.iter().map(|l| l.amount).sum()
    }
}

pub struct WithdrawalCoordinator {
    ledger: Arc<LedgerDb>,
    otp: Arc<OtpService>,
    keys: Arc<KeyStore>,
    locks: Arc<CustomerLocks>,
    dispatcher: Arc<Dispatcher>,
}

impl WithdrawalCoordinator {
    pub fn new(
        ledger: Arc<LedgerDb>,
        otp: Arc<OtpService>,
        keys: Arc<KeyStore>,
        locks: Arc<CustomerLocks>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            ledger,
            otp,
            keys,
            locks,
            dispatcher,
        }
    }

    pub async fn request_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, PoolError> {
        let customer_id = request.customer_id;
        if request.amount_cents <= 0 {
            return Err(PoolError::validation("amount must be positive"));
        }

        if let Err(failure) = self.otp.check(customer_id, &request.otp).await {
            return Err(self.reject(customer_id, failure));
        }

        let payload = withdrawal_payload(customer_id, &request.otp, request.amount_cents);
        if let Err(failure) = self.keys.check(customer_id, &payload, &request.signature) {
            audit::record(
                &self.ledger,
                AuditEvent::new(AuditEventType::SignatureRejected)
                    .with_customer(customer_id)
                    .failed(failure.reason()),
            );
            return Err(self.reject(customer_id, failure));
        }

        let parent_ref = Uuid::new_v4();
        let legs = {
            let _guard = self.locks.acquire(customer_id).await;
            self.commit(parent_ref, &request)?
        };

        let dispatched = match self.dispatcher.dispatch(parent_ref).await {
            Ok(DispatchOutcome::Published { .. }) | Ok(DispatchOutcome::AlreadyHandled) => true,
            // Already logged and recorded by the dispatcher.
            Err(_) => false,
        };

        Ok(WithdrawalReceipt {
            parent_ref,
            legs,
            dispatched,
        })
    }

    fn commit(
        &self,
        parent_ref: Uuid,
        request: &WithdrawalRequest,
    ) -> Result<Vec<LegAmount>, PoolError> {
        let customer_id = request.customer_id;
        let track = request.track;

        let legs = self.ledger.active_legs(customer_id)?;
        if legs.is_empty() {
            return Err(PoolError::validation("customer has no active legs"));
        }

        let total_pot: i64 = legs.iter().map(|l| l.balance(track)).sum();
        if total_pot < request.amount_cents {
            info!(
                customer_id = %customer_id,
                total_pot,
                requested = request.amount_cents,
                "Withdrawal exceeds pool balance"
            );
            return Err(PoolError::InsufficientFunds {
                available: total_pot,
                requested: request.amount_cents,
            });
        }

        let weights: Vec<ProportionalLeg> = legs
            .iter()
            .map(|l| ProportionalLeg {
                leg_id: l.id,
                weight: l.balance(track),
                max_amount: l.balance(track),
            })
            .collect();
        let plan = allocate_proportional(request.amount_cents, &weights, 0);
        if plan.allocated() != request.amount_cents {
            return Err(PoolError::Internal(format!(
                "allocation left {} undistributed",
                plan.undistributed()
            )));
        }

        let amounts: Vec<LegAmount> = plan
            .funded()
            .map(|p| LegAmount {
                leg_id: p.leg_id,
                amount: p.amount,
            })
            .collect();

        self.ledger.commit_batch(
            customer_id,
            track,
            parent_ref,
            &amounts,
            BatchMode::Withdrawal,
            &Map::new(),
        )?;

        info!(
            customer_id = %customer_id,
            parent_ref = %parent_ref,
            amount_cents = request.amount_cents,
            legs = amounts.len(),
            track = ?track,
            "Withdrawal committed"
        );
        audit::record(
            &self.ledger,
            AuditEvent::new(AuditEventType::WithdrawalCommitted)
                .with_customer(customer_id)
                .with_resource("batch", parent_ref)
                .with_details(serde_json::json!({
                    "amount_cents": request.amount_cents,
                    "legs": amounts.len(),
                    "track": track,
                })),
        );
        Ok(amounts)
    }

    fn reject(&self, customer_id: Uuid, failure: AuthFailure) -> PoolError {
        warn!(
            customer_id = %customer_id,
            reason = failure.reason(),
            "Withdrawal authentication failed"
        );
        PoolError::Unauthorized
    }
}
