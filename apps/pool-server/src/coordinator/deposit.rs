// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Smart Deposit
//!
//! Deposits are scored by recent performance and risk (see
//! [`allocate`](crate::allocation::allocate)) and then either:
//!
//! - **credited at once** on the sandbox track or for a dry run, or
//! - **sequenced** on the real track: `pending` entries plus a
//!   `deposit.sequence` message. The leg is credited only when the payment
//!   rail reports success through [`DepositCoordinator::on_rail_result`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::dispatch::Dispatcher;
use super::locks::CustomerLocks;
use crate::allocation::{allocate, AllocationParams, AllocationPlan};
use crate::error::PoolError;
use crate::models::{LedgerEntry, Track};
use crate::providers::RailResult;
use crate::storage::{audit, AuditEvent, AuditEventType, BatchMode, LedgerDb, LegAmount};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub customer_id: Uuid,
    /// Phone the payment rail pushes from. Required for real deposits.
    pub phone: Option<String>,
    pub amount_cents: i64,
    pub track: Track,
    /// Credit immediately without touching the payment rail.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Balances already updated.
    Credited,
    /// Waiting for payment-rail results.
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub parent_ref: Uuid,
    pub status: DepositStatus,
    pub plan: AllocationPlan,
    /// Whether the sequencing message was published. Always `true` for
    /// credited deposits.
    pub dispatched: bool,
}

pub struct DepositCoordinator {
    ledger: Arc<LedgerDb>,
    locks: Arc<CustomerLocks>,
    dispatcher: Arc<Dispatcher>,
    params: AllocationParams,
}

impl DepositCoordinator {
    pub fn new(
        ledger: Arc<LedgerDb>,
        locks: Arc<CustomerLocks>,
        dispatcher: Arc<Dispatcher>,
        params: AllocationParams,
    ) -> Self {
        Self {
            ledger,
            locks,
            dispatcher,
            params,
        }
    }

    pub async fn smart_deposit(&self, request: DepositRequest) -> Result<DepositReceipt, PoolError> {
        let customer_id = request.customer_id;
        if request.amount_cents <= 0 {
            return Err(PoolError::validation("amount must be positive"));
        }
        let instant = !request.track.is_real() || request.dry_run;
        let phone = match (&request.phone, instant) {
            (Some(phone), _) if !phone.trim().is_empty() => Some(phone.trim().to_string()),
            (_, true) => None,
            (_, false) => return Err(PoolError::validation("phone number is required")),
        };

        let parent_ref = Uuid::new_v4();
        let (plan, mode) = {
            let _guard = self.locks.acquire(customer_id).await;

            let legs = self.ledger.active_legs(customer_id)?;
            if legs.is_empty() {
                return Err(PoolError::validation("customer has no active legs"));
            }
            let plan = allocate(request.amount_cents, &legs, &self.params);
            let amounts: Vec<LegAmount> = plan
                .funded()
                .map(|p| LegAmount {
                    leg_id: p.leg_id,
                    amount: p.amount,
                })
                .collect();
            if amounts.is_empty() {
                return Err(PoolError::validation(
                    "amount too small to fund any leg",
                ));
            }

            let mode = match phone {
                Some(phone) if !instant => BatchMode::DepositPending { phone },
                _ => BatchMode::DepositCredited,
            };
            let mut metadata = Map::new();
            if request.dry_run {
                metadata.insert("dry_run".to_string(), Value::Bool(true));
            }
            self.ledger.commit_batch(
                customer_id,
                request.track,
                parent_ref,
                &amounts,
                mode.clone(),
                &metadata,
            )?;
            (plan, mode)
        };

        let status = match mode {
            BatchMode::DepositPending { .. } => DepositStatus::Pending,
            _ => DepositStatus::Credited,
        };
        info!(
            customer_id = %customer_id,
            parent_ref = %parent_ref,
            amount_cents = request.amount_cents,
            allocated = plan.allocated(),
            undistributed = plan.undistributed(),
            status = ?status,
            "Deposit committed"
        );
        audit::record(
            &self.ledger,
            AuditEvent::new(AuditEventType::DepositCommitted)
                .with_customer(customer_id)
                .with_resource("batch", parent_ref)
                .with_details(serde_json::json!({
                    "amount_cents": request.amount_cents,
                    "allocated": plan.allocated(),
                    "track": request.track,
                    "dry_run": request.dry_run,
                })),
        );

        let dispatched = match status {
            DepositStatus::Credited => true,
            DepositStatus::Pending => self.dispatcher.dispatch(parent_ref).await.is_ok(),
        };

        Ok(DepositReceipt {
            parent_ref,
            status,
            plan,
            dispatched,
        })
    }

    /// Apply a payment-rail callback to its deposit entry.
    ///
    /// Looks the entry up by tracking id, falling back to the idempotency
    /// key when the callback beats the tracking id being stored. Returns
    /// `None` when the entry was already final.
    pub fn on_rail_result(&self, result: &RailResult) -> Result<Option<LedgerEntry>, PoolError> {
        let entry = match self.ledger.entry_by_tracking(&result.tracking_id)? {
            Some(entry) => Some(entry),
            None => match &result.idempotency_key {
                Some(key) => self.ledger.entry_by_idempotency_key(key)?,
                None => None,
            },
        };
        let Some(entry) = entry else {
            warn!(tracking_id = %result.tracking_id, "Rail result for unknown deposit");
            return Err(PoolError::not_found(format!(
                "deposit for tracking id {}",
                result.tracking_id
            )));
        };

        let mut metadata = result.metadata.clone();
        metadata.insert(
            "result_code".to_string(),
            Value::String(result.result_code.clone()),
        );
        metadata.insert(
            "tracking_id".to_string(),
            Value::String(result.tracking_id.clone()),
        );

        let success = result.is_success();
        let settled = self.ledger.settle_deposit(entry.id, success, metadata)?;
        match &settled {
            Some(entry) => {
                info!(
                    entry_id = %entry.id,
                    parent_ref = %entry.parent_ref,
                    success,
                    result_code = %result.result_code,
                    "Deposit settled"
                );
                let event = AuditEvent::new(AuditEventType::DepositSettled)
                    .with_customer(entry.customer_id)
                    .with_resource("entry", entry.id);
                let event = if success {
                    event
                } else {
                    event.failed(format!("result_code {}", result.result_code))
                };
                audit::record(&self.ledger, event);
            }
            None => info!(
                entry_id = %entry.id,
                tracking_id = %result.tracking_id,
                "Repeated rail result ignored"
            ),
        }
        Ok(settled)
    }
}
