// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Request Coordinators
//!
//! Synchronous request side of the pipeline: authenticate, allocate, commit
//! to the ledger, then hand the committed batch to the [`Dispatcher`].
//!
//! - [`WithdrawalCoordinator`]: OTP + HMAC authenticated, balance-proportional
//!   withdrawals published as signed envelopes.
//! - [`DepositCoordinator`]: performance/risk scored deposits, credited at
//!   once or sequenced through the payment rail.
//! - [`LegRegistry`]: leg provisioning with sealed venue credentials.
//! - [`CustomerLocks`]: per-customer mutual exclusion around the pot read and
//!   the commit.

pub mod deposit;
pub mod dispatch;
pub mod legs;
pub mod locks;
pub mod withdrawal;

#[cfg(test)]
pub(crate) mod testing;

pub use deposit::{DepositCoordinator, DepositReceipt, DepositRequest, DepositStatus};
pub use dispatch::{
    DepositSequence, DispatchOutcome, Dispatcher, SequencedLeg, DEPOSIT_SEQUENCE_VERSION,
};
pub use legs::LegRegistry;
pub use locks::CustomerLocks;
pub use withdrawal::{WithdrawalCoordinator, WithdrawalReceipt, WithdrawalRequest};
