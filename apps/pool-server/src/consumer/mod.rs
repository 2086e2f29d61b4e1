// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Broker Consumers
//!
//! Long-running tasks on the far side of the broker:
//!
//! - [`ExecutionConsumer`]: verifies withdrawal envelopes and runs each leg
//!   through the execution engine on a bounded worker pool.
//! - [`DepositSequencer`]: pushes real-track deposit legs to the payment rail
//!   one at a time.

pub mod deposit_sequence;
pub mod execution;

pub use deposit_sequence::{DepositSequencer, SequenceReport};
pub use execution::{ExecutionConsumer, HandleOutcome};
