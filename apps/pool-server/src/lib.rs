// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Pool Server - Smart Deposit / Smart Withdrawal Pipeline
//!
//! Splits a customer's deposits and withdrawals across their pool of legs
//! (betting venues, brokers, exchanges) and dispatches the resulting
//! transfers over a durable message channel.
//!
//! ## Flow
//!
//! 1. A coordinator authenticates the request (withdrawals: OTP + HMAC),
//!    allocates the amount and commits every leg entry in one ledger
//!    transaction.
//! 2. The [`coordinator::Dispatcher`] publishes the batch: a signed,
//!    partially encrypted envelope for withdrawals, a deposit sequence for
//!    real deposits.
//! 3. Consumers execute the legs. The [`reconciler`] republishes batches
//!    whose publish failed and eventually abandons and refunds them.
//!
//! ## Modules
//!
//! - `allocation` - Deposit scoring and proportional withdrawal splits
//! - `auth` - OTP and HMAC request authentication
//! - `broker` - Message channel trait and the redb-backed broker
//! - `consumer` - Execution consumer and deposit sequencer
//! - `coordinator` - Request coordinators and outbound dispatch
//! - `crypto` - Envelope signing and sealing
//! - `providers` - Execution engine and payment rail interfaces
//! - `storage` - Ledger database, audit log, OTP cache

pub mod allocation;
pub mod auth;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod models;
pub mod providers;
pub mod reconciler;
pub mod state;
pub mod storage;
