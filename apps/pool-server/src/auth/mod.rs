// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Request Authentication
//!
//! A withdrawal request is authorized by two factors checked in order:
//!
//! 1. A one-time code previously sent to the customer out of band
//!    ([`OtpService`]).
//! 2. An HMAC signature over `customer_id:otp:amount` made with the
//!    customer's provisioned secret ([`KeyStore`]).
//!
//! ## Security
//!
//! - Codes are single use and expire after their TTL.
//! - HMAC tags are compared in constant time.
//! - Every failure reaches callers as the same `unauthorized` error. The
//!   concrete [`AuthFailure`] is only logged and audited.

pub mod error;
pub mod keystore;
pub mod otp;

pub use error::AuthFailure;
pub use keystore::{compute_signature, withdrawal_payload, KeyStore, KeyStoreError};
pub use otp::{ChannelOtpSender, OtpCheck, OtpSender, OtpService, OtpStore, DEFAULT_OTP_TTL};
