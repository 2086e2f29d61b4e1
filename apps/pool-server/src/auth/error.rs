// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication failure reasons.
//!
//! Every variant surfaces to the caller as the same `unauthorized` error;
//! the concrete reason only reaches logs and the audit trail.

/// Why a withdrawal request failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No OTP outstanding for the customer
    OtpMissing,
    /// OTP outlived its TTL
    OtpExpired,
    /// OTP present but different
    OtpMismatch,
    /// No HMAC secret provisioned for the customer
    UnknownCustomerKey,
    /// Signature is not valid base64
    MalformedSignature,
    /// HMAC mismatch
    BadSignature,
}

impl AuthFailure {
    /// Stable reason code for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::OtpMissing => "otp_missing",
            AuthFailure::OtpExpired => "otp_expired",
            AuthFailure::OtpMismatch => "otp_mismatch",
            AuthFailure::UnknownCustomerKey => "unknown_customer_key",
            AuthFailure::MalformedSignature => "malformed_signature",
            AuthFailure::BadSignature => "bad_signature",
        }
    }

    pub fn is_otp_failure(&self) -> bool {
        matches!(
            self,
            AuthFailure::OtpMissing | AuthFailure::OtpExpired | AuthFailure::OtpMismatch
        )
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}
