// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use crate::broker::ChannelError;
use crate::crypto::CryptoError;
use crate::storage::LedgerDbError;

/// Service-level error returned by the coordinators.
///
/// `Unauthorized` carries no detail: a bad code, an expired code and a bad
/// signature all look the same to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ledger write failed: {0}")]
    Persistence(LedgerDbError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] ChannelError),

    /// A server-side invariant did not hold. Never the caller's fault.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

impl PoolError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Stable snake_case code for logs and API mapping.
    pub fn error_code(&self) -> &'static str {
        match self {
            PoolError::Validation(_) => "validation_error",
            PoolError::Unauthorized => "unauthorized",
            PoolError::InsufficientFunds { .. } => "insufficient_funds",
            PoolError::NotFound(_) => "not_found",
            PoolError::Persistence(_) => "persistence_error",
            PoolError::Dispatch(_) => "dispatch_error",
            PoolError::Internal(_) => "internal_error",
            PoolError::Crypto(_) => "crypto_error",
        }
    }

    /// Whether the caller caused the error (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PoolError::Validation(_)
                | PoolError::Unauthorized
                | PoolError::InsufficientFunds { .. }
                | PoolError::NotFound(_)
        )
    }
}

impl From<LedgerDbError> for PoolError {
    fn from(err: LedgerDbError) -> Self {
        match err {
            LedgerDbError::InsufficientFunds {
                available,
                requested,
                ..
            } => PoolError::InsufficientFunds {
                available,
                requested,
            },
            LedgerDbError::NotFound(what) => PoolError::NotFound(what),
            LedgerDbError::EmptyBatch => PoolError::validation("nothing to allocate"),
            LedgerDbError::LegUnavailable(leg_id) => {
                PoolError::Validation(format!("leg {leg_id} is not available"))
            }
            other => PoolError::Persistence(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn unauthorized_renders_without_detail() {
        let err = PoolError::Unauthorized;
        assert_eq!(err.to_string(), "unauthorized");
        assert_eq!(err.error_code(), "unauthorized");
        assert!(err.is_client_error());
    }

    #[test]
    fn ledger_errors_map_to_taxonomy() {
        let err: PoolError = LedgerDbError::InsufficientFunds {
            leg_id: Uuid::new_v4(),
            available: 100,
            requested: 200,
        }
        .into();
        assert!(matches!(
            err,
            PoolError::InsufficientFunds {
                available: 100,
                requested: 200
            }
        ));

        let err: PoolError = LedgerDbError::EmptyBatch.into();
        assert_eq!(err.error_code(), "validation_error");

        let err: PoolError = LedgerDbError::Corrupt("x".into()).into();
        assert_eq!(err.error_code(), "persistence_error");
        assert!(!err.is_client_error());
    }

    #[test]
    fn channel_errors_are_server_faults() {
        let err: PoolError = ChannelError::Unavailable("down".into()).into();
        assert_eq!(err.error_code(), "dispatch_error");
        assert!(!err.is_client_error());
    }

    #[test]
    fn internal_errors_are_server_faults() {
        let err = PoolError::Internal("allocation left 3 undistributed".into());
        assert_eq!(err.error_code(), "internal_error");
        assert_eq!(err.to_string(), "internal error: allocation left 3 undistributed");
        assert!(!err.is_client_error());
    }
}
