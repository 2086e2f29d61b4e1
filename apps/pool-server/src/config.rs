// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the service. Configuration is loaded from the environment
//! once at startup into a [`PoolConfig`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `ledger.redb` and `broker.redb` | `/data` |
//! | `COORDINATOR_SIGNING_KEY_PATH` | Ed25519 PKCS#8 PEM used to sign envelopes | Ephemeral key if unset |
//! | `COORDINATOR_PUBLIC_KEY_PATH` | Ed25519 SPKI PEM the consumer verifies with | Derived from the signing key |
//! | `ENGINE_SHARED_SECRET` | Base64 AES-256 key shared with the execution engine | Required |
//! | `CUSTOMER_KEYS_PATH` | JSON map of customer id to base64 HMAC secret | Empty key store |
//! | `ALLOCATION_RESERVE_PCT` | Share of a deposit held back, `[0, 1]` | `0` |
//! | `ALLOCATION_BETA` | Return-chasing versus risk-parity blend, `[0, 1]` | `0.5` |
//! | `ALLOCATION_MIN_SEND` | Smallest transfer in cents | `0` |
//! | `OTP_TTL_SECS` | One-time code lifetime | `300` |
//! | `EXECUTION_WORKERS` | Concurrent execution engine calls | `8` |
//! | `EXECUTION_TIMEOUT_SECS` | Deadline for one engine call | `30` |
//! | `EXECUTION_STALL_TIMEOUT_SECS` | Claim age after which a withdrawal leg is failed and refunded | `300` |
//! | `BROKER_DEDUP_WINDOW_SECS` | Publish dedup window | `120` |
//! | `BROKER_ACK_WAIT_SECS` | Redelivery deadline for unacked messages | `30` |
//! | `BROKER_MAX_DELIVER` | Deliveries before dead-lettering | `5` |
//! | `BROKER_RETENTION_SECS` | How long acked messages are kept | `604800` |
//! | `RECONCILE_INTERVAL_SECS` | Dispatch reconciler sweep interval | `30` |
//! | `DISPATCH_MAX_ATTEMPTS` | Publish attempts before a batch is abandoned | `5` |
//! | `DEPOSIT_PUSH_INTERVAL_MS` | Pause between payment rail pushes | `2000` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::allocation::AllocationParams;
use crate::broker::BrokerConfig;

/// Environment variable name for the data directory path.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "/data";

pub const SIGNING_KEY_PATH_ENV: &str = "COORDINATOR_SIGNING_KEY_PATH";
pub const PUBLIC_KEY_PATH_ENV: &str = "COORDINATOR_PUBLIC_KEY_PATH";

/// Base64-encoded 32-byte AES-256-GCM key shared with the execution engine.
///
/// Seals the OTP inside each envelope and every leg credential at rest.
pub const ENGINE_SECRET_ENV: &str = "ENGINE_SHARED_SECRET";

/// Path to the customer HMAC key file.
///
/// # Format
/// `{"<customer uuid>": "<base64 secret>", ...}`
pub const CUSTOMER_KEYS_PATH_ENV: &str = "CUSTOMER_KEYS_PATH";

pub const RESERVE_PCT_ENV: &str = "ALLOCATION_RESERVE_PCT";
pub const BETA_ENV: &str = "ALLOCATION_BETA";
pub const MIN_SEND_ENV: &str = "ALLOCATION_MIN_SEND";
pub const OTP_TTL_ENV: &str = "OTP_TTL_SECS";
pub const EXECUTION_WORKERS_ENV: &str = "EXECUTION_WORKERS";
pub const EXECUTION_TIMEOUT_ENV: &str = "EXECUTION_TIMEOUT_SECS";
pub const STALL_TIMEOUT_ENV: &str = "EXECUTION_STALL_TIMEOUT_SECS";
pub const DEDUP_WINDOW_ENV: &str = "BROKER_DEDUP_WINDOW_SECS";
pub const ACK_WAIT_ENV: &str = "BROKER_ACK_WAIT_SECS";
pub const MAX_DELIVER_ENV: &str = "BROKER_MAX_DELIVER";
pub const RETENTION_ENV: &str = "BROKER_RETENTION_SECS";
pub const RECONCILE_INTERVAL_ENV: &str = "RECONCILE_INTERVAL_SECS";
pub const DISPATCH_MAX_ATTEMPTS_ENV: &str = "DISPATCH_MAX_ATTEMPTS";
pub const DEPOSIT_PUSH_INTERVAL_ENV: &str = "DEPOSIT_PUSH_INTERVAL_MS";

/// Logging format: `json` for production, anything else for pretty output.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the service reads from its environment.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub data_dir: PathBuf,
    pub signing_key_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    /// Base64 engine key. Startup fails without it.
    pub engine_secret: Option<String>,
    pub customer_keys_path: Option<PathBuf>,
    pub allocation: AllocationParams,
    pub otp_ttl: Duration,
    pub execution_workers: usize,
    pub execution_timeout: Duration,
    /// Must exceed `execution_timeout`.
    pub stall_timeout: Duration,
    pub broker: BrokerConfig,
    pub reconcile_interval: Duration,
    pub dispatch_max_attempts: u32,
    pub deposit_push_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            signing_key_path: None,
            public_key_path: None,
            engine_secret: None,
            customer_keys_path: None,
            allocation: AllocationParams::default(),
            otp_ttl: Duration::from_secs(300),
            execution_workers: 8,
            execution_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(300),
            broker: BrokerConfig::default(),
            reconcile_interval: Duration::from_secs(30),
            dispatch_max_attempts: 5,
            deposit_push_interval: Duration::from_millis(2000),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let allocation = AllocationParams {
            reserve_pct: unit_interval(
                RESERVE_PCT_ENV,
                parse(&get, RESERVE_PCT_ENV, defaults.allocation.reserve_pct)?,
            )?,
            beta: unit_interval(BETA_ENV, parse(&get, BETA_ENV, defaults.allocation.beta)?)?,
            min_send: parse(&get, MIN_SEND_ENV, defaults.allocation.min_send)?,
        };
        if allocation.min_send < 0 {
            return Err(invalid(
                MIN_SEND_ENV,
                allocation.min_send.to_string(),
                "must not be negative",
            ));
        }

        let broker = BrokerConfig {
            dedup_window: secs(&get, DEDUP_WINDOW_ENV, defaults.broker.dedup_window)?,
            ack_wait: secs(&get, ACK_WAIT_ENV, defaults.broker.ack_wait)?,
            max_deliver: parse(&get, MAX_DELIVER_ENV, defaults.broker.max_deliver)?,
            retention: secs(&get, RETENTION_ENV, defaults.broker.retention)?,
        };

        let execution_timeout = secs(&get, EXECUTION_TIMEOUT_ENV, defaults.execution_timeout)?;
        let stall_timeout = secs(&get, STALL_TIMEOUT_ENV, defaults.stall_timeout)?;
        if stall_timeout <= execution_timeout {
            return Err(invalid(
                STALL_TIMEOUT_ENV,
                stall_timeout.as_secs().to_string(),
                "must exceed the execution timeout",
            ));
        }

        Ok(Self {
            data_dir: get(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            signing_key_path: get(SIGNING_KEY_PATH_ENV).map(PathBuf::from),
            public_key_path: get(PUBLIC_KEY_PATH_ENV).map(PathBuf::from),
            engine_secret: get(ENGINE_SECRET_ENV),
            customer_keys_path: get(CUSTOMER_KEYS_PATH_ENV).map(PathBuf::from),
            allocation,
            otp_ttl: secs(&get, OTP_TTL_ENV, defaults.otp_ttl)?,
            execution_workers: parse(&get, EXECUTION_WORKERS_ENV, defaults.execution_workers)?,
            execution_timeout,
            stall_timeout,
            broker,
            reconcile_interval: secs(&get, RECONCILE_INTERVAL_ENV, defaults.reconcile_interval)?,
            dispatch_max_attempts: parse(
                &get,
                DISPATCH_MAX_ATTEMPTS_ENV,
                defaults.dispatch_max_attempts,
            )?,
            deposit_push_interval: get(DEPOSIT_PUSH_INTERVAL_ENV)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| invalid(DEPOSIT_PUSH_INTERVAL_ENV, v.clone(), e))
                })
                .transpose()?
                .unwrap_or(defaults.deposit_push_interval),
        })
    }
}

fn invalid(name: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        value,
        reason: reason.to_string(),
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match get(name) {
        Some(value) => value.trim().parse().map_err(|e| invalid(name, value, e)),
        None => Ok(default),
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse(get, name, default.as_secs()).map(Duration::from_secs)
}

fn unit_interval(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(invalid(name, value.to_string(), "must be between 0 and 1"))
    }
}
