// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared service state: storage, broker, key material and the coordinators
//! built on them. The binary builds one [`PoolState`] at startup; tests build
//! one with [`PoolKeys::ephemeral`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{ChannelOtpSender, KeyStore, KeyStoreError, OtpService};
use crate::broker::{ChannelError, DurableBroker, MessageChannel};
use crate::config::{ConfigError, PoolConfig, ENGINE_SECRET_ENV};
use crate::consumer::{DepositSequencer, ExecutionConsumer};
use crate::coordinator::{
    CustomerLocks, DepositCoordinator, Dispatcher, LegRegistry, WithdrawalCoordinator,
};
use crate::crypto::{
    CryptoError, EnvelopeOpener, EnvelopeSealer, EnvelopeSigner, EnvelopeVerifier, SecretBox,
};
use crate::providers::{ExecutionEngine, PaymentRail};
use crate::reconciler::DispatchReconciler;
use crate::storage::{
    InMemoryOtpStore, LedgerDb, LedgerDbError, BROKER_DB_FILE, LEDGER_DB_FILE,
};

/// Upper bound on outstanding one-time codes held in memory.
const OTP_CACHE_CAPACITY: usize = 100_000;

/// Conditions that stop the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("ENGINE_SHARED_SECRET is not set")]
    MissingEngineSecret,

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid key material in {what}: {source}")]
    Key {
        what: &'static str,
        source: CryptoError,
    },

    #[error("public key does not match the signing key")]
    KeyMismatch,

    #[error("customer keys: {0}")]
    CustomerKeys(#[from] KeyStoreError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerDbError),

    #[error("broker: {0}")]
    Broker(#[from] ChannelError),
}

fn read(path: &Path) -> Result<Vec<u8>, StartupError> {
    std::fs::read(path).map_err(|source| StartupError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Signing, verification and encryption keys plus customer HMAC secrets.
pub struct PoolKeys {
    pub signer: EnvelopeSigner,
    pub verifier: EnvelopeVerifier,
    pub engine_box: SecretBox,
    pub customer_keys: KeyStore,
}

impl PoolKeys {
    pub fn load(config: &PoolConfig) -> Result<Self, StartupError> {
        let signer = match &config.signing_key_path {
            Some(path) => EnvelopeSigner::from_pem(&read(path)?).map_err(|source| {
                StartupError::Key {
                    what: "signing key",
                    source,
                }
            })?,
            None => {
                warn!("No signing key configured, using an ephemeral key");
                EnvelopeSigner::generate()
            }
        };

        let verifier = match &config.public_key_path {
            Some(path) => {
                let verifier = EnvelopeVerifier::from_pem(&read(path)?).map_err(|source| {
                    StartupError::Key {
                        what: "public key",
                        source,
                    }
                })?;
                let sample = b"pool-key-check";
                verifier
                    .verify(sample, &signer.sign(sample))
                    .map_err(|_| StartupError::KeyMismatch)?;
                verifier
            }
            None => signer.verifier(),
        };

        let secret = config
            .engine_secret
            .as_deref()
            .ok_or(StartupError::MissingEngineSecret)?;
        let engine_box = SecretBox::from_base64(secret).map_err(|source| StartupError::Key {
            what: ENGINE_SECRET_ENV,
            source,
        })?;

        let customer_keys = match &config.customer_keys_path {
            Some(path) => KeyStore::load_from_file(path)?,
            None => {
                warn!("No customer key file configured, withdrawals will be refused");
                KeyStore::new()
            }
        };
        info!(customers = customer_keys.len(), "Key material loaded");

        Ok(Self {
            signer,
            verifier,
            engine_box,
            customer_keys,
        })
    }

    /// Fresh random keys and an empty customer key store.
    pub fn ephemeral() -> Result<Self, StartupError> {
        let signer = EnvelopeSigner::generate();
        let engine_box = SecretBox::from_base64(&SecretBox::generate_key_base64()).map_err(
            |source| StartupError::Key {
                what: "ephemeral engine key",
                source,
            },
        )?;
        Ok(Self {
            verifier: signer.verifier(),
            signer,
            engine_box,
            customer_keys: KeyStore::new(),
        })
    }
}

/// Everything the service's tasks share.
pub struct PoolState {
    pub config: PoolConfig,
    pub ledger: Arc<LedgerDb>,
    pub broker: Arc<DurableBroker>,
    pub keys: Arc<KeyStore>,
    pub locks: Arc<CustomerLocks>,
    pub otp: Arc<OtpService>,
    pub dispatcher: Arc<Dispatcher>,
    pub opener: Arc<EnvelopeOpener>,
    pub legs: LegRegistry,
    pub withdrawals: WithdrawalCoordinator,
    pub deposits: DepositCoordinator,
}

impl PoolState {
    /// Open storage under `config.data_dir` and wire the coordinators.
    pub fn open(config: PoolConfig, keys: PoolKeys) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| StartupError::Io {
            path: config.data_dir.clone(),
            source,
        })?;
        let ledger = Arc::new(LedgerDb::open(&config.data_dir.join(LEDGER_DB_FILE))?);
        let broker = Arc::new(DurableBroker::open(
            &config.data_dir.join(BROKER_DB_FILE),
            config.broker,
        )?);
        let channel: Arc<dyn MessageChannel> = broker.clone();

        let PoolKeys {
            signer,
            verifier,
            engine_box,
            customer_keys,
        } = keys;
        let customer_keys = Arc::new(customer_keys);
        let locks = Arc::new(CustomerLocks::new());

        let otp = Arc::new(
            OtpService::new(
                Arc::new(InMemoryOtpStore::new(OTP_CACHE_CAPACITY)),
                Arc::new(ChannelOtpSender::new(channel.clone())),
                config.otp_ttl,
            )
            .with_audit(ledger.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            ledger.clone(),
            channel,
            EnvelopeSealer::new(signer, engine_box.clone()),
        ));
        let opener = Arc::new(EnvelopeOpener::new(verifier, engine_box.clone()));

        info!(
            data_dir = %config.data_dir.display(),
            "Pool state opened"
        );

        Ok(Self {
            legs: LegRegistry::new(ledger.clone(), engine_box),
            withdrawals: WithdrawalCoordinator::new(
                ledger.clone(),
                otp.clone(),
                customer_keys.clone(),
                locks.clone(),
                dispatcher.clone(),
            ),
            deposits: DepositCoordinator::new(
                ledger.clone(),
                locks.clone(),
                dispatcher.clone(),
                config.allocation,
            ),
            config,
            ledger,
            broker,
            keys: customer_keys,
            locks,
            otp,
            dispatcher,
            opener,
        })
    }

    pub fn execution_consumer(&self, engine: Arc<dyn ExecutionEngine>) -> ExecutionConsumer {
        ExecutionConsumer::new(
            self.broker.clone(),
            self.ledger.clone(),
            self.opener.clone(),
            engine,
            self.config.execution_workers,
            self.config.execution_timeout,
        )
    }

    pub fn deposit_sequencer(&self, rail: Arc<dyn PaymentRail>) -> DepositSequencer {
        DepositSequencer::new(
            self.broker.clone(),
            self.ledger.clone(),
            rail,
            self.config.deposit_push_interval,
        )
    }

    pub fn reconciler(&self) -> DispatchReconciler {
        DispatchReconciler::new(
            self.ledger.clone(),
            self.dispatcher.clone(),
            self.config.reconcile_interval,
            self.config.dispatch_max_attempts,
        )
        .with_stall_timeout(self.config.stall_timeout)
    }
}
