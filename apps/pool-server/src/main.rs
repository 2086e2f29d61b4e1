// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pool_server::config::{PoolConfig, LOG_FORMAT_ENV};
use pool_server::providers::{RailResult, SandboxEngine, SandboxRail};
use pool_server::state::{PoolKeys, PoolState, StartupError};

/// How often expired one-time codes are purged.
const OTP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const BROKER_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = PoolConfig::from_env()?;
    let keys = PoolKeys::load(&config)?;
    let state = Arc::new(PoolState::open(config, keys)?);

    let shutdown = CancellationToken::new();
    let (rail, rail_results) = SandboxRail::new();

    let tasks = vec![
        tokio::spawn(
            state
                .execution_consumer(Arc::new(SandboxEngine::new()))
                .run(shutdown.clone()),
        ),
        tokio::spawn(state.deposit_sequencer(Arc::new(rail)).run(shutdown.clone())),
        tokio::spawn(route_rail_results(
            state.clone(),
            rail_results,
            shutdown.clone(),
        )),
        tokio::spawn(state.reconciler().run(shutdown.clone())),
        tokio::spawn(
            state
                .broker
                .clone()
                .run_pruner(BROKER_PRUNE_INTERVAL, shutdown.clone()),
        ),
        tokio::spawn(
            state
                .otp
                .clone()
                .run_sweeper(OTP_SWEEP_INTERVAL, shutdown.clone()),
        ),
    ];

    info!(
        workers = state.config.execution_workers,
        "Pool server running with sandbox engine and rail"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C, shutting down");
    }
    info!("Shutdown requested");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Pool server stopped");
    Ok(())
}

/// Feed payment rail callbacks into the deposit coordinator.
async fn route_rail_results(
    state: Arc<PoolState>,
    mut results: mpsc::UnboundedReceiver<RailResult>,
    shutdown: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            result = results.recv() => result,
            _ = shutdown.cancelled() => return,
        };
        let Some(result) = result else {
            return;
        };
        if let Err(e) = state.deposits.on_rail_result(&result) {
            warn!(
                tracking_id = %result.tracking_id,
                error = %e,
                "Could not apply rail result"
            );
        }
    }
}
