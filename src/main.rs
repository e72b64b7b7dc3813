// =============================================================================
// Meridian Trade Engine — Main Entry Point
// =============================================================================
//
// Exit codes:
//   0 — normal termination (including graceful SIGTERM/SIGINT shutdown)
//   1 — unrecoverable startup error (bad config, missing credentials,
//       startup lock held by a live process)
//   2 — fatal runtime error (three consecutive cycle failures, or a graceful
//       shutdown that blew its 30-second budget)
// =============================================================================

mod advisor;
mod config;
mod cooldown;
mod cycle;
mod errors;
mod exchange;
mod executor;
mod indicators;
mod market_data;
mod opportunity;
mod performance;
mod portfolio;
mod risk;
mod storage;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::advisor::HttpAdvisor;
use crate::config::Settings;
use crate::cycle::Engine;
use crate::errors::EngineError;
use crate::exchange::client::HttpExchangeClient;
use crate::exchange::{AccountBalance, ExchangeApi};
use crate::performance::{PerformanceTracker, SnapshotType};
use crate::portfolio::Portfolio;
use crate::storage::{DataPaths, ProcessLock};
use crate::types::{RestartContext, StartupRecord};

/// Seed cash for a first boot in simulation mode with no reachable exchange.
const SIM_STARTING_BALANCE: f64 = 10_000.0;

/// Graceful-shutdown budget.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Trade Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return 1;
        }
    };
    if settings.requires_credentials() {
        error!("live mode requires MERIDIAN_API_KEY and MERIDIAN_API_SECRET");
        return 1;
    }
    info!(
        pairs = ?settings.pairs.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        quote = %settings.quote_currency,
        simulation = settings.risk.simulation_mode,
        interval_minutes = settings.decision_interval_minutes,
        "configuration loaded"
    );

    // ── 2. Data directory and single-process lock ────────────────────────
    let paths = DataPaths::new(&settings.output.data_dir);
    if let Err(e) = paths.ensure_layout() {
        error!(error = %e, "cannot create data directory layout");
        return 1;
    }
    let lock = match ProcessLock::acquire(&paths.lock_file()) {
        Ok(lock) => lock,
        Err(EngineError::LockContested { holder_pid }) => {
            error!(holder_pid, "another engine instance is running");
            return 1;
        }
        Err(e) => {
            error!(error = %e, "failed to acquire process lock");
            return 1;
        }
    };

    // ── 3. Startup record ────────────────────────────────────────────────
    let session_id = Uuid::new_v4().to_string();
    let restart_context = match storage::read_json::<StartupRecord>(&paths.startup_record()) {
        Ok(previous) if previous.restart_context != RestartContext::Stop => {
            RestartContext::Restart
        }
        Ok(_) => RestartContext::Normal,
        Err(_) => RestartContext::Normal,
    };
    let startup = StartupRecord {
        pid: std::process::id(),
        startup_time: Utc::now().to_rfc3339(),
        session_id: session_id.clone(),
        restart_context,
    };
    if let Err(e) = storage::write_startup_record(&paths.startup_record(), &startup) {
        warn!(error = %e, "failed to write startup record");
    }
    info!(session_id = %session_id, ?restart_context, "session started");

    // ── 4. Exchange client and advisory oracle ───────────────────────────
    let exchange = Arc::new(HttpExchangeClient::new(&settings.exchange));
    let advisor = Arc::new(HttpAdvisor::new(settings.advisor.clone()));

    // ── 5. Ledger: load, recover, or bootstrap ───────────────────────────
    let ledger = match load_or_bootstrap_ledger(&settings, &paths, exchange.as_ref()).await {
        Ok(ledger) => ledger,
        Err(code) => return code,
    };
    info!(
        value = ledger.portfolio_value_quote,
        assets = ledger.holdings.len(),
        "ledger ready"
    );

    // ── 6. Performance tracker ───────────────────────────────────────────
    let mut tracker = PerformanceTracker::load(
        paths.clone(),
        session_id.clone(),
        &settings.output.snapshot_frequency,
        settings.output.snapshot_retention_days,
        &ledger,
    );
    if let Err(e) = tracker.snapshot(&ledger, SnapshotType::Startup) {
        warn!(error = %e, "startup snapshot failed");
    }

    // ── 7. Engine ────────────────────────────────────────────────────────
    let shutting_down = Arc::new(AtomicBool::new(false));
    let shutdown_notify = Arc::new(Notify::new());
    let mut engine = Engine::new(
        settings,
        paths.clone(),
        exchange,
        advisor,
        ledger,
        tracker,
        shutting_down.clone(),
    );
    engine.set_shutdown_notify(shutdown_notify.clone());

    let mut engine_task = tokio::spawn(async move {
        let run_result = engine.run().await;
        if let Err(e) = engine.finalize() {
            warn!(error = %e, "final persistence failed");
        }
        run_result
    });

    // ── 8. Wait for completion or a shutdown signal ──────────────────────
    let exit_code = tokio::select! {
        joined = &mut engine_task => match joined {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                error!(error = %e, "fatal runtime error");
                2
            }
            Err(e) => {
                error!(error = %e, "engine task panicked");
                2
            }
        },
        _ = shutdown_signal() => {
            warn!("shutdown signal received — finishing the in-flight trade");
            shutting_down.store(true, Ordering::SeqCst);
            shutdown_notify.notify_one();

            match tokio::time::timeout(SHUTDOWN_BUDGET, engine_task).await {
                Ok(Ok(Ok(()))) => 0,
                Ok(Ok(Err(e))) => {
                    error!(error = %e, "engine failed during shutdown");
                    2
                }
                Ok(Err(e)) => {
                    error!(error = %e, "engine task panicked during shutdown");
                    2
                }
                Err(_) => {
                    error!("graceful shutdown exceeded 30s budget — hard exit");
                    2
                }
            }
        }
    };

    // ── 9. Final startup record and lock release ─────────────────────────
    let stop_record = StartupRecord {
        pid: std::process::id(),
        startup_time: Utc::now().to_rfc3339(),
        session_id,
        restart_context: RestartContext::Stop,
    };
    if let Err(e) = storage::write_startup_record(&paths.startup_record(), &stop_record) {
        warn!(error = %e, "failed to write stop record");
    }
    lock.release();

    info!(exit_code, "Meridian Trade Engine shut down");
    exit_code
}

/// Load the persisted ledger, recover from its backup, or bootstrap a new one
/// from the exchange (or a simulation seed). A corrupt ledger is preserved
/// under a `.corrupt` name, never silently overwritten.
async fn load_or_bootstrap_ledger<E: ExchangeApi>(
    settings: &Settings,
    paths: &DataPaths,
    exchange: &E,
) -> Result<Portfolio, i32> {
    let ledger_path = paths.portfolio();

    if ledger_path.exists() {
        match Portfolio::load(&ledger_path) {
            Ok(ledger) => return Ok(ledger),
            Err(e) => {
                warn!(error = %e, "ledger unrecoverable — preserving corrupt file");
                let preserved = ledger_path
                    .with_file_name(format!("portfolio.json.corrupt-{}", Utc::now().timestamp()));
                if let Err(e) = std::fs::rename(&ledger_path, &preserved) {
                    error!(error = %e, "cannot preserve corrupt ledger");
                    return Err(1);
                }
            }
        }
    }

    // First start (or recovery): bootstrap from the exchange snapshot.
    match exchange.get_accounts().await {
        Ok(balances) => {
            let mut prices = HashMap::new();
            for pair in &settings.pairs {
                if let Ok(ticker) = exchange.get_product_ticker(pair).await {
                    prices.insert(pair.base.clone(), ticker.price);
                }
            }
            Ok(Portfolio::from_exchange(
                &balances,
                &prices,
                &settings.quote_currency,
            ))
        }
        Err(e) if settings.risk.simulation_mode => {
            warn!(error = %e, "exchange unreachable — seeding simulation ledger");
            let seed = vec![AccountBalance {
                currency: settings.quote_currency.clone(),
                available: SIM_STARTING_BALANCE,
                hold: 0.0,
            }];
            Ok(Portfolio::from_exchange(
                &seed,
                &HashMap::new(),
                &settings.quote_currency,
            ))
        }
        Err(e) => {
            error!(error = %e, tag = e.taxonomy_tag(), "cannot bootstrap ledger from exchange");
            Err(1)
        }
    }
}

/// Resolve on SIGTERM or SIGINT; SIGHUP is swallowed (config is immutable at
/// runtime).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return,
                _ = sigterm.recv() => return,
                _ = sighup.recv() => {
                    info!("SIGHUP ignored — configuration is immutable at runtime");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
