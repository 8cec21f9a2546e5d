// =============================================================================
// Ratchet Warden — Main Entry Point
// =============================================================================
//
// Starts the entry orchestrator and the four protection workers (stage
// tracker, trailing controller, reconciler, orphan sweeper) on their own
// intervals against one exchange account, plus the operator API. The engine
// starts in Demo mode unless the config or WARDEN_ACCOUNT_MODE says Live.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod error;
mod exchange;
mod orchestrator;
mod protection;
mod risk;
mod runtime_config;
mod symbol_book;
mod trade_log;
mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::error::ExchangeError;
use crate::exchange::{Exchange, PaperExchange};
use crate::orchestrator::{EntryOutcome, Orchestrator};
use crate::protection::trailing::TrailOutcome;
use crate::protection::{OrphanSweeper, Reconciler, StageTracker, TrailingController};
use crate::runtime_config::RuntimeConfig;
use crate::symbol_book::SymbolBook;
use crate::types::AccountMode;

const DEFAULT_CONFIG_PATH: &str = "warden_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Ratchet Warden — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    }

    info!(symbols = ?config.symbols, "Configured trading pairs");
    info!(
        account_mode = %config.account_mode,
        testnet = config.testnet,
        hedge_mode = config.hedge_mode,
        max_positions = config.max_positions,
        "Engine configuration"
    );

    // ── 2. Exchange & shared state ───────────────────────────────────────
    let exchange = build_exchange(&config)?;
    let admin_token = std::env::var("WARDEN_ADMIN_TOKEN").ok();
    let state = Arc::new(AppState::new(config.clone()).with_admin_token(admin_token));
    if state.admin_token.is_none() {
        warn!("WARDEN_ADMIN_TOKEN not set; authenticated API routes are disabled");
    }

    // ── 3. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("WARDEN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    let app = api::rest::router(state.clone());
    info!(addr = %bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server stopped");
        }
    });

    // ── 4. Entry orchestrator ────────────────────────────────────────────
    let orchestrator = Orchestrator::new(exchange.clone(), config.clone());
    let orch_state = state.clone();
    let orch_every = config.intervals.orchestrator_secs;
    tokio::spawn(async move {
        let mut interval = worker_interval(orch_every);
        loop {
            interval.tick().await;
            let decisions = orch_state.drain_decisions();
            if decisions.is_empty() {
                orch_state.record_cycle("orchestrator", "idle");
                continue;
            }
            let received = decisions.len();
            let outcomes = orchestrator.run_cycle(&orch_state.book, decisions).await;
            let mut opened = 0;
            for outcome in &outcomes {
                match outcome {
                    EntryOutcome::Opened { .. } => opened += 1,
                    EntryOutcome::Failed { symbol, error } => {
                        orch_state.push_error("orchestrator", Some(symbol), error.clone());
                    }
                    EntryOutcome::Skipped { .. } => {}
                }
            }
            info!(received, opened, "orchestrator cycle complete");
            orch_state.record_cycle("orchestrator", format!("{received} decisions, {opened} opened"));
        }
    });

    // ── 5. Protection workers ────────────────────────────────────────────
    let hedge = config.hedge_mode;

    let tracker = Arc::new(StageTracker::new(exchange.clone(), config.protection.clone(), hedge));
    spawn_symbol_worker(
        "stage_tracker",
        config.intervals.stage_tracker_secs,
        state.clone(),
        exchange.clone(),
        move |book, symbol| {
            let tracker = tracker.clone();
            async move { tracker.run_symbol(&book, &symbol).await.map(|e| e.len()) }
        },
    );

    if config.trailing.enabled {
        let trailing = Arc::new(TrailingController::new(
            exchange.clone(),
            config.trailing.clone(),
            config.protection.clone(),
            hedge,
        ));
        spawn_symbol_worker(
            "trailing",
            config.intervals.trailing_secs,
            state.clone(),
            exchange.clone(),
            move |book, symbol| {
                let trailing = trailing.clone();
                async move {
                    trailing
                        .run_symbol(&book, &symbol)
                        .await
                        .map(|outcomes| outcomes.iter().filter(|o| **o != TrailOutcome::Idle).count())
                }
            },
        );
    } else {
        info!("trailing controller disabled by config");
    }

    let reconciler = Arc::new(Reconciler::new(exchange.clone(), config.protection.clone(), hedge));
    spawn_symbol_worker(
        "reconciler",
        config.intervals.reconciler_secs,
        state.clone(),
        exchange.clone(),
        move |book, symbol| {
            let reconciler = reconciler.clone();
            async move {
                reconciler
                    .run_symbol(&book, &symbol)
                    .await
                    .map(|repairs| repairs.iter().filter(|r| r.changed_orders()).count())
            }
        },
    );

    let sweeper = Arc::new(OrphanSweeper::new(exchange.clone(), config.orphan.clone()));
    spawn_symbol_worker(
        "orphan_sweeper",
        config.intervals.orphan_secs,
        state.clone(),
        exchange.clone(),
        move |book, symbol| {
            let sweeper = sweeper.clone();
            async move { sweeper.run_symbol(&book, &symbol).await.map(|r| r.canceled.len()) }
        },
    );

    info!("All workers running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");

    if let Err(e) = state.runtime_config.read().save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Ratchet Warden shut down complete.");
    Ok(())
}

/// Demo routes orders to a local paper book priced from the public futures
/// API; Live trades through the signed client.
fn build_exchange(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn Exchange>> {
    match config.account_mode {
        AccountMode::Demo => {
            let market: Arc<dyn Exchange> = Arc::new(BinanceClient::public(config.testnet)?);
            info!(equity = config.sizing.account_equity, "Demo mode: orders are simulated locally");
            Ok(Arc::new(PaperExchange::with_market(config.sizing.account_equity, market)))
        }
        AccountMode::Live => {
            let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is required in Live mode")?;
            let api_secret =
                std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is required in Live mode")?;
            warn!(testnet = config.testnet, "LIVE mode: orders reach the exchange");
            Ok(Arc::new(BinanceClient::new(api_key, api_secret, config.testnet)?))
        }
    }
}

fn worker_interval(every_secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Run `run` for every candidate symbol on a fixed interval. A symbol's
/// failure is logged and recorded; it never stops the loop or the other
/// symbols of the same cycle.
fn spawn_symbol_worker<F, Fut>(
    name: &'static str,
    every_secs: u64,
    state: Arc<AppState>,
    exchange: Arc<dyn Exchange>,
    run: F,
) where
    F: Fn(Arc<SymbolBook>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize, ExchangeError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = worker_interval(every_secs);
        loop {
            interval.tick().await;

            let positions = match exchange.fetch_positions().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(worker = name, error = %e, "positions unavailable; skipping cycle");
                    state.push_error(name, None, e.to_string());
                    continue;
                }
            };
            let configured = state.runtime_config.read().symbols.clone();
            let symbols = OrphanSweeper::candidate_symbols(&configured, &state.book, &positions);

            let results = join_all(symbols.iter().map(|s| run(state.book.clone(), s.clone()))).await;

            let mut actions = 0;
            let mut failed = 0;
            for (symbol, result) in symbols.iter().zip(results) {
                match result {
                    Ok(n) => actions += n,
                    Err(e) => {
                        failed += 1;
                        if e.is_transient() {
                            warn!(worker = name, symbol = %symbol, error = %e, "symbol cycle failed; retrying next cycle");
                        } else {
                            error!(worker = name, symbol = %symbol, error = %e, "symbol cycle failed");
                        }
                        state.push_error(name, Some(symbol), e.to_string());
                    }
                }
            }
            state.record_cycle(
                name,
                format!("{} symbols, {actions} actions, {failed} failed", symbols.len()),
            );
        }
    });
}
