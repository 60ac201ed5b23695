// Prediction Market Ledger - Main Entry Point
// Serves the market lifecycle over HTTP and runs the expiry/refund scheduler

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

use prediction_market_ledger::app_state::{AppState, SharedState};
use prediction_market_ledger::config::Config;
use prediction_market_ledger::handlers;
use prediction_market_ledger::ledger::LedgerStore;
use prediction_market_ledger::scheduler::Scheduler;
use prediction_market_ledger::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    telemetry::init_tracing(&config.log_level);

    info!("═══════════════════════════════════════════════");
    info!("     🎲 Prediction Market Ledger");
    info!("═══════════════════════════════════════════════");

    let store = LedgerStore::open(&config.db_path)
        .with_context(|| format!("failed to open ledger at {}", config.db_path))?;
    let state: SharedState = Arc::new(
        AppState::from_config(&config, store).context("failed to open the points bank")?,
    );

    // Expiry and auto-refund sweeps
    let scheduler = Arc::new(Scheduler::new(state.markets.clone(), config.scheduler.clone()));
    let scheduler_handle = scheduler.spawn();

    let app = handlers::router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "🚀 server running");
    info!("   GET  /health                     - Health check");
    info!("   POST /markets                    - Create market");
    info!("   GET  /markets?guild_id=&status=&category= - List markets");
    info!("   GET  /categories?guild_id=       - Market categories in a guild");
    info!("   GET  /markets/:id                - Market details and vote tally");
    info!("   GET  /markets/:id/quote?points=  - Price a bet on every option");
    info!("   GET  /markets/:id/bets?user_id=  - Bets on a market");
    info!("   GET  /markets/:id/options/:option/positions - Stakes on an option per user");
    info!("   POST /markets/:id/bets           - Place bet");
    info!("   POST /markets/:id/end            - Close betting after the end time");
    info!("   POST /markets/:id/votes          - Vote on the winning option");
    info!("   POST /markets/:id/resolve        - Resolve market");
    info!("   POST /markets/:id/refund         - Refund market");
    info!("   GET  /markets/:id/resolution     - Resolution and payouts");
    info!("   GET  /balance/:user_id           - Points balance");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("🛑 shutdown signal received");
    scheduler_handle.shutdown().await;

    info!("💾 flushing ledger to disk");
    match state.save().await {
        Ok(bytes) => info!(bytes, "✅ ledger flushed"),
        Err(e) => error!(error = %e, "❌ failed to flush ledger"),
    }
    info!("👋 goodbye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
}
