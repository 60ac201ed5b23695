// ============================================================================
// Scheduler - expiry notifier and auto-refund sweep
// ============================================================================
//
// Two periodic passes over the ledger:
//   - expiry: Active markets past their end time -> end_market
//   - refund: Ended markets past end_time + auto_refund_window -> refund
//
// Both select strictly by status and every transition is a storage CAS, so a
// pass can be repeated (or run by two processes) without double effects.
//
// ============================================================================

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSettings;
use crate::error::MarketError;
use crate::market_resolve::lifecycle::MarketService;
use crate::market_resolve::markets::MarketStatus;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepSummary {
    /// Markets that matched the pass's filter
    pub examined: usize,
    /// Markets this pass actually transitioned
    pub transitioned: Vec<String>,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Expiry,
    Refund,
}

pub struct Scheduler {
    service: Arc<MarketService>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(service: Arc<MarketService>, settings: SchedulerSettings) -> Self {
        Self { service, settings }
    }

    pub async fn run_expiry_pass(&self) -> SweepSummary {
        let now = self.service.now();
        let mut summary = SweepSummary::default();

        let due = match self.service.store().markets_with_status(MarketStatus::Active) {
            Ok(markets) => markets.into_iter().filter(|m| m.end_time <= now),
            Err(e) => {
                error!(error = %e, "expiry pass could not list markets");
                return summary;
            }
        };

        for market in due {
            summary.examined += 1;
            match self.service.end_market(&market.id).await {
                Ok(_) => summary.transitioned.push(market.id),
                Err(MarketError::MarketState { status, .. }) => {
                    debug!(market_id = %market.id, status = %status, "already moved on");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(market_id = %market.id, error = %e, "could not end market");
                }
            }
        }

        if !summary.transitioned.is_empty() || summary.failed > 0 {
            info!(
                ended = summary.transitioned.len(),
                failed = summary.failed,
                "expiry pass finished"
            );
        }
        summary
    }

    pub async fn run_refund_pass(&self) -> SweepSummary {
        let now = self.service.now();
        let window = self.service.settings().auto_refund_window;
        let mut summary = SweepSummary::default();

        let due = match self.service.store().markets_with_status(MarketStatus::Ended) {
            Ok(markets) => markets
                .into_iter()
                .filter(|m| m.refund_due_at(window) <= now),
            Err(e) => {
                error!(error = %e, "refund pass could not list markets");
                return summary;
            }
        };

        for market in due {
            summary.examined += 1;
            match self.service.refund(&market.id).await {
                Ok(report) => {
                    info!(
                        market_id = %market.id,
                        users = report.refunds.len(),
                        total = report.total_refunded,
                        "unresolved market auto-refunded"
                    );
                    summary.transitioned.push(market.id);
                }
                Err(MarketError::MarketState { status, .. }) => {
                    debug!(market_id = %market.id, status = %status, "already moved on");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(market_id = %market.id, error = %e, "auto-refund failed, will retry next pass");
                }
            }
        }
        summary
    }

    /// Start both loops. They run until the returned handle is shut down.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(self.clone().run_loop(Sweep::Expiry, self.settings.expiry_interval, receiver.clone())),
            tokio::spawn(self.clone().run_loop(Sweep::Refund, self.settings.refund_interval, receiver)),
        ];
        info!(
            expiry_secs = self.settings.expiry_interval.as_secs(),
            refund_secs = self.settings.refund_interval.as_secs(),
            "scheduler started"
        );
        SchedulerHandle { shutdown, tasks }
    }

    async fn run_loop(self: Arc<Self>, sweep: Sweep, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep {
                        Sweep::Expiry => { self.run_expiry_pass().await; }
                        Sweep::Refund => { self.run_refund_pass().await; }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(?sweep, "scheduler loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal both loops and wait for the pass in flight to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task panicked");
            }
        }
        info!("scheduler stopped");
    }
}
