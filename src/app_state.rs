// Application state management

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, MarketSettings, RetrySettings};
use crate::ledger::{LedgerStore, StoreError};
use crate::market_resolve::lifecycle::MarketService;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::points::{BalanceService, RemotePointsClient, SledPointsBank};

pub type SharedState = Arc<AppState>;

/// Everything the HTTP handlers and the scheduler share
pub struct AppState {
    pub markets: Arc<MarketService>,
    pub store: LedgerStore,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire production collaborators from configuration. Without a points
    /// API, balances live in the ledger database next to the markets.
    pub fn from_config(config: &Config, store: LedgerStore) -> Result<Self, StoreError> {
        let balances: Arc<dyn BalanceService> = match &config.points_api_url {
            Some(url) => Arc::new(RemotePointsClient::new(url.clone())),
            None => {
                info!(starting_balance = config.starting_balance, "points balances stored in the ledger");
                Arc::new(SledPointsBank::open(&store, config.starting_balance)?)
            }
        };
        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => {
                info!(url = %url, "notifications go to webhook");
                Arc::new(WebhookNotifier::new(url.clone()))
            }
            None => Arc::new(LogNotifier),
        };

        Ok(Self::with_parts(
            store,
            balances,
            notifier,
            Arc::new(SystemClock),
            config.market.clone(),
            config.retry.clone(),
        ))
    }

    pub fn with_parts(
        store: LedgerStore,
        balances: Arc<dyn BalanceService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: MarketSettings,
        retry: RetrySettings,
    ) -> Self {
        let started_at = clock.now();
        let markets = Arc::new(MarketService::new(
            store.clone(),
            balances,
            notifier,
            clock,
            settings,
            retry,
        ));
        Self {
            markets,
            store,
            started_at,
        }
    }

    /// Flush the ledger to disk
    pub async fn save(&self) -> Result<usize, StoreError> {
        self.store.flush().await
    }
}
