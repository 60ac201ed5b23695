// Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prediction_market_ledger::config::{MarketSettings, RetrySettings};
use prediction_market_ledger::ledger::LedgerStore;
use prediction_market_ledger::market_resolve::markets::{Market, NewMarket, Points, UserId};
use prediction_market_ledger::{
    BalanceService, ManualClock, MarketService, MemoryNotifier, PointsBank, PointsError,
};

pub const GUILD: u64 = 77;
pub const CREATOR: UserId = 9;
pub const CHANNEL: u64 = 555;
pub const ALICE: UserId = 1001;
pub const BOB: UserId = 1002;
pub const CAROL: UserId = 1003;
pub const DAVE: UserId = 1004;
pub const STARTING_BALANCE: Points = 1000;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

pub fn settings() -> MarketSettings {
    MarketSettings {
        initial_liquidity: 1000,
        ..MarketSettings::default()
    }
}

pub fn fast_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        base_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(2),
    }
}

/// What the scripted balance service should get wrong
#[derive(Debug, Clone)]
pub enum Fault {
    None,
    /// Every debit fails with this error
    FailDebits(PointsError),
    /// Credits succeed this many times, then fail as unavailable
    FailCreditsAfter(usize),
}

/// A points bank that fails on command
pub struct FlakyBank {
    pub bank: PointsBank,
    fault: Mutex<Fault>,
    credits: AtomicUsize,
    pub debit_calls: AtomicUsize,
}

impl FlakyBank {
    pub fn new(starting_balance: Points) -> Self {
        Self {
            bank: PointsBank::new(starting_balance),
            fault: Mutex::new(Fault::None),
            credits: AtomicUsize::new(0),
            debit_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fault(&self, fault: Fault) {
        self.credits.store(0, Ordering::SeqCst);
        self.debit_calls.store(0, Ordering::SeqCst);
        *self.fault.lock() = fault;
    }
}

#[async_trait]
impl BalanceService for FlakyBank {
    async fn balance(&self, user_id: UserId) -> Result<Points, PointsError> {
        self.bank.balance(user_id).await
    }

    async fn debit(&self, user_id: UserId, amount: Points, key: &str) -> Result<Points, PointsError> {
        self.debit_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.fault.lock().clone();
        if let Fault::FailDebits(err) = fault {
            return Err(err);
        }
        self.bank.debit(user_id, amount, key).await
    }

    async fn credit(&self, user_id: UserId, amount: Points, key: &str) -> Result<Points, PointsError> {
        let fault = self.fault.lock().clone();
        if let Fault::FailCreditsAfter(limit) = fault {
            if self.credits.fetch_add(1, Ordering::SeqCst) >= limit {
                return Err(PointsError::Unavailable("points API timed out".into()));
            }
        }
        self.bank.credit(user_id, amount, key).await
    }
}

pub struct Harness {
    pub service: Arc<MarketService>,
    pub store: LedgerStore,
    pub balances: Arc<FlakyBank>,
    pub notifier: Arc<MemoryNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: MarketSettings) -> Self {
        let store = LedgerStore::temporary().unwrap();
        let balances = Arc::new(FlakyBank::new(STARTING_BALANCE));
        let notifier = Arc::new(MemoryNotifier::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let service = Arc::new(MarketService::new(
            store.clone(),
            balances.clone(),
            notifier.clone(),
            clock.clone(),
            settings,
            fast_retry(),
        ));
        Self {
            service,
            store,
            balances,
            notifier,
            clock,
        }
    }

    pub fn create_market(&self, options: &[&str]) -> Market {
        self.service
            .create_market(NewMarket {
                guild_id: GUILD,
                creator_id: CREATOR,
                question: "Will it rain on Friday?".into(),
                options: options.iter().map(|o| o.to_string()).collect(),
                duration: Duration::hours(2),
                category: Some("weather".into()),
                channel_id: Some(CHANNEL),
            })
            .unwrap()
    }

    pub fn binary_market(&self) -> Market {
        self.create_market(&["Yes", "No"])
    }

    /// Move past the end time and close betting
    pub async fn end(&self, market: &Market) -> Market {
        self.clock.set(market.end_time + Duration::minutes(1));
        self.service.end_market(&market.id).await.unwrap()
    }

    pub async fn balance(&self, user: UserId) -> Points {
        self.balances.balance(user).await.unwrap()
    }
}
