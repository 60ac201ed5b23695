/// Prediction Market Ledger
/// Exports all modules for use as a library crate

pub mod app_state;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod ledger;
pub mod market_resolve;
pub mod models;
pub mod notify;
pub mod points;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use app_state::{AppState, SharedState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, MarketSettings, RetrySettings, SchedulerSettings};
pub use error::{MarketError, MarketResult};
pub use ledger::{LedgerStore, StoreError};
pub use market_resolve::{
    Bet, CpmmPool, LiquidityPool, Market, MarketFilter, MarketQuote, MarketResolution,
    MarketService, MarketStatus, NewMarket, OptionPosition, Payout, PricingError, RefundReport,
    ResolutionReport, ResolutionVote, SettlementEngine, VoteOutcome,
};
pub use notify::{LogNotifier, MemoryNotifier, Notifier, NotifyError, Recipient, WebhookNotifier};
pub use points::{BalanceService, PointsBank, PointsError, RemotePointsClient, SledPointsBank};
pub use scheduler::{Scheduler, SchedulerHandle, SweepSummary};
