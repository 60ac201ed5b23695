// ============================================================================
// Market Resolve Module - Core Market & Betting Logic
// ============================================================================
//
// This module contains the core prediction market functionality:
//   - cpmm: Constant Product Market Maker for pricing
//   - markets: Market, pool, bet, vote and payout records
//   - lifecycle: Market creation, betting, voting and state transitions
//   - settlement: Pari-mutuel payouts and refunds
//
// ============================================================================

pub mod cpmm;
pub mod lifecycle;
pub mod markets;
pub mod settlement;

pub use cpmm::{CpmmPool, PricingError, Trade};
pub use lifecycle::{
    MarketFilter, MarketQuote, MarketService, OptionPosition, OptionQuote, QuoteCache, VoteOutcome,
};
pub use markets::*;
pub use settlement::{RefundReport, ResolutionReport, SettlementEngine};
