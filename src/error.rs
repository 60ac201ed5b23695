// ============================================================================
// Error taxonomy for the prediction market ledger
// ============================================================================
//
// Every lifecycle operation returns `Result<T, MarketError>`. Variants map
// one-to-one onto how a command layer should react:
//
//   Validation / NotFound / InsufficientLiquidity / InsufficientBalance /
//   MarketState / VoteThreshold / NoWinningStake  -> report to the caller
//   Persistence / ExternalService                 -> retry or alert
//
// ============================================================================

use crate::ledger::StoreError;
use crate::market_resolve::cpmm::PricingError;
use crate::market_resolve::markets::MarketStatus;
use crate::points::PointsError;
use thiserror::Error;

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient liquidity on '{option}' in market {market_id}")]
    InsufficientLiquidity { market_id: String, option: String },

    #[error("insufficient balance for user {user_id}: need {required}, have {available}")]
    InsufficientBalance {
        user_id: u64,
        required: i64,
        available: i64,
    },

    #[error("market {market_id} is {status}, cannot {action}")]
    MarketState {
        market_id: String,
        status: MarketStatus,
        action: &'static str,
    },

    #[error("option '{option}' has {votes} vote(s), {required} required to resolve")]
    VoteThreshold {
        option: String,
        votes: usize,
        required: usize,
    },

    #[error("no points were wagered on '{option}' in market {market_id}")]
    NoWinningStake { market_id: String, option: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("external service error: {0}")]
    ExternalService(String),
}

impl MarketError {
    pub fn state(market_id: &str, status: MarketStatus, action: &'static str) -> Self {
        MarketError::MarketState {
            market_id: market_id.to_string(),
            status,
            action,
        }
    }

    /// Errors that leave no trace in the ledger and can be shown to users as-is.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            MarketError::Persistence(_) | MarketError::ExternalService(_)
        )
    }

    pub(crate) fn from_pricing(err: PricingError, market_id: &str, option: &str) -> Self {
        match err {
            PricingError::InsufficientLiquidity | PricingError::InfinitePrice => {
                MarketError::InsufficientLiquidity {
                    market_id: market_id.to_string(),
                    option: option.to_string(),
                }
            }
            other => MarketError::Validation(other.to_string()),
        }
    }

    pub(crate) fn from_points(err: PointsError, user_id: u64) -> Self {
        match err {
            PointsError::Insufficient {
                required,
                available,
            } => MarketError::InsufficientBalance {
                user_id,
                required,
                available,
            },
            other => MarketError::ExternalService(other.to_string()),
        }
    }
}
