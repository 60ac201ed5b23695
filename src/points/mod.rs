// ============================================================================
// Points balances
// ============================================================================
//
// The market core never touches balances directly. It debits stakes and
// credits payouts through `BalanceService`, always with an idempotency key so
// a retried call is applied at most once.
//
//   - SledPointsBank:     balances in the ledger database (default)
//   - PointsBank:         in-memory balances for tests and embedding
//   - RemotePointsClient: HTTP client for an external points API
//
// ============================================================================

mod remote;
mod sled_bank;

pub use remote::RemotePointsClient;
pub use sled_bank::SledPointsBank;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::market_resolve::markets::{Points, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointsError {
    #[error("insufficient points: need {required}, have {available}")]
    Insufficient { required: Points, available: Points },

    /// Transient: timeouts, connection failures, 5xx. Safe to retry.
    #[error("balance service unavailable: {0}")]
    Unavailable(String),

    #[error("balance service rejected the request: {0}")]
    Rejected(String),
}

impl PointsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PointsError::Unavailable(_))
    }
}

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn balance(&self, user_id: UserId) -> Result<Points, PointsError>;

    /// Remove `amount` points. Returns the new balance.
    async fn debit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError>;

    /// Add `amount` points. Returns the new balance.
    async fn credit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError>;
}

// ============================================================================
// IN-PROCESS BANK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    AccountCreated,
    Debit,
    Credit,
}

/// One balance movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: String,
    pub kind: TxKind,
    pub user_id: UserId,
    pub amount: Points,
    pub idempotency_key: Option<String>,
    pub balance_after: Points,
    pub timestamp: DateTime<Utc>,
}

impl PointsTransaction {
    fn new(kind: TxKind, user_id: UserId, amount: Points, key: Option<&str>, balance_after: Points) -> Self {
        Self {
            id: format!("ptx_{}", &uuid::Uuid::new_v4().simple().to_string()[..16]),
            kind,
            user_id,
            amount,
            idempotency_key: key.map(str::to_string),
            balance_after,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct BankState {
    balances: HashMap<UserId, Points>,
    /// idempotency key -> balance returned when it was first applied
    applied: HashMap<String, Points>,
    transactions: Vec<PointsTransaction>,
}

impl BankState {
    /// Balance of `user_id`, opening the account on first sight.
    fn account(&mut self, user_id: UserId, starting_balance: Points) -> &mut Points {
        if !self.balances.contains_key(&user_id) {
            self.transactions.push(PointsTransaction::new(
                TxKind::AccountCreated,
                user_id,
                starting_balance,
                None,
                starting_balance,
            ));
            info!(user_id, starting_balance, "points account opened");
        }
        self.balances.entry(user_id).or_insert(starting_balance)
    }
}

/// In-memory balances. New users start with `starting_balance`.
#[derive(Debug)]
pub struct PointsBank {
    starting_balance: Points,
    state: Mutex<BankState>,
}

impl PointsBank {
    pub fn new(starting_balance: Points) -> Self {
        Self {
            starting_balance,
            state: Mutex::new(BankState::default()),
        }
    }

    /// Set a user's balance outright (seeding, admin tools, tests).
    pub fn set_balance(&self, user_id: UserId, amount: Points) {
        let mut state = self.state.lock();
        *state.account(user_id, self.starting_balance) = amount;
    }

    pub fn transactions(&self, user_id: UserId) -> Vec<PointsTransaction> {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    fn apply(&self, user_id: UserId, amount: Points, key: &str, kind: TxKind) -> Result<Points, PointsError> {
        if amount <= 0 {
            return Err(PointsError::Rejected(format!("amount must be positive, got {}", amount)));
        }

        let mut state = self.state.lock();
        if let Some(previous) = state.applied.get(key) {
            debug!(user_id, key, "duplicate points request ignored");
            return Ok(*previous);
        }

        let balance = state.account(user_id, self.starting_balance);
        let updated = match kind {
            TxKind::Debit => {
                if *balance < amount {
                    return Err(PointsError::Insufficient {
                        required: amount,
                        available: *balance,
                    });
                }
                *balance - amount
            }
            _ => balance
                .checked_add(amount)
                .ok_or_else(|| PointsError::Rejected("balance overflow".into()))?,
        };
        *balance = updated;

        state.applied.insert(key.to_string(), updated);
        state
            .transactions
            .push(PointsTransaction::new(kind, user_id, amount, Some(key), updated));
        Ok(updated)
    }
}

#[async_trait]
impl BalanceService for PointsBank {
    async fn balance(&self, user_id: UserId) -> Result<Points, PointsError> {
        let mut state = self.state.lock();
        Ok(*state.account(user_id, self.starting_balance))
    }

    async fn debit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError> {
        self.apply(user_id, amount, idempotency_key, TxKind::Debit)
    }

    async fn credit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError> {
        self.apply(user_id, amount, idempotency_key, TxKind::Credit)
    }
}
