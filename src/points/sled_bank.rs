//! Points balances kept in the ledger database, so they survive restarts.
//!
//! Three trees next to the market data:
//!
//!   points_balances      user_id (BE) -> i64 (BE)
//!   points_keys          idempotency key -> balance after it was applied
//!   points_transactions  user_id (BE) ++ sequence (BE) -> PointsTransaction JSON
//!
//! A debit or credit, its idempotency key and its log entry commit together.

use async_trait::async_trait;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionalTree,
};
use sled::{IVec, Transactional};
use tracing::{debug, error, info};

use super::{BalanceService, PointsError, PointsTransaction, TxKind};
use crate::ledger::{LedgerStore, StoreError};
use crate::market_resolve::markets::{Points, UserId};

type PointsTxResult<T> = ConflictableTransactionResult<T, PointsError>;

fn account_key(user_id: UserId) -> [u8; 8] {
    user_id.to_be_bytes()
}

fn log_key(user_id: UserId, sequence: u64) -> Vec<u8> {
    let mut key = account_key(user_id).to_vec();
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn read_points(bytes: &[u8]) -> Result<Points, PointsError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PointsError::Rejected(format!("corrupt balance record of {} bytes", bytes.len())))?;
    Ok(Points::from_be_bytes(raw))
}

fn tx_points(bytes: &IVec) -> PointsTxResult<Points> {
    read_points(bytes).map_err(ConflictableTransactionError::Abort)
}

fn tx_log(log: &TransactionalTree, entry: &PointsTransaction) -> PointsTxResult<()> {
    let bytes = serde_json::to_vec(entry)
        .map_err(|e| ConflictableTransactionError::Abort(PointsError::Rejected(e.to_string())))?;
    let sequence = log.generate_id().map_err(ConflictableTransactionError::Storage)?;
    log.insert(log_key(entry.user_id, sequence), bytes)?;
    Ok(())
}

/// Balances stored in sled. New users start with `starting_balance`.
#[derive(Clone)]
pub struct SledPointsBank {
    starting_balance: Points,
    balances: sled::Tree,
    applied: sled::Tree,
    transactions: sled::Tree,
}

impl SledPointsBank {
    pub fn open(store: &LedgerStore, starting_balance: Points) -> Result<Self, StoreError> {
        Ok(Self {
            starting_balance,
            balances: store.tree("points_balances")?,
            applied: store.tree("points_keys")?,
            transactions: store.tree("points_transactions")?,
        })
    }

    /// Movements for one user, oldest first
    pub fn transactions(&self, user_id: UserId) -> Result<Vec<PointsTransaction>, StoreError> {
        let mut out = Vec::new();
        for item in self.transactions.scan_prefix(account_key(user_id)) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn apply(&self, user_id: UserId, amount: Points, key: &str, kind: TxKind) -> Result<Points, PointsError> {
        if amount <= 0 {
            return Err(PointsError::Rejected(format!("amount must be positive, got {}", amount)));
        }

        let trees = (&self.balances, &self.applied, &self.transactions);
        let result = trees.transaction(|(balances, applied, log)| -> PointsTxResult<(Points, bool, bool)> {
            if let Some(previous) = applied.get(key.as_bytes())? {
                return Ok((tx_points(&previous)?, false, true));
            }

            let account = account_key(user_id);
            let (current, opened) = match balances.get(account)? {
                Some(bytes) => (tx_points(&bytes)?, false),
                None => {
                    let created = PointsTransaction::new(
                        TxKind::AccountCreated,
                        user_id,
                        self.starting_balance,
                        None,
                        self.starting_balance,
                    );
                    tx_log(log, &created)?;
                    (self.starting_balance, true)
                }
            };

            let updated = match kind {
                TxKind::Debit if current < amount => {
                    return Err(ConflictableTransactionError::Abort(PointsError::Insufficient {
                        required: amount,
                        available: current,
                    }));
                }
                TxKind::Debit => current - amount,
                _ => current.checked_add(amount).ok_or_else(|| {
                    ConflictableTransactionError::Abort(PointsError::Rejected("balance overflow".into()))
                })?,
            };

            balances.insert(&account[..], &updated.to_be_bytes()[..])?;
            applied.insert(key.as_bytes(), &updated.to_be_bytes()[..])?;
            tx_log(log, &PointsTransaction::new(kind, user_id, amount, Some(key), updated))?;
            Ok((updated, opened, false))
        });

        match result {
            Ok((balance, opened, duplicate)) => {
                if opened {
                    info!(user_id, starting_balance = self.starting_balance, "points account opened");
                }
                if duplicate {
                    debug!(user_id, key, "duplicate points request ignored");
                }
                Ok(balance)
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => {
                error!(user_id, key, error = %e, "points storage failed");
                Err(PointsError::Rejected(format!("points storage failed: {}", e)))
            }
        }
    }
}

#[async_trait]
impl BalanceService for SledPointsBank {
    async fn balance(&self, user_id: UserId) -> Result<Points, PointsError> {
        match self.balances.get(account_key(user_id)) {
            Ok(Some(bytes)) => read_points(&bytes),
            Ok(None) => Ok(self.starting_balance),
            Err(e) => Err(PointsError::Rejected(format!("points storage failed: {}", e))),
        }
    }

    async fn debit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError> {
        self.apply(user_id, amount, idempotency_key, TxKind::Debit)
    }

    async fn credit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError> {
        self.apply(user_id, amount, idempotency_key, TxKind::Credit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(starting_balance: Points) -> SledPointsBank {
        SledPointsBank::open(&LedgerStore::temporary().unwrap(), starting_balance).unwrap()
    }

    #[tokio::test]
    async fn test_balance_read_does_not_open_account() {
        let bank = bank(1000);
        assert_eq!(bank.balance(7).await.unwrap(), 1000);
        assert!(bank.transactions(7).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debit_credit_and_log() {
        let bank = bank(100);
        assert_eq!(bank.debit(1, 40, "bet:a").await.unwrap(), 60);
        assert_eq!(bank.credit(1, 15, "payout:a").await.unwrap(), 75);
        assert_eq!(bank.balance(1).await.unwrap(), 75);

        let kinds: Vec<TxKind> = bank.transactions(1).unwrap().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TxKind::AccountCreated, TxKind::Debit, TxKind::Credit]);
        assert!(bank.transactions(2).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_key_applies_once() {
        let bank = bank(100);
        bank.debit(1, 40, "bet:x").await.unwrap();
        assert_eq!(bank.debit(1, 40, "bet:x").await.unwrap(), 60);
        assert_eq!(bank.balance(1).await.unwrap(), 60);
        assert_eq!(bank.transactions(1).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_overdraft_leaves_nothing_behind() {
        let bank = bank(10);
        let err = bank.debit(1, 11, "bet:y").await.unwrap_err();
        assert_eq!(err, PointsError::Insufficient { required: 11, available: 10 });
        assert!(bank.transactions(1).unwrap().is_empty());

        bank.credit(1, 10, "payout:y").await.unwrap();
        assert_eq!(bank.debit(1, 11, "bet:y").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_balances_survive_reopen() {
        let path = std::env::temp_dir().join(format!("points_{}", uuid::Uuid::new_v4().simple()));
        {
            let store = LedgerStore::open(&path).unwrap();
            let bank = SledPointsBank::open(&store, 500).unwrap();
            bank.debit(3, 120, "bet:z").await.unwrap();
            store.flush().await.unwrap();
        }

        let store = LedgerStore::open(&path).unwrap();
        let bank = SledPointsBank::open(&store, 500).unwrap();
        assert_eq!(bank.balance(3).await.unwrap(), 380);
        assert_eq!(bank.debit(3, 120, "bet:z").await.unwrap(), 380);
        drop((bank, store));
        let _ = std::fs::remove_dir_all(&path);
    }
}
