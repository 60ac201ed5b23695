//! Durable ledger for prediction markets
//!
//! Every market, pool, bet, vote, resolution and payout lives in its own sled
//! tree. Multi-record changes (placing a bet, claiming a resolution, status
//! transitions) run as sled multi-tree transactions, so a crash never leaves
//! a bet without its pool update or a resolution without its status change.
//!
//! Key layout (values are JSON):
//! - markets      `market_id`                -> Market
//! - pools        `market_id \0 option`      -> LiquidityPool
//! - bets         `market_id \0 bet_id`      -> Bet
//! - votes        `market_id \0 user_id`     -> ResolutionVote
//! - resolutions  `market_id`                -> MarketResolution
//! - payouts      `market_id \0 bet_id`      -> Payout
//! - tallies      `market_id`                -> votes per option

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use sled::Transactional;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{MarketError, MarketResult};
use crate::market_resolve::cpmm::Trade;
use crate::market_resolve::markets::{
    Bet, LiquidityPool, Market, MarketResolution, MarketStatus, Payout, ResolutionVote,
};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

type TxResult<T> = ConflictableTransactionResult<T, MarketError>;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn tx_encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    encode(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn tx_decode<T: DeserializeOwned>(bytes: &[u8]) -> TxResult<T> {
    decode(bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn settle<T>(result: TransactionResult<T, MarketError>) -> MarketResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => MarketError::Persistence(StoreError::Sled(err)),
    })
}

fn pair_key(market_id: &str, suffix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(market_id.len() + suffix.len() + 1);
    key.extend_from_slice(market_id.as_bytes());
    key.push(0);
    key.extend_from_slice(suffix.as_bytes());
    key
}

fn prefix(market_id: &str) -> Vec<u8> {
    pair_key(market_id, "")
}

fn not_found(market_id: &str) -> MarketError {
    MarketError::NotFound(format!("market {}", market_id))
}

/// Read a market inside a transaction, aborting if it does not exist.
fn tx_market(markets: &TransactionalTree, market_id: &str) -> TxResult<Market> {
    match markets.get(market_id.as_bytes())? {
        Some(bytes) => tx_decode(&bytes),
        None => abort(not_found(market_id)),
    }
}

fn tx_pools(pools: &TransactionalTree, market: &Market) -> TxResult<Vec<LiquidityPool>> {
    let mut out = Vec::with_capacity(market.options.len());
    for option in &market.options {
        match pools.get(pair_key(&market.id, option))? {
            Some(bytes) => out.push(tx_decode(&bytes)?),
            None => {
                return abort(MarketError::Persistence(StoreError::Corrupt(format!(
                    "missing pool '{}' for market {}",
                    option, market.id
                ))))
            }
        }
    }
    Ok(out)
}

fn tx_tally(tallies: &TransactionalTree, market_id: &str) -> TxResult<BTreeMap<String, usize>> {
    match tallies.get(market_id.as_bytes())? {
        Some(bytes) => tx_decode(&bytes),
        None => Ok(BTreeMap::new()),
    }
}

fn tx_apply_deltas(
    pools: &TransactionalTree,
    current: &[LiquidityPool],
    trade: &Trade,
    sign: rust_decimal::Decimal,
) -> TxResult<()> {
    for (pool, delta) in current.iter().zip(&trade.deltas) {
        if delta.is_zero() {
            continue;
        }
        let mut updated = pool.clone();
        updated.reserve += *delta * sign;
        pools.insert(pair_key(&pool.market_id, &pool.option), tx_encode(&updated)?)?;
    }
    Ok(())
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Clone)]
pub struct LedgerStore {
    db: sled::Db,
    markets: sled::Tree,
    pools: sled::Tree,
    bets: sled::Tree,
    votes: sled::Tree,
    resolutions: sled::Tree,
    payouts: sled::Tree,
    tallies: sled::Tree,
}

impl LedgerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "ledger store opened");
        Self::from_db(db)
    }

    /// In-memory store removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            markets: db.open_tree("markets")?,
            pools: db.open_tree("pools")?,
            bets: db.open_tree("bets")?,
            votes: db.open_tree("votes")?,
            resolutions: db.open_tree("resolutions")?,
            payouts: db.open_tree("payouts")?,
            tallies: db.open_tree("tallies")?,
            db,
        })
    }

    /// Another named tree in the same database
    pub fn tree(&self, name: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(name)?)
    }

    pub async fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush_async().await?)
    }

    fn scan<T: DeserializeOwned>(&self, tree: &sled::Tree, market_id: &str) -> MarketResult<Vec<T>> {
        let mut out = Vec::new();
        for item in tree.scan_prefix(prefix(market_id)) {
            let (_, value) = item.map_err(StoreError::from)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    // ========================================================================
    // MARKETS
    // ========================================================================

    /// Persist a new market with one pool per option.
    pub fn insert_market(&self, market: &Market, pools: &[LiquidityPool]) -> MarketResult<()> {
        let result = (&self.markets, &self.pools).transaction(|(markets, pool_tree)| {
            if markets.get(market.id.as_bytes())?.is_some() {
                return abort(MarketError::Validation(format!("market {} already exists", market.id)));
            }
            markets.insert(market.id.as_bytes(), tx_encode(market)?)?;
            for pool in pools {
                pool_tree.insert(pair_key(&pool.market_id, &pool.option), tx_encode(pool)?)?;
            }
            Ok(())
        });
        settle(result)
    }

    pub fn market(&self, market_id: &str) -> MarketResult<Option<Market>> {
        match self.markets.get(market_id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_market(&self, market_id: &str) -> MarketResult<Market> {
        self.market(market_id)?.ok_or_else(|| not_found(market_id))
    }

    pub fn markets(&self) -> MarketResult<Vec<Market>> {
        let mut out = Vec::new();
        for item in self.markets.iter() {
            let (_, value) = item.map_err(StoreError::from)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn markets_with_status(&self, status: MarketStatus) -> MarketResult<Vec<Market>> {
        Ok(self
            .markets()?
            .into_iter()
            .filter(|m| m.status == status)
            .collect())
    }

    /// Pools in the market's option order
    pub fn pools(&self, market: &Market) -> MarketResult<Vec<LiquidityPool>> {
        let mut out = Vec::with_capacity(market.options.len());
        for option in &market.options {
            let bytes = self
                .pools
                .get(pair_key(&market.id, option))
                .map_err(StoreError::from)?
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("missing pool '{}' for market {}", option, market.id))
                })?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    /// Compare-and-swap on market status. Fails with `MarketState` when the
    /// stored status is not `from`.
    pub fn transition(
        &self,
        market_id: &str,
        from: MarketStatus,
        to: MarketStatus,
        action: &'static str,
    ) -> MarketResult<Market> {
        let result = self.markets.transaction(|markets| {
            let mut market = tx_market(markets, market_id)?;
            if market.status != from {
                return abort(MarketError::state(market_id, market.status, action));
            }
            market.status = to;
            markets.insert(market_id.as_bytes(), tx_encode(&market)?)?;
            Ok(market)
        });
        let market = settle(result)?;
        debug!(market_id, from = %from, to = %to, "market status changed");
        Ok(market)
    }

    // ========================================================================
    // BETS
    // ========================================================================

    /// Atomically price and record a bet.
    ///
    /// `plan` sees the authoritative market and pools inside the transaction
    /// and returns the bet plus the trade whose deltas are applied to the
    /// pools. The market must be Active.
    pub fn record_bet<P>(&self, market_id: &str, plan: P) -> MarketResult<(Bet, Trade)>
    where
        P: Fn(&Market, &[LiquidityPool]) -> MarketResult<(Bet, Trade)>,
    {
        let result = (&self.markets, &self.pools, &self.bets).transaction(|(markets, pools, bets)| {
            let mut market = tx_market(markets, market_id)?;
            if market.status != MarketStatus::Active {
                return abort(MarketError::state(market_id, market.status, "place a bet"));
            }
            let current = tx_pools(pools, &market)?;
            let (bet, trade) = match plan(&market, &current) {
                Ok(planned) => planned,
                Err(e) => return abort(e),
            };

            bets.insert(pair_key(market_id, &bet.id), tx_encode(&bet)?)?;
            tx_apply_deltas(pools, &current, &trade, rust_decimal::Decimal::ONE)?;

            market.total_wagered = match market.total_wagered.checked_add(bet.amount) {
                Some(total) => total,
                None => return abort(MarketError::Validation("market volume overflow".into())),
            };
            markets.insert(market_id.as_bytes(), tx_encode(&market)?)?;
            Ok((bet, trade))
        });
        settle(result)
    }

    /// Remove a bet and reverse exactly the deltas it applied.
    /// A bet that is already gone is left alone.
    pub fn rollback_bet(&self, bet: &Bet, trade: &Trade) -> MarketResult<bool> {
        let result = (&self.markets, &self.pools, &self.bets).transaction(|(markets, pools, bets)| {
            let key = pair_key(&bet.market_id, &bet.id);
            if bets.get(&key)?.is_none() {
                return Ok(false);
            }
            let mut market = tx_market(markets, &bet.market_id)?;
            let current = tx_pools(pools, &market)?;

            bets.remove(key)?;
            tx_apply_deltas(pools, &current, trade, -rust_decimal::Decimal::ONE)?;
            market.total_wagered -= bet.amount;
            markets.insert(bet.market_id.as_bytes(), tx_encode(&market)?)?;
            Ok(true)
        });
        settle(result)
    }

    /// Bets in placement order
    pub fn bets(&self, market_id: &str) -> MarketResult<Vec<Bet>> {
        let mut bets: Vec<Bet> = self.scan(&self.bets, market_id)?;
        bets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(bets)
    }

    // ========================================================================
    // VOTES
    // ========================================================================

    /// Insert or replace a user's vote; the market must be Ended.
    /// The market's tally moves with the vote in the same transaction.
    pub fn upsert_vote(&self, vote: &ResolutionVote) -> MarketResult<()> {
        let result = (&self.markets, &self.votes, &self.tallies).transaction(|(markets, votes, tallies)| {
            let market = tx_market(markets, &vote.market_id)?;
            if market.status != MarketStatus::Ended {
                return abort(MarketError::state(&vote.market_id, market.status, "vote"));
            }
            let key = pair_key(&vote.market_id, &vote.user_id.to_string());
            let mut tally = tx_tally(tallies, &vote.market_id)?;
            if let Some(bytes) = votes.get(&key)? {
                let previous: ResolutionVote = tx_decode(&bytes)?;
                if let Some(count) = tally.get_mut(&previous.option) {
                    *count = count.saturating_sub(1);
                }
            }
            *tally.entry(vote.option.clone()).or_insert(0) += 1;

            votes.insert(key, tx_encode(vote)?)?;
            tallies.insert(vote.market_id.as_bytes(), tx_encode(&tally)?)?;
            Ok(())
        });
        settle(result)
    }

    /// Votes per option as kept by `upsert_vote`
    pub fn vote_tally(&self, market_id: &str) -> MarketResult<BTreeMap<String, usize>> {
        match self.tallies.get(market_id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn votes(&self, market_id: &str) -> MarketResult<Vec<ResolutionVote>> {
        self.scan(&self.votes, market_id)
    }

    // ========================================================================
    // RESOLUTION & PAYOUTS
    // ========================================================================

    /// Ended -> Resolved together with the resolution row. Exactly one caller wins.
    ///
    /// The winning option's vote count is re-read from the tally inside the
    /// transaction and must still reach `min_votes`; the stored resolution
    /// carries that count.
    pub fn claim_resolution(
        &self,
        resolution: &MarketResolution,
        min_votes: usize,
    ) -> MarketResult<(Market, MarketResolution)> {
        let market_id = resolution.market_id.as_str();
        let result = (&self.markets, &self.resolutions, &self.tallies).transaction(
            |(markets, resolutions, tallies)| {
                let mut market = tx_market(markets, market_id)?;
                if market.status != MarketStatus::Ended {
                    return abort(MarketError::state(market_id, market.status, "resolve"));
                }
                let votes = tx_tally(tallies, market_id)?
                    .get(&resolution.winning_option)
                    .copied()
                    .unwrap_or(0);
                if votes < min_votes {
                    return abort(MarketError::VoteThreshold {
                        option: resolution.winning_option.clone(),
                        votes,
                        required: min_votes,
                    });
                }

                let mut claimed = resolution.clone();
                claimed.vote_count = votes;
                market.status = MarketStatus::Resolved;
                market.winning_option = Some(claimed.winning_option.clone());
                markets.insert(market_id.as_bytes(), tx_encode(&market)?)?;
                resolutions.insert(market_id.as_bytes(), tx_encode(&claimed)?)?;
                Ok((market, claimed))
            },
        );
        settle(result)
    }

    /// Undo a claimed resolution: Resolved -> Ended, drop the resolution row
    /// and every payout row written for it.
    pub fn release_resolution(&self, market_id: &str) -> MarketResult<Market> {
        let mut payout_keys = Vec::new();
        for item in self.payouts.scan_prefix(prefix(market_id)).keys() {
            payout_keys.push(item.map_err(StoreError::from)?);
        }

        let result = (&self.markets, &self.resolutions, &self.payouts).transaction(
            |(markets, resolutions, payouts)| {
                let mut market = tx_market(markets, market_id)?;
                if market.status != MarketStatus::Resolved {
                    return abort(MarketError::state(market_id, market.status, "release resolution"));
                }
                market.status = MarketStatus::Ended;
                market.winning_option = None;
                markets.insert(market_id.as_bytes(), tx_encode(&market)?)?;
                resolutions.remove(market_id.as_bytes())?;
                for key in &payout_keys {
                    payouts.remove(key.clone())?;
                }
                Ok(market)
            },
        );
        settle(result)
    }

    pub fn resolution(&self, market_id: &str) -> MarketResult<Option<MarketResolution>> {
        match self.resolutions.get(market_id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn record_payout(&self, payout: &Payout) -> MarketResult<()> {
        self.payouts
            .insert(pair_key(&payout.market_id, &payout.bet_id), encode(payout)?)
            .map_err(StoreError::from)?;
        Ok(())
    }

    pub fn payouts(&self, market_id: &str) -> MarketResult<Vec<Payout>> {
        self.scan(&self.payouts, market_id)
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("markets", &self.markets.len())
            .field("bets", &self.bets.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
