// ============================================================================
// Market Lifecycle
// ============================================================================
//
//   Active --end_market--> Ended --resolve--> Resolved
//                            |
//                            +----refund----> Refunded
//
// Every transition is a compare-and-swap in the ledger store. Bets are priced
// and recorded in one storage transaction and debited afterwards; a failed
// debit removes the bet and restores the pools exactly.
//
// ============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{MarketSettings, RetrySettings};
use crate::error::{MarketError, MarketResult};
use crate::ledger::LedgerStore;
use crate::market_resolve::cpmm::{volume_shares, CpmmPool};
use crate::market_resolve::markets::{
    format_duration, generate_bet_id, generate_market_id, normalize_options, Bet, GuildId,
    LiquidityPool, Market, MarketResolution, MarketStatus, NewMarket, Payout, Points,
    ResolutionVote, UserId,
};
use crate::market_resolve::settlement::{RefundReport, ResolutionReport, SettlementEngine};
use crate::notify::{self, Notifier};
use crate::points::{BalanceService, PointsError};
use crate::retry::with_backoff;

const MAX_QUESTION_LEN: usize = 300;
/// Quote cache capacity; the oldest entry is evicted beyond this
const MAX_CACHED_QUOTES: usize = 1024;

// ============================================================================
// QUOTES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct OptionQuote {
    pub option: String,
    pub reserve: Decimal,
    /// Shares `points` would buy right now; `None` if the pool cannot fill it
    pub potential_shares: Option<Decimal>,
    pub price_per_share: Option<Decimal>,
    /// AMM marginal price, 0..1
    pub probability: f64,
    /// This option's fraction of all points wagered
    pub volume_share: f64,
    pub total_wagered: Points,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketQuote {
    pub market_id: String,
    pub question: String,
    pub status: MarketStatus,
    pub end_time: DateTime<Utc>,
    pub points: Points,
    pub total_wagered: Points,
    pub options: Vec<OptionQuote>,
}

/// Short-lived quote cache, invalidated on every write to a market.
/// Expired entries are swept on insert and the map never exceeds its capacity.
#[derive(Debug)]
pub struct QuoteCache {
    ttl: std::time::Duration,
    capacity: usize,
    entries: Mutex<HashMap<(String, Points), (Instant, MarketQuote)>>,
}

impl QuoteCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self::with_capacity(ttl, MAX_CACHED_QUOTES)
    }

    pub fn with_capacity(ttl: std::time::Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, market_id: &str, points: Points) -> Option<MarketQuote> {
        let mut entries = self.entries.lock();
        let key = (market_id.to_string(), points);
        match entries.get(&key) {
            Some((at, quote)) if at.elapsed() < self.ttl => Some(quote.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, quote: &MarketQuote) {
        if self.ttl.is_zero() || self.capacity == 0 {
            return;
        }
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        entries.retain(|_, (at, _)| at.elapsed() < ttl);

        let key = (quote.market_id.clone(), quote.points);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (Instant::now(), quote.clone()));
    }

    pub fn invalidate(&self, market_id: &str) {
        self.entries.lock().retain(|(id, _), _| id != market_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One async mutex per market, created on first use
#[derive(Debug, Default)]
struct MarketLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MarketLocks {
    fn for_market(&self, market_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget a market's lock once it no longer takes bets.
    fn release(&self, market_id: &str) {
        self.locks.lock().remove(market_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Listing filter; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub guild_id: Option<GuildId>,
    pub status: Option<MarketStatus>,
    /// Matched case-insensitively against the market's category
    pub category: Option<String>,
}

impl MarketFilter {
    fn matches(&self, market: &Market) -> bool {
        self.guild_id.map_or(true, |g| market.guild_id == g)
            && self.status.map_or(true, |s| market.status == s)
            && self.category.as_deref().map_or(true, |wanted| {
                market
                    .category
                    .as_deref()
                    .map_or(false, |c| c.eq_ignore_ascii_case(wanted.trim()))
            })
    }
}

/// One user's combined stake on an option
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionPosition {
    pub user_id: UserId,
    pub total_amount: Points,
    pub total_shares: Decimal,
    pub bets: usize,
}

// ============================================================================
// VOTING
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    /// Vote stored, threshold not reached yet
    Recorded {
        vote: ResolutionVote,
        counts: BTreeMap<String, usize>,
    },
    /// This vote resolved the market
    Resolved {
        vote: ResolutionVote,
        counts: BTreeMap<String, usize>,
        report: ResolutionReport,
    },
    /// Another caller resolved the market first
    AlreadyResolved {
        vote: ResolutionVote,
        counts: BTreeMap<String, usize>,
    },
    /// Threshold reached but the market cannot be resolved this way
    Stalled {
        vote: ResolutionVote,
        counts: BTreeMap<String, usize>,
        reason: String,
    },
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct MarketService {
    store: LedgerStore,
    balances: Arc<dyn BalanceService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: MarketSettings,
    retry: RetrySettings,
    settlement: SettlementEngine,
    quotes: QuoteCache,
    locks: MarketLocks,
}

impl MarketService {
    pub fn new(
        store: LedgerStore,
        balances: Arc<dyn BalanceService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: MarketSettings,
        retry: RetrySettings,
    ) -> Self {
        let settlement = SettlementEngine::new(
            store.clone(),
            balances.clone(),
            notifier.clone(),
            clock.clone(),
            settings.min_resolution_votes,
            retry.clone(),
        );
        Self {
            quotes: QuoteCache::new(settings.quote_cache_ttl),
            locks: MarketLocks::default(),
            store,
            balances,
            notifier,
            clock,
            settings,
            retry,
            settlement,
        }
    }

    pub fn settings(&self) -> &MarketSettings {
        &self.settings
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn quote_cache(&self) -> &QuoteCache {
        &self.quotes
    }

    pub async fn balance(&self, user_id: UserId) -> MarketResult<Points> {
        with_backoff(
            &self.retry,
            "balance",
            || self.balances.balance(user_id),
            PointsError::is_transient,
        )
        .await
        .map_err(|e| MarketError::from_points(e, user_id))
    }

    // ========================================================================
    // CREATE
    // ========================================================================

    pub fn create_market(&self, new: NewMarket) -> MarketResult<Market> {
        let question = new.question.trim().to_string();
        if question.is_empty() {
            return Err(MarketError::Validation("question cannot be empty".into()));
        }
        if question.chars().count() > MAX_QUESTION_LEN {
            return Err(MarketError::Validation(format!(
                "question cannot exceed {} characters",
                MAX_QUESTION_LEN
            )));
        }
        let options = normalize_options(&new.options, self.settings.max_options)?;
        if new.duration < self.settings.min_duration || new.duration > self.settings.max_duration {
            return Err(MarketError::Validation(format!(
                "duration must be between {} and {}",
                format_duration(self.settings.min_duration),
                format_duration(self.settings.max_duration)
            )));
        }

        let now = self.clock.now();
        let liquidity = self.settings.initial_liquidity;
        let pool = CpmmPool::seeded(liquidity, options.len()).map_err(|e| {
            MarketError::Validation(format!("cannot seed pools with liquidity {}: {}", liquidity, e))
        })?;
        let market = Market {
            id: generate_market_id(),
            guild_id: new.guild_id,
            question,
            options,
            creator_id: new.creator_id,
            category: new
                .category
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            channel_id: new.channel_id,
            created_at: now,
            end_time: now + new.duration,
            status: MarketStatus::Active,
            winning_option: None,
            initial_liquidity: liquidity,
            k: pool.k,
            total_wagered: 0,
        };
        let pools: Vec<LiquidityPool> = market
            .options
            .iter()
            .zip(&pool.reserves)
            .map(|(option, reserve)| LiquidityPool {
                market_id: market.id.clone(),
                option: option.clone(),
                reserve: *reserve,
            })
            .collect();

        self.store.insert_market(&market, &pools)?;
        info!(
            market_id = %market.id,
            guild_id = market.guild_id,
            options = market.options.len(),
            end_time = %market.end_time,
            "market created"
        );
        Ok(market)
    }

    // ========================================================================
    // READ
    // ========================================================================

    pub fn market(&self, market_id: &str) -> MarketResult<Market> {
        self.store.require_market(market_id)
    }

    /// Markets of one guild, newest first
    pub fn markets_in_guild(&self, guild_id: GuildId, status: Option<MarketStatus>) -> MarketResult<Vec<Market>> {
        self.find_markets(&MarketFilter {
            guild_id: Some(guild_id),
            status,
            category: None,
        })
    }

    /// Markets across all guilds, newest first
    pub fn markets(&self, status: Option<MarketStatus>) -> MarketResult<Vec<Market>> {
        self.find_markets(&MarketFilter {
            status,
            ..MarketFilter::default()
        })
    }

    /// Markets matching `filter`, newest first
    pub fn find_markets(&self, filter: &MarketFilter) -> MarketResult<Vec<Market>> {
        let mut markets: Vec<Market> = self
            .store
            .markets()?
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect();
        markets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(markets)
    }

    /// Distinct categories among a guild's markets, sorted
    pub fn categories(&self, guild_id: GuildId, status: Option<MarketStatus>) -> MarketResult<Vec<String>> {
        let mut categories: Vec<String> = self
            .markets_in_guild(guild_id, status)?
            .into_iter()
            .filter_map(|m| m.category)
            .collect();
        categories.sort_by_key(|c| c.to_lowercase());
        categories.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        Ok(categories)
    }

    pub fn bets(&self, market_id: &str) -> MarketResult<Vec<Bet>> {
        self.store.require_market(market_id)?;
        self.store.bets(market_id)
    }

    /// One user's bets on a market, newest first
    pub fn bets_for_user(&self, market_id: &str, user_id: UserId) -> MarketResult<Vec<Bet>> {
        let mut bets: Vec<Bet> = self
            .bets(market_id)?
            .into_iter()
            .filter(|b| b.user_id == user_id)
            .collect();
        bets.reverse();
        Ok(bets)
    }

    /// Stakes on one option summed per user, ordered by user
    pub fn option_positions(&self, market_id: &str, option: &str) -> MarketResult<Vec<OptionPosition>> {
        let market = self.store.require_market(market_id)?;
        let (_, canonical) = market.canonical_option(option)?;
        let mut positions: BTreeMap<UserId, OptionPosition> = BTreeMap::new();
        for bet in self.store.bets(market_id)?.into_iter().filter(|b| b.option == canonical) {
            let position = positions.entry(bet.user_id).or_insert(OptionPosition {
                user_id: bet.user_id,
                total_amount: 0,
                total_shares: Decimal::ZERO,
                bets: 0,
            });
            position.total_amount += bet.amount;
            position.total_shares += bet.shares;
            position.bets += 1;
        }
        Ok(positions.into_values().collect())
    }

    pub fn resolution(&self, market_id: &str) -> MarketResult<Option<MarketResolution>> {
        self.store.require_market(market_id)?;
        self.store.resolution(market_id)
    }

    pub fn payouts(&self, market_id: &str) -> MarketResult<Vec<Payout>> {
        self.store.require_market(market_id)?;
        self.store.payouts(market_id)
    }

    /// Votes per option, every option present
    pub fn get_vote_counts(&self, market_id: &str) -> MarketResult<BTreeMap<String, usize>> {
        let market = self.store.require_market(market_id)?;
        let mut counts: BTreeMap<String, usize> =
            market.options.iter().map(|o| (o.clone(), 0)).collect();
        for vote in self.store.votes(market_id)? {
            *counts.entry(vote.option).or_insert(0) += 1;
        }
        Ok(counts)
    }

    // ========================================================================
    // QUOTE
    // ========================================================================

    pub fn quote(&self, market_id: &str, points: Points) -> MarketResult<MarketQuote> {
        if points <= 0 {
            return Err(MarketError::Validation("points to spend must be positive".into()));
        }
        if let Some(cached) = self.quotes.get(market_id, points) {
            return Ok(cached);
        }

        let market = self.store.require_market(market_id)?;
        let pools = self.store.pools(&market)?;
        let mut option_totals = vec![0 as Points; market.options.len()];
        for bet in self.store.bets(market_id)? {
            if let Some(i) = market.option_index(&bet.option) {
                option_totals[i] += bet.amount;
            }
        }

        let pool = CpmmPool::new(pools.iter().map(|p| p.reserve).collect(), market.k);
        let probabilities = pool.marginal_prices();
        let volumes = volume_shares(&option_totals);

        let options = market
            .options
            .iter()
            .enumerate()
            .map(|(i, option)| {
                let trade = pool.quote_points(i, points).ok();
                OptionQuote {
                    option: option.clone(),
                    reserve: pool.reserves[i],
                    potential_shares: trade.as_ref().map(|t| t.shares),
                    price_per_share: trade.as_ref().map(|t| t.price_per_share),
                    probability: probabilities[i],
                    volume_share: volumes[i],
                    total_wagered: option_totals[i],
                }
            })
            .collect();

        let quote = MarketQuote {
            market_id: market.id.clone(),
            question: market.question.clone(),
            status: market.status,
            end_time: market.end_time,
            points,
            total_wagered: market.total_wagered,
            options,
        };
        self.quotes.put(&quote);
        Ok(quote)
    }

    // ========================================================================
    // BET
    // ========================================================================

    pub async fn place_bet(
        &self,
        market_id: &str,
        user_id: UserId,
        option: &str,
        amount: Points,
    ) -> MarketResult<Bet> {
        let now = self.clock.now();
        let market = self.store.require_market(market_id)?;
        if market.status != MarketStatus::Active {
            return Err(MarketError::state(market_id, market.status, "place a bet"));
        }
        if now >= market.end_time {
            return Err(MarketError::Validation(format!(
                "betting on market {} closed at {}",
                market_id, market.end_time
            )));
        }
        if amount <= 0 {
            return Err(MarketError::Validation("bet amount must be positive".into()));
        }
        if amount < self.settings.min_bet || amount > self.settings.max_bet {
            return Err(MarketError::Validation(format!(
                "bet amount must be between {} and {}",
                self.settings.min_bet, self.settings.max_bet
            )));
        }
        let (option_index, canonical) = market.canonical_option(option)?;
        let canonical = canonical.to_string();

        let available = self.balance(user_id).await?;
        if available < amount {
            return Err(MarketError::InsufficientBalance {
                user_id,
                required: amount,
                available,
            });
        }

        let lock = self.locks.for_market(market_id);
        let _guard = lock.lock().await;

        let recorded = self.store.record_bet(market_id, |market, pools| {
            if now >= market.end_time {
                return Err(MarketError::Validation(format!(
                    "betting on market {} closed at {}",
                    market.id, market.end_time
                )));
            }
            let pool = CpmmPool::new(pools.iter().map(|p| p.reserve).collect(), market.k);
            let trade = pool
                .quote_points(option_index, amount)
                .map_err(|e| MarketError::from_pricing(e, &market.id, &canonical))?;
            let bet = Bet {
                id: generate_bet_id(),
                market_id: market.id.clone(),
                user_id,
                guild_id: market.guild_id,
                option: canonical.clone(),
                amount,
                shares: trade.shares,
                price_per_share: trade.price_per_share,
                created_at: now,
            };
            Ok((bet, trade))
        });
        let (bet, trade) = match recorded {
            Ok(recorded) => recorded,
            Err(e @ MarketError::MarketState { .. }) => {
                self.locks.release(market_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.quotes.invalidate(market_id);

        let key = format!("bet:{}", bet.id);
        let debit = with_backoff(
            &self.retry,
            "debit stake",
            || self.balances.debit(user_id, amount, &key),
            PointsError::is_transient,
        )
        .await;

        if let Err(e) = debit {
            warn!(market_id, bet_id = %bet.id, user_id, error = %e, "stake debit failed, rolling back bet");
            let rollback = self.store.rollback_bet(&bet, &trade);
            self.quotes.invalidate(market_id);
            if let Err(rollback) = rollback {
                error!(
                    market_id,
                    bet_id = %bet.id,
                    user_id,
                    amount,
                    debit_error = %e,
                    error = %rollback,
                    "bet rollback failed, unpaid bet left in the ledger"
                );
                return Err(rollback);
            }
            return Err(MarketError::from_points(e, user_id));
        }

        info!(
            market_id,
            bet_id = %bet.id,
            user_id,
            option = %bet.option,
            amount,
            shares = %bet.shares,
            "bet placed"
        );
        Ok(bet)
    }

    // ========================================================================
    // END
    // ========================================================================

    /// Close betting once the end time has passed. Only the caller that
    /// performs the transition notifies the creator.
    pub async fn end_market(&self, market_id: &str) -> MarketResult<Market> {
        let now = self.clock.now();
        let current = self.store.require_market(market_id)?;
        if current.status != MarketStatus::Active {
            return Err(MarketError::state(market_id, current.status, "end"));
        }
        if now < current.end_time {
            return Err(MarketError::Validation(format!(
                "market {} is open until {}",
                market_id, current.end_time
            )));
        }

        let market = {
            let lock = self.locks.for_market(market_id);
            let _guard = lock.lock().await;
            let market = self
                .store
                .transition(market_id, MarketStatus::Active, MarketStatus::Ended, "end")?;
            self.locks.release(market_id);
            market
        };
        self.quotes.invalidate(market_id);
        info!(market_id, "betting ended");

        let window = self.settings.auto_refund_window;
        let text = format!(
            "Betting has ended for your market: '{}'. Please resolve it by voting on the winning option. \
             If not resolved within {} (by {}), all bets will be automatically refunded.",
            market.question,
            format_duration(window),
            market.refund_due_at(window).format("%Y-%m-%d %H:%M UTC")
        );
        notify::send_user(self.notifier.as_ref(), market.creator_id, &text).await;
        Ok(market)
    }

    // ========================================================================
    // VOTE & RESOLVE
    // ========================================================================

    pub fn vote(&self, market_id: &str, user_id: UserId, option: &str) -> MarketResult<ResolutionVote> {
        let market = self.store.require_market(market_id)?;
        if market.status != MarketStatus::Ended {
            return Err(MarketError::state(market_id, market.status, "vote"));
        }
        let (_, canonical) = market.canonical_option(option)?;
        let vote = ResolutionVote {
            market_id: market_id.to_string(),
            user_id,
            guild_id: market.guild_id,
            option: canonical.to_string(),
            cast_at: self.clock.now(),
        };
        self.store.upsert_vote(&vote)?;
        info!(market_id, user_id, option = %vote.option, "resolution vote cast");
        Ok(vote)
    }

    /// Vote, then resolve if the chosen option has enough votes.
    pub async fn cast_vote(&self, market_id: &str, user_id: UserId, option: &str) -> MarketResult<VoteOutcome> {
        let vote = self.vote(market_id, user_id, option)?;
        let counts = self.get_vote_counts(market_id)?;
        let votes = counts.get(&vote.option).copied().unwrap_or(0);
        if votes < self.settings.min_resolution_votes {
            return Ok(VoteOutcome::Recorded { vote, counts });
        }

        let option = vote.option.clone();
        match self.resolve(market_id, &option, user_id).await {
            Ok(report) => Ok(VoteOutcome::Resolved { vote, counts, report }),
            Err(MarketError::MarketState { .. }) => Ok(VoteOutcome::AlreadyResolved { vote, counts }),
            Err(e @ MarketError::NoWinningStake { .. }) => Ok(VoteOutcome::Stalled {
                vote,
                counts,
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn resolve(
        &self,
        market_id: &str,
        winning_option: &str,
        resolved_by: UserId,
    ) -> MarketResult<ResolutionReport> {
        let result = self.settlement.resolve(market_id, winning_option, resolved_by).await;
        self.quotes.invalidate(market_id);
        result
    }

    pub async fn refund(&self, market_id: &str) -> MarketResult<RefundReport> {
        let result = self.settlement.refund(market_id).await;
        self.quotes.invalidate(market_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StoreError;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn quote(market_id: &str, points: Points) -> MarketQuote {
        MarketQuote {
            market_id: market_id.into(),
            question: "Q".into(),
            status: MarketStatus::Active,
            end_time: Utc::now() + Duration::hours(1),
            points,
            total_wagered: 0,
            options: vec![OptionQuote {
                option: "Yes".into(),
                reserve: dec!(1000),
                potential_shares: None,
                price_per_share: None,
                probability: 0.5,
                volume_share: 0.5,
                total_wagered: 0,
            }],
        }
    }

    #[test]
    fn test_quote_cache_hit_and_invalidate() {
        let cache = QuoteCache::new(std::time::Duration::from_secs(60));
        cache.put(&quote("mkt_a", 100));
        cache.put(&quote("mkt_a", 50));
        cache.put(&quote("mkt_b", 100));

        assert!(cache.get("mkt_a", 100).is_some());
        assert!(cache.get("mkt_a", 10).is_none());

        cache.invalidate("mkt_a");
        assert!(cache.get("mkt_a", 100).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = QuoteCache::new(std::time::Duration::ZERO);
        cache.put(&quote("mkt_a", 100));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_quotes_are_swept_on_insert() {
        let cache = QuoteCache::new(std::time::Duration::from_millis(1));
        for points in 1..=500 {
            cache.put(&quote("mkt_a", points));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.put(&quote("mkt_b", 100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_quote_cache_is_bounded() {
        let cache = QuoteCache::with_capacity(std::time::Duration::from_secs(60), 3);
        for points in 1..=10 {
            cache.put(&quote("mkt_a", points));
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get("mkt_a", 10).is_some());
        assert!(cache.get("mkt_a", 1).is_none());
    }

    fn service_with(
        store: LedgerStore,
        balances: Arc<dyn BalanceService>,
        clock: Arc<crate::clock::ManualClock>,
    ) -> MarketService {
        MarketService::new(
            store,
            balances,
            Arc::new(crate::notify::LogNotifier),
            clock,
            MarketSettings::default(),
            RetrySettings::default(),
        )
    }

    fn yes_no() -> NewMarket {
        NewMarket {
            guild_id: 1,
            creator_id: 2,
            question: "Q?".into(),
            options: vec!["Yes".into(), "No".into()],
            duration: Duration::hours(1),
            category: None,
            channel_id: None,
        }
    }

    /// Wipes the pool records, then refuses the debit.
    struct PoolWipingBank {
        store: LedgerStore,
    }

    #[async_trait::async_trait]
    impl BalanceService for PoolWipingBank {
        async fn balance(&self, _user_id: UserId) -> Result<Points, PointsError> {
            Ok(1000)
        }

        async fn debit(&self, _user_id: UserId, _amount: Points, _key: &str) -> Result<Points, PointsError> {
            self.store.tree("pools").unwrap().clear().unwrap();
            Err(PointsError::Rejected("account frozen".into()))
        }

        async fn credit(&self, _user_id: UserId, _amount: Points, _key: &str) -> Result<Points, PointsError> {
            Ok(1000)
        }
    }

    #[tokio::test]
    async fn test_failed_rollback_surfaces_persistence_error() {
        let store = LedgerStore::temporary().unwrap();
        let clock = Arc::new(crate::clock::ManualClock::new(Utc::now()));
        let bank = Arc::new(PoolWipingBank { store: store.clone() });
        let service = service_with(store.clone(), bank, clock);
        let market = service.create_market(yes_no()).unwrap();

        let err = service.place_bet(&market.id, 3, "Yes", 10).await.unwrap_err();
        assert!(matches!(err, MarketError::Persistence(StoreError::Corrupt(_))), "got {:?}", err);
        assert!(!err.is_recoverable());
        // the unpaid bet stays visible for repair
        assert_eq!(store.bets(&market.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_market_lock_dropped_when_betting_ends() {
        let clock = Arc::new(crate::clock::ManualClock::new(Utc::now()));
        let service = service_with(
            LedgerStore::temporary().unwrap(),
            Arc::new(crate::points::PointsBank::new(1000)),
            clock.clone(),
        );
        let market = service.create_market(yes_no()).unwrap();

        service.place_bet(&market.id, 3, "Yes", 10).await.unwrap();
        assert_eq!(service.locks.len(), 1);

        clock.set(market.end_time);
        service.end_market(&market.id).await.unwrap();
        assert_eq!(service.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_market_locks_are_shared_per_market() {
        let locks = MarketLocks::default();
        let a1 = locks.for_market("mkt_a");
        let a2 = locks.for_market("mkt_a");
        let b = locks.for_market("mkt_b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        let _held = a1.lock().await;
        assert!(a2.try_lock().is_err());
        assert!(b.try_lock().is_ok());
    }
}
