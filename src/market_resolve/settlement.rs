// ============================================================================
// Settlement Engine - pari-mutuel payouts and refunds
// ============================================================================
//
// Resolution claims the market first (Ended -> Resolved, in one storage
// transaction with the resolution row) and only then pays. Whoever loses the
// claim never moves a single point, so a market cannot be paid out twice.
//
// If a credit fails part way, everything already paid is debited back and
// the claim is released so the market can be resolved (or refunded) later.
// Each attempt carries its own settlement id in the idempotency keys, so a
// later attempt is not mistaken for a replay of a reversed one.
//
// ============================================================================

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::RetrySettings;
use crate::error::{MarketError, MarketResult};
use crate::ledger::LedgerStore;
use crate::market_resolve::markets::{
    Bet, Market, MarketResolution, MarketStatus, Payout, Points, UserId,
};
use crate::notify::{self, Notifier};
use crate::points::{BalanceService, PointsError};
use crate::retry::with_backoff;

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionReport {
    pub market_id: String,
    pub question: String,
    pub winning_option: String,
    pub total_pool: Points,
    pub total_winning_stake: Points,
    pub vote_count: usize,
    pub payouts: Vec<Payout>,
    pub total_paid: Points,
    pub losing_bets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refund {
    pub user_id: UserId,
    pub amount: Points,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundReport {
    pub market_id: String,
    pub question: String,
    pub refunds: Vec<Refund>,
    pub total_refunded: Points,
}

/// `floor(amount * pool / winning_stake)`, computed in i128.
pub fn pari_mutuel_share(amount: Points, total_pool: Points, winning_stake: Points) -> Points {
    if winning_stake <= 0 || amount <= 0 || total_pool <= 0 {
        return 0;
    }
    let share = (amount as i128 * total_pool as i128) / winning_stake as i128;
    share.min(total_pool as i128) as Points
}

fn settlement_id() -> String {
    format!("stl_{}", &Uuid::new_v4().simple().to_string()[..8])
}

pub struct SettlementEngine {
    store: LedgerStore,
    balances: Arc<dyn BalanceService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    min_resolution_votes: usize,
    retry: RetrySettings,
}

impl SettlementEngine {
    pub fn new(
        store: LedgerStore,
        balances: Arc<dyn BalanceService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        min_resolution_votes: usize,
        retry: RetrySettings,
    ) -> Self {
        Self {
            store,
            balances,
            notifier,
            clock,
            min_resolution_votes,
            retry,
        }
    }

    async fn credit(&self, user_id: UserId, amount: Points, key: &str) -> Result<Points, PointsError> {
        with_backoff(
            &self.retry,
            "credit",
            || self.balances.credit(user_id, amount, key),
            PointsError::is_transient,
        )
        .await
    }

    async fn debit(&self, user_id: UserId, amount: Points, key: &str) -> Result<Points, PointsError> {
        with_backoff(
            &self.retry,
            "debit",
            || self.balances.debit(user_id, amount, key),
            PointsError::is_transient,
        )
        .await
    }

    // ========================================================================
    // RESOLVE
    // ========================================================================

    pub async fn resolve(
        &self,
        market_id: &str,
        winning_option: &str,
        resolved_by: UserId,
    ) -> MarketResult<ResolutionReport> {
        let market = self.store.require_market(market_id)?;
        if market.status != MarketStatus::Ended {
            return Err(MarketError::state(market_id, market.status, "resolve"));
        }
        let winner = market.canonical_option(winning_option)?.1.to_string();

        let vote_count = self
            .store
            .vote_tally(market_id)?
            .get(&winner)
            .copied()
            .unwrap_or(0);
        if vote_count < self.min_resolution_votes {
            return Err(MarketError::VoteThreshold {
                option: winner,
                votes: vote_count,
                required: self.min_resolution_votes,
            });
        }

        let bets = self.store.bets(market_id)?;
        let (winning, losing): (Vec<&Bet>, Vec<&Bet>) = bets.iter().partition(|b| b.option == winner);
        let total_pool = market.total_wagered;
        let total_winning_stake: Points = winning.iter().map(|b| b.amount).sum();
        if total_winning_stake <= 0 {
            return Err(MarketError::NoWinningStake {
                market_id: market_id.to_string(),
                option: winner,
            });
        }

        let resolution = MarketResolution {
            market_id: market_id.to_string(),
            winning_option: winner.clone(),
            resolved_by,
            total_pool,
            total_winning_stake,
            vote_count,
            resolved_at: self.clock.now(),
        };
        let (market, claimed) = self.store.claim_resolution(&resolution, self.min_resolution_votes)?;
        let vote_count = claimed.vote_count;
        info!(
            market_id,
            winning_option = %winner,
            total_pool,
            total_winning_stake,
            vote_count,
            winners = winning.len(),
            "market resolution claimed"
        );

        let attempt = settlement_id();
        let mut paid: Vec<Payout> = Vec::with_capacity(winning.len());
        for bet in &winning {
            let payout = Payout {
                market_id: market_id.to_string(),
                bet_id: bet.id.clone(),
                user_id: bet.user_id,
                guild_id: bet.guild_id,
                amount_bet: bet.amount,
                shares: bet.shares,
                payout: pari_mutuel_share(bet.amount, total_pool, total_winning_stake),
                paid_at: self.clock.now(),
            };

            if payout.payout > 0 {
                let key = format!("payout:{}:{}:{}", market_id, bet.id, attempt);
                if let Err(e) = self.credit(bet.user_id, payout.payout, &key).await {
                    error!(market_id, bet_id = %bet.id, error = %e, "payout credit failed, unwinding resolution");
                    self.unwind_resolution(market_id, &paid, &attempt).await;
                    return Err(MarketError::ExternalService(format!(
                        "payout to user {} failed: {}",
                        bet.user_id, e
                    )));
                }
            }
            paid.push(payout.clone());

            if let Err(e) = self.store.record_payout(&payout) {
                error!(market_id, bet_id = %bet.id, error = %e, "payout record failed, unwinding resolution");
                self.unwind_resolution(market_id, &paid, &attempt).await;
                return Err(e);
            }
        }

        let total_paid: Points = paid.iter().map(|p| p.payout).sum();
        info!(market_id, total_paid, total_pool, "market resolved");

        self.announce_resolution(&market, &winner, &paid, &losing).await;

        Ok(ResolutionReport {
            market_id: market_id.to_string(),
            question: market.question.clone(),
            winning_option: winner,
            total_pool,
            total_winning_stake,
            vote_count,
            payouts: paid,
            total_paid,
            losing_bets: losing.len(),
        })
    }

    /// Debit back what was credited and return the market to Ended.
    async fn unwind_resolution(&self, market_id: &str, paid: &[Payout], attempt: &str) {
        for payout in paid.iter().filter(|p| p.payout > 0) {
            let key = format!("payout-reversal:{}:{}:{}", market_id, payout.bet_id, attempt);
            if let Err(e) = self.debit(payout.user_id, payout.payout, &key).await {
                error!(
                    market_id,
                    user_id = payout.user_id,
                    amount = payout.payout,
                    error = %e,
                    "could not reverse payout"
                );
            }
        }
        match self.store.release_resolution(market_id) {
            Ok(_) => warn!(market_id, reversed = paid.len(), "resolution released, market back to ended"),
            Err(e) => error!(market_id, error = %e, "could not release resolution"),
        }
    }

    async fn announce_resolution(&self, market: &Market, winner: &str, paid: &[Payout], losing: &[&Bet]) {
        let notifier = self.notifier.as_ref();
        for payout in paid {
            let text = format!(
                "You won {} Points on '{}'! Your Bet: {} → Payout: {}",
                payout.payout, market.question, payout.amount_bet, payout.payout
            );
            notify::send_user(notifier, payout.user_id, &text).await;
        }
        for bet in losing {
            let text = format!(
                "You lost your bet of {} Points on '{}'. The winning option was: '{}'.",
                bet.amount, market.question, winner
            );
            notify::send_user(notifier, bet.user_id, &text).await;
        }
        if let Some(channel_id) = market.channel_id {
            let text = format!(
                "Market resolved! '{}' The winning option is: {}",
                market.question, winner
            );
            notify::send_channel(notifier, channel_id, &text).await;
        }
    }

    // ========================================================================
    // REFUND
    // ========================================================================

    /// Return every stake of an Ended market and mark it Refunded.
    pub async fn refund(&self, market_id: &str) -> MarketResult<RefundReport> {
        let market = self.store.require_market(market_id)?;
        if market.status != MarketStatus::Ended {
            return Err(MarketError::state(market_id, market.status, "refund"));
        }

        let mut stakes: BTreeMap<UserId, Points> = BTreeMap::new();
        for bet in self.store.bets(market_id)? {
            *stakes.entry(bet.user_id).or_insert(0) += bet.amount;
        }

        let market = self
            .store
            .transition(market_id, MarketStatus::Ended, MarketStatus::Refunded, "refund")?;

        let attempt = settlement_id();
        let mut refunds: Vec<Refund> = Vec::with_capacity(stakes.len());
        for (user_id, amount) in stakes.into_iter().filter(|(_, amount)| *amount > 0) {
            let key = format!("refund:{}:{}:{}", market_id, user_id, attempt);
            if let Err(e) = self.credit(user_id, amount, &key).await {
                error!(market_id, user_id, error = %e, "refund credit failed, unwinding refund");
                self.unwind_refund(market_id, &refunds, &attempt).await;
                return Err(MarketError::ExternalService(format!(
                    "refund to user {} failed: {}",
                    user_id, e
                )));
            }
            refunds.push(Refund { user_id, amount });
        }

        let total_refunded: Points = refunds.iter().map(|r| r.amount).sum();
        info!(market_id, users = refunds.len(), total_refunded, "market refunded");

        for refund in &refunds {
            let text = format!(
                "Your bet of {} Points has been refunded for the expired market: '{}'",
                refund.amount, market.question
            );
            notify::send_user(self.notifier.as_ref(), refund.user_id, &text).await;
        }

        Ok(RefundReport {
            market_id: market_id.to_string(),
            question: market.question,
            refunds,
            total_refunded,
        })
    }

    async fn unwind_refund(&self, market_id: &str, refunds: &[Refund], attempt: &str) {
        for refund in refunds {
            let key = format!("refund-reversal:{}:{}:{}", market_id, refund.user_id, attempt);
            if let Err(e) = self.debit(refund.user_id, refund.amount, &key).await {
                error!(market_id, user_id = refund.user_id, error = %e, "could not reverse refund");
            }
        }
        if let Err(e) = self.store.transition(
            market_id,
            MarketStatus::Refunded,
            MarketStatus::Ended,
            "release refund",
        ) {
            error!(market_id, error = %e, "could not release refund");
        }
    }
}
