use rust_decimal::prelude::{MathematicalOps, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CPMM CONSTANTS
// ============================================================================

// Constant Product Market Maker (CPMM) for prediction markets
//
// Formula: x * y = k (constant product)
//
// For a binary market (Yes/No):
// - x = Yes shares left in the pool
// - y = No shares left in the pool
// - k = initial_liquidity² (fixed when the market is created)
//
// Buying Yes with `p` points adds `p` to the No reserve and removes whatever
// Yes shares keep `x * y == k`.

/// Shares and reserves are kept to this many decimal places (truncated).
pub const SHARE_DECIMALS: u32 = 8;

// ============================================================================
// PRICING ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricingError {
    /// Points or shares requested were zero or negative
    NonPositiveAmount,
    /// The trade would yield no shares (bet too small or pool drained)
    InsufficientLiquidity,
    /// Buying that many shares would empty the reserve
    InfinitePrice,
    /// Outcome index outside the pool
    UnknownOutcome(usize),
    /// Arithmetic left the representable range
    Overflow,
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingError::NonPositiveAmount => write!(f, "amount must be positive"),
            PricingError::InsufficientLiquidity => write!(f, "insufficient liquidity for this trade"),
            PricingError::InfinitePrice => write!(f, "not enough shares in the pool"),
            PricingError::UnknownOutcome(i) => write!(f, "unknown outcome index {}", i),
            PricingError::Overflow => write!(f, "arithmetic overflow while pricing"),
        }
    }
}

impl std::error::Error for PricingError {}

pub type PricingResult<T> = Result<T, PricingError>;

fn truncate_shares(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SHARE_DECIMALS, RoundingStrategy::ToZero)
}

// ============================================================================
// PAIR FORMULAS
// ============================================================================

/// Shares of the chosen option bought by spending `points`.
///
/// `new_other = other + points`, `new_chosen = k / new_other`,
/// `shares = chosen - new_chosen` truncated to [`SHARE_DECIMALS`].
pub fn shares_for_points(
    reserve_chosen: Decimal,
    reserve_other: Decimal,
    k: Decimal,
    points: Decimal,
) -> PricingResult<Decimal> {
    if points <= Decimal::ZERO {
        return Err(PricingError::NonPositiveAmount);
    }
    let new_other = reserve_other
        .checked_add(points)
        .ok_or(PricingError::Overflow)?;
    let new_chosen = k
        .checked_div(new_other)
        .ok_or(PricingError::InsufficientLiquidity)?;
    let shares = truncate_shares(reserve_chosen - new_chosen);
    if shares <= Decimal::ZERO {
        return Err(PricingError::InsufficientLiquidity);
    }
    Ok(shares)
}

/// Points needed to buy `shares` of the chosen option.
///
/// Undefined (infinite) once the purchase would take the whole reserve.
pub fn points_for_shares(
    reserve_chosen: Decimal,
    reserve_other: Decimal,
    k: Decimal,
    shares: Decimal,
) -> PricingResult<Decimal> {
    if shares <= Decimal::ZERO {
        return Err(PricingError::NonPositiveAmount);
    }
    let new_chosen = reserve_chosen - shares;
    if new_chosen <= Decimal::ZERO {
        return Err(PricingError::InfinitePrice);
    }
    let new_other = k.checked_div(new_chosen).ok_or(PricingError::Overflow)?;
    Ok((new_other - reserve_other).max(Decimal::ZERO))
}

// ============================================================================
// POOL
// ============================================================================

/// Result of pricing a bet against a pool, before it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub outcome: usize,
    pub points: Decimal,
    pub shares: Decimal,
    pub price_per_share: Decimal,
    /// Signed change to every reserve, indexed like the pool
    pub deltas: Vec<Decimal>,
}

/// Reserves for every option of one market.
///
/// Two options use the pair formulas above with the market's stored `k`.
/// With three or more options the pool preserves the product of *all*
/// reserves: points are spread over the other reserves in proportion to
/// their size, so each grows by the same factor `(S + a) / S`, and the chosen
/// reserve shrinks to `R_i * (S / (S + a))^(n-1)`. For `n = 2` both schemes
/// coincide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpmmPool {
    pub reserves: Vec<Decimal>,
    pub k: Decimal,
}

impl CpmmPool {
    /// Fresh pool with every option at `initial_liquidity` and `k = L²`.
    pub fn seeded(initial_liquidity: i64, outcomes: usize) -> PricingResult<Self> {
        if initial_liquidity <= 0 {
            return Err(PricingError::NonPositiveAmount);
        }
        let liquidity = Decimal::from(initial_liquidity);
        let k = liquidity.checked_mul(liquidity).ok_or(PricingError::Overflow)?;
        Ok(Self {
            reserves: vec![liquidity; outcomes],
            k,
        })
    }

    pub fn new(reserves: Vec<Decimal>, k: Decimal) -> Self {
        Self { reserves, k }
    }

    pub fn outcomes(&self) -> usize {
        self.reserves.len()
    }

    fn reserve(&self, outcome: usize) -> PricingResult<Decimal> {
        self.reserves
            .get(outcome)
            .copied()
            .ok_or(PricingError::UnknownOutcome(outcome))
    }

    fn others_total(&self, outcome: usize) -> Decimal {
        self.reserves
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != outcome)
            .map(|(_, r)| *r)
            .sum()
    }

    /// Price a bet of `points` on `outcome` without touching the pool.
    pub fn quote_points(&self, outcome: usize, points: i64) -> PricingResult<Trade> {
        let chosen = self.reserve(outcome)?;
        let amount = Decimal::from(points);
        if amount <= Decimal::ZERO {
            return Err(PricingError::NonPositiveAmount);
        }

        let mut deltas = vec![Decimal::ZERO; self.outcomes()];
        let shares = if self.outcomes() == 2 {
            let other = 1 - outcome;
            let shares = shares_for_points(chosen, self.reserves[other], self.k, amount)?;
            deltas[other] = amount;
            shares
        } else {
            let others = self.others_total(outcome);
            if others <= Decimal::ZERO {
                return Err(PricingError::InsufficientLiquidity);
            }
            let ratio = others
                .checked_div(others + amount)
                .ok_or(PricingError::Overflow)?;
            let factor = ratio
                .checked_powi((self.outcomes() - 1) as i64)
                .ok_or(PricingError::Overflow)?;
            let shares = truncate_shares(chosen - chosen * factor);
            if shares <= Decimal::ZERO {
                return Err(PricingError::InsufficientLiquidity);
            }

            // Spread the points pro rata; the last reserve takes the remainder
            let mut spread = Decimal::ZERO;
            let last_other = (0..self.outcomes()).rev().find(|i| *i != outcome);
            for (i, reserve) in self.reserves.iter().enumerate() {
                if i == outcome || Some(i) == last_other {
                    continue;
                }
                let share = amount * *reserve / others;
                deltas[i] = share;
                spread += share;
            }
            if let Some(last) = last_other {
                deltas[last] = amount - spread;
            }
            shares
        };

        deltas[outcome] = -shares;
        Ok(Trade {
            outcome,
            points: amount,
            shares,
            price_per_share: amount / shares,
            deltas,
        })
    }

    /// Points it would cost to buy `shares` of `outcome` right now.
    pub fn cost_of_shares(&self, outcome: usize, shares: Decimal) -> PricingResult<Decimal> {
        let chosen = self.reserve(outcome)?;
        if self.outcomes() == 2 {
            return points_for_shares(chosen, self.reserves[1 - outcome], self.k, shares);
        }
        if shares <= Decimal::ZERO {
            return Err(PricingError::NonPositiveAmount);
        }
        let remaining = chosen - shares;
        if remaining <= Decimal::ZERO {
            return Err(PricingError::InfinitePrice);
        }
        let others = self.others_total(outcome);
        let growth = chosen.checked_div(remaining).ok_or(PricingError::Overflow)?;
        let exponent = Decimal::ONE / Decimal::from(self.outcomes() as i64 - 1);
        let scale = growth.checked_powd(exponent).ok_or(PricingError::Overflow)?;
        Ok((others * (scale - Decimal::ONE)).max(Decimal::ZERO))
    }

    pub fn apply(&mut self, trade: &Trade) {
        for (reserve, delta) in self.reserves.iter_mut().zip(&trade.deltas) {
            *reserve += *delta;
        }
    }

    /// Undo a previously applied trade.
    pub fn revert(&mut self, trade: &Trade) {
        for (reserve, delta) in self.reserves.iter_mut().zip(&trade.deltas) {
            *reserve -= *delta;
        }
    }

    /// AMM marginal price of each option (sums to 1.0). Display only.
    ///
    /// Binary: `price(i) = R_other / (R_i + R_other)`.
    pub fn marginal_prices(&self) -> Vec<f64> {
        let n = self.outcomes();
        let inverse: Vec<f64> = self
            .reserves
            .iter()
            .map(|r| match r.to_f64() {
                Some(v) if v > 0.0 => 1.0 / v,
                _ => 0.0,
            })
            .collect();
        let total: f64 = inverse.iter().sum();
        if total <= 0.0 {
            return vec![1.0 / n as f64; n];
        }
        inverse.iter().map(|v| v / total).collect()
    }

    /// For two options: `k <= x*y < k + (x+y)·10⁻⁸`. Larger pools only need
    /// every reserve to stay positive.
    pub fn holds_invariant(&self) -> bool {
        if self.reserves.iter().any(|r| *r <= Decimal::ZERO) {
            return false;
        }
        if self.outcomes() != 2 {
            return true;
        }
        let (x, y) = (self.reserves[0], self.reserves[1]);
        let product = match x.checked_mul(y) {
            Some(p) => p,
            None => return false,
        };
        // Decimal division rounds at the 28th digit; allow for that too
        let slack = Decimal::new(1, 12);
        let tolerance = (x + y) * Decimal::new(1, SHARE_DECIMALS) + slack;
        product >= self.k - slack && product - self.k <= tolerance
    }
}

/// Volume-based probability: each option's share of all points wagered.
/// Equal split when nothing has been wagered yet. Display only.
pub fn volume_shares(option_totals: &[i64]) -> Vec<f64> {
    let n = option_totals.len().max(1);
    let total: i64 = option_totals.iter().sum();
    if total <= 0 {
        return vec![1.0 / n as f64; option_totals.len()];
    }
    option_totals
        .iter()
        .map(|t| *t as f64 / total as f64)
        .collect()
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_pool_binary() {
        let pool = CpmmPool::seeded(1000, 2).unwrap();
        assert_eq!(pool.reserves, vec![dec!(1000), dec!(1000)]);
        assert_eq!(pool.k, dec!(1000000));
        assert!(pool.holds_invariant());
    }

    #[test]
    fn test_reference_scenario_bet_100_on_yes() {
        let pool = CpmmPool::seeded(1000, 2).unwrap();
        let trade = pool.quote_points(0, 100).unwrap();

        assert_eq!(trade.shares, dec!(90.90909090));
        assert!((trade.price_per_share - dec!(1.1)).abs() < dec!(0.0001));
        assert_eq!(trade.deltas, vec![dec!(-90.90909090), dec!(100)]);

        let mut after = pool.clone();
        after.apply(&trade);
        assert_eq!(after.reserves[1], dec!(1100));
        assert!((after.reserves[0] - dec!(909.0909)).abs() < dec!(0.0001));
        assert!(after.holds_invariant());
    }

    #[test]
    fn test_pair_formula_matches_pool() {
        let shares = shares_for_points(dec!(1000), dec!(1000), dec!(1000000), dec!(100)).unwrap();
        assert_eq!(shares, dec!(90.90909090));
    }

    #[test]
    fn test_invariant_survives_many_bets() {
        let mut pool = CpmmPool::seeded(1000, 2).unwrap();
        for (i, points) in [100, 7, 250, 1, 3333, 42, 900].iter().enumerate() {
            let trade = pool.quote_points(i % 2, *points).unwrap();
            pool.apply(&trade);
            assert!(pool.holds_invariant(), "invariant broken after bet {}", i);
        }
    }

    #[test]
    fn test_swap_moves_price() {
        let mut pool = CpmmPool::seeded(1000, 2).unwrap();
        let before = pool.marginal_prices();
        assert!((before[0] - 0.5).abs() < 1e-9);

        let trade = pool.quote_points(0, 100).unwrap();
        pool.apply(&trade);
        let after = pool.marginal_prices();

        assert!(after[0] > before[0]);
        assert!(after[1] < before[1]);
        assert!((after[0] + after[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_price_impact_increases_with_size() {
        let pool = CpmmPool::seeded(1000, 2).unwrap();
        let small = pool.quote_points(0, 10).unwrap();
        let large = pool.quote_points(0, 500).unwrap();
        assert!(large.price_per_share > small.price_per_share);
    }

    #[test]
    fn test_non_positive_bet_rejected() {
        let pool = CpmmPool::seeded(1000, 2).unwrap();
        assert_eq!(pool.quote_points(0, 0), Err(PricingError::NonPositiveAmount));
        assert_eq!(pool.quote_points(0, -5), Err(PricingError::NonPositiveAmount));
    }

    #[test]
    fn test_drained_pool_reports_insufficient_liquidity() {
        // Chosen reserve already far below k / other: nothing left to sell
        let result = shares_for_points(dec!(0.00000001), dec!(1000000), dec!(1000000), dec!(1));
        assert_eq!(result, Err(PricingError::InsufficientLiquidity));
    }

    #[test]
    fn test_points_for_shares_inverts_shares_for_points() {
        let k = dec!(1000000);
        let cost = points_for_shares(dec!(1000), dec!(1000), k, dec!(90.90909090)).unwrap();
        assert!((cost - dec!(100)).abs() < dec!(0.00001));
    }

    #[test]
    fn test_cannot_buy_whole_reserve() {
        let pool = CpmmPool::seeded(1000, 2).unwrap();
        assert_eq!(pool.cost_of_shares(0, dec!(1000)), Err(PricingError::InfinitePrice));
        assert_eq!(pool.cost_of_shares(0, dec!(1500)), Err(PricingError::InfinitePrice));
    }

    #[test]
    fn test_unknown_outcome() {
        let pool = CpmmPool::seeded(1000, 2).unwrap();
        assert_eq!(pool.quote_points(5, 10), Err(PricingError::UnknownOutcome(5)));
    }

    #[test]
    fn test_multi_outcome_preserves_product() {
        let mut pool = CpmmPool::seeded(100, 3).unwrap();
        let before: Decimal = pool.reserves.iter().product();

        let trade = pool.quote_points(1, 30).unwrap();
        assert_eq!(trade.deltas.iter().filter(|d| **d > Decimal::ZERO).sum::<Decimal>(), dec!(30));
        pool.apply(&trade);

        let after: Decimal = pool.reserves.iter().product();
        // Truncating shares can only leave the pool slightly richer
        assert!(after >= before - dec!(0.0001));
        assert!((after - before) / before < dec!(0.000001));
        assert!(pool.holds_invariant());

        let prices = pool.marginal_prices();
        assert!(prices[1] > prices[0] && prices[1] > prices[2]);
        assert!((prices.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_multi_outcome_cost_roundtrip() {
        let pool = CpmmPool::seeded(1000, 4).unwrap();
        let trade = pool.quote_points(2, 250).unwrap();
        let cost = pool.cost_of_shares(2, trade.shares).unwrap();
        assert!((cost - dec!(250)).abs() < dec!(0.01));
    }

    #[test]
    fn test_revert_restores_reserves() {
        let mut pool = CpmmPool::seeded(1000, 3).unwrap();
        let original = pool.clone();
        let trade = pool.quote_points(0, 123).unwrap();
        pool.apply(&trade);
        pool.revert(&trade);
        assert_eq!(pool, original);
    }

    #[test]
    fn test_volume_shares() {
        assert_eq!(volume_shares(&[0, 0]), vec![0.5, 0.5]);
        let shares = volume_shares(&[100, 50, 50]);
        assert!((shares[0] - 0.5).abs() < 1e-9);
        assert!((shares[2] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_seeding_rejects_unrepresentable_liquidity() {
        assert_eq!(CpmmPool::seeded(1_000_000_000_000_000, 2), Err(PricingError::Overflow));
        assert_eq!(CpmmPool::seeded(0, 2), Err(PricingError::NonPositiveAmount));
        assert_eq!(CpmmPool::seeded(1_000_000_000, 2).unwrap().k, dec!(1000000000000000000));
    }
}
