use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};

// Prediction market records
// Markets, per-option liquidity pools, bets, votes, resolutions and payouts

pub type UserId = u64;
pub type GuildId = u64;
pub type ChannelId = u64;
/// Whole points; the currency users wager
pub type Points = i64;

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "ended")]
    Ended,
    #[serde(rename = "resolved")]
    Resolved,
    #[serde(rename = "refunded")]
    Refunded,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Ended => "ended",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Refunded => "refunded",
        }
    }

    /// Resolved and Refunded never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Resolved | MarketStatus::Refunded)
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(MarketStatus::Active),
            "ended" => Ok(MarketStatus::Ended),
            "resolved" => Ok(MarketStatus::Resolved),
            "refunded" => Ok(MarketStatus::Refunded),
            other => Err(MarketError::Validation(format!("unknown market status '{}'", other))),
        }
    }
}

// ============================================================================
// MARKET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Unique market identifier (`mkt_<16 hex>`)
    pub id: String,

    /// Community the market belongs to
    pub guild_id: GuildId,

    /// Market question
    pub question: String,

    /// Option names in display order
    pub options: Vec<String>,

    pub creator_id: UserId,

    pub category: Option<String>,

    /// Channel that receives the resolution announcement
    pub channel_id: Option<ChannelId>,

    pub created_at: DateTime<Utc>,

    /// Betting closes at this instant
    pub end_time: DateTime<Utc>,

    pub status: MarketStatus,

    /// Set only when Resolved
    pub winning_option: Option<String>,

    /// Starting reserve of every option
    pub initial_liquidity: Points,

    /// Pool invariant, initial_liquidity²
    pub k: Decimal,

    /// Points wagered across all options
    pub total_wagered: Points,
}

impl Market {
    pub fn resolved(&self) -> bool {
        self.status == MarketStatus::Resolved
    }

    pub fn refunded(&self) -> bool {
        self.status == MarketStatus::Refunded
    }

    /// Winning option, once resolved
    pub fn result(&self) -> Option<&str> {
        self.winning_option.as_deref()
    }

    /// Index of an option, matched case-insensitively after trimming.
    pub fn option_index(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        self.options.iter().position(|o| o.to_lowercase() == wanted)
    }

    /// Resolve user input to the canonical option name.
    pub fn canonical_option(&self, name: &str) -> MarketResult<(usize, &str)> {
        self.option_index(name)
            .map(|i| (i, self.options[i].as_str()))
            .ok_or_else(|| {
                MarketError::Validation(format!(
                    "'{}' is not an option of market {} (options: {})",
                    name.trim(),
                    self.id,
                    self.options.join(", ")
                ))
            })
    }

    /// Accepting bets: Active and before the end time
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == MarketStatus::Active && now < self.end_time
    }

    /// When an unresolved market becomes eligible for auto-refund
    pub fn refund_due_at(&self, window: chrono::Duration) -> DateTime<Utc> {
        self.end_time + window
    }
}

/// Remaining reserve of one option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPool {
    pub market_id: String,
    pub option: String,
    pub reserve: Decimal,
}

// ============================================================================
// BETS, VOTES, RESOLUTION
// ============================================================================

/// A purchase of option shares. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub market_id: String,
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub option: String,
    pub amount: Points,
    pub shares: Decimal,
    pub price_per_share: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One user's current resolution vote; a later vote replaces it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionVote {
    pub market_id: String,
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub option: String,
    pub cast_at: DateTime<Utc>,
}

/// Written once, together with the Ended -> Resolved transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketResolution {
    pub market_id: String,
    pub winning_option: String,
    pub resolved_by: UserId,
    pub total_pool: Points,
    pub total_winning_stake: Points,
    pub vote_count: usize,
    pub resolved_at: DateTime<Utc>,
}

/// Audit record of what one winning bet paid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub market_id: String,
    pub bet_id: String,
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub amount_bet: Points,
    pub shares: Decimal,
    pub payout: Points,
    pub paid_at: DateTime<Utc>,
}

// ============================================================================
// CREATION
// ============================================================================

/// Everything the command layer supplies to open a market
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub guild_id: GuildId,
    pub creator_id: UserId,
    pub question: String,
    pub options: Vec<String>,
    pub duration: chrono::Duration,
    pub category: Option<String>,
    pub channel_id: Option<ChannelId>,
}

pub fn generate_market_id() -> String {
    format!("mkt_{}", &Uuid::new_v4().simple().to_string()[..16])
}

pub fn generate_bet_id() -> String {
    format!("bet_{}", &Uuid::new_v4().simple().to_string()[..16])
}

/// Trim options and check count and case-insensitive uniqueness.
pub fn normalize_options(raw: &[String], max_options: usize) -> MarketResult<Vec<String>> {
    let options: Vec<String> = raw.iter().map(|o| o.trim().to_string()).collect();

    if options.len() < 2 {
        return Err(MarketError::Validation("a market needs at least two options".into()));
    }
    if options.len() > max_options {
        return Err(MarketError::Validation(format!(
            "a market can have at most {} options",
            max_options
        )));
    }
    if options.iter().any(|o| o.is_empty()) {
        return Err(MarketError::Validation("option names cannot be empty".into()));
    }
    for (i, option) in options.iter().enumerate() {
        let lower = option.to_lowercase();
        if options[..i].iter().any(|o| o.to_lowercase() == lower) {
            return Err(MarketError::Validation(format!("duplicate option '{}'", option)));
        }
    }
    Ok(options)
}

/// Parse `days,hours,minutes`. Blank fields count as zero: `1,2,30`, `,,30`, `1,,`.
pub fn parse_duration(input: &str) -> MarketResult<chrono::Duration> {
    let parts: Vec<&str> = input.split(',').collect();
    if parts.len() != 3 {
        return Err(MarketError::Validation(
            "duration must be in format: days,hours,minutes".into(),
        ));
    }

    let mut fields = [0i64; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        *field = part
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .ok_or_else(|| MarketError::Validation(format!("invalid duration field '{}'", part)))?;
    }

    let [days, hours, minutes] = fields;
    let total_minutes = days
        .checked_mul(24 * 60)
        .and_then(|d| hours.checked_mul(60).and_then(|h| d.checked_add(h)))
        .and_then(|dh| dh.checked_add(minutes))
        .ok_or_else(|| MarketError::Validation("duration is too long".into()))?;

    if total_minutes <= 0 {
        return Err(MarketError::Validation("duration must be greater than 0".into()));
    }
    Ok(chrono::Duration::minutes(total_minutes))
}

/// Human form of a duration: "1 day, 2 hours, 30 minutes".
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_minutes().max(0);
    let (days, hours, minutes) = (total / 1440, (total % 1440) / 60, total % 60);

    let mut parts = Vec::new();
    for (value, unit) in [(days, "day"), (hours, "hour"), (minutes, "minute")] {
        if value > 0 {
            parts.push(format!("{} {}{}", value, unit, if value == 1 { "" } else { "s" }));
        }
    }
    if parts.is_empty() {
        return "0 minutes".to_string();
    }
    parts.join(", ")
}
