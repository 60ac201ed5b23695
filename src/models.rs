// Request and response bodies for the HTTP command layer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::market_resolve::markets::{
    parse_duration, ChannelId, GuildId, Market, MarketResolution, NewMarket, Payout, Points,
    UserId,
};
use crate::error::{MarketError, MarketResult};

/// Default spend shown by `GET /markets/:id/quote` when `points` is omitted
pub const DEFAULT_QUOTE_POINTS: Points = 100;

/// Options as a JSON list or a comma-separated string ("Yes, No, Maybe")
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OptionList {
    List(Vec<String>),
    Csv(String),
}

impl OptionList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OptionList::List(options) => options,
            OptionList::Csv(raw) => raw.split(',').map(|o| o.trim().to_string()).collect(),
        }
    }
}

/// POST /markets request body
///
/// ```json
/// {
///   "guild_id": 1234,
///   "creator_id": 42,
///   "question": "Will it rain on Friday?",
///   "options": ["Yes", "No"],
///   "duration": "1,2,30",
///   "category": "weather",
///   "channel_id": 555
/// }
/// ```
///
/// `duration` is `days,hours,minutes`; `duration_minutes` may be given instead.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMarketRequest {
    pub guild_id: GuildId,
    pub creator_id: UserId,
    pub question: String,
    pub options: OptionList,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
}

impl CreateMarketRequest {
    pub fn into_new_market(self) -> MarketResult<NewMarket> {
        let duration = match (self.duration.as_deref(), self.duration_minutes) {
            (Some(text), _) => parse_duration(text)?,
            (None, Some(minutes)) if minutes > 0 => chrono::Duration::minutes(minutes),
            (None, Some(_)) => {
                return Err(MarketError::Validation("duration must be greater than 0".into()))
            }
            (None, None) => {
                return Err(MarketError::Validation(
                    "duration is required (days,hours,minutes)".into(),
                ))
            }
        };
        Ok(NewMarket {
            guild_id: self.guild_id,
            creator_id: self.creator_id,
            question: self.question,
            options: self.options.into_vec(),
            duration,
            category: self.category,
            channel_id: self.channel_id,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsQuery {
    pub guild_id: Option<GuildId>,
    pub status: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoriesQuery {
    pub guild_id: GuildId,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BetsQuery {
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteQuery {
    pub points: Option<Points>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceBetRequest {
    pub user_id: UserId,
    pub option: String,
    pub amount: Points,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteRequest {
    pub user_id: UserId,
    pub option: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub option: String,
    pub resolved_by: UserId,
}

/// Market with its derived flags and current vote tally
#[derive(Debug, Clone, Serialize)]
pub struct MarketDetail {
    #[serde(flatten)]
    pub market: Market,
    pub resolved: bool,
    pub refunded: bool,
    pub result: Option<String>,
    pub votes: BTreeMap<String, usize>,
}

impl MarketDetail {
    pub fn new(market: Market, votes: BTreeMap<String, usize>) -> Self {
        Self {
            resolved: market.resolved(),
            refunded: market.refunded(),
            result: market.result().map(str::to_string),
            market,
            votes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionDetail {
    pub resolution: Option<MarketResolution>,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: Points,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_accept_list_or_csv() {
        let req: CreateMarketRequest = serde_json::from_value(serde_json::json!({
            "guild_id": 1,
            "creator_id": 2,
            "question": "Q?",
            "options": "Yes, No , Maybe",
            "duration": ",,30"
        }))
        .unwrap();
        let new = req.into_new_market().unwrap();
        assert_eq!(new.options, vec!["Yes", "No", "Maybe"]);
        assert_eq!(new.duration, chrono::Duration::minutes(30));
    }

    #[test]
    fn test_duration_minutes_fallback() {
        let req: CreateMarketRequest = serde_json::from_value(serde_json::json!({
            "guild_id": 1,
            "creator_id": 2,
            "question": "Q?",
            "options": ["A", "B"],
            "duration_minutes": 90
        }))
        .unwrap();
        assert_eq!(req.into_new_market().unwrap().duration, chrono::Duration::minutes(90));
    }

    #[test]
    fn test_missing_duration_is_rejected() {
        let req: CreateMarketRequest = serde_json::from_value(serde_json::json!({
            "guild_id": 1,
            "creator_id": 2,
            "question": "Q?",
            "options": ["A", "B"]
        }))
        .unwrap();
        assert!(req.into_new_market().is_err());
    }
}
