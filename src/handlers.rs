// HTTP request handlers for the prediction market ledger

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::app_state::SharedState;
use crate::error::MarketError;
use crate::market_resolve::lifecycle::{MarketFilter, MarketQuote, OptionPosition, VoteOutcome};
use crate::market_resolve::markets::{Bet, Market, MarketStatus, UserId};
use crate::market_resolve::settlement::{RefundReport, ResolutionReport};
use crate::models::*;

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Map a lifecycle error onto a status code and a JSON error body.
pub fn api_error(err: MarketError) -> ApiError {
    let (status, kind) = match &err {
        MarketError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        MarketError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        MarketError::InsufficientLiquidity { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_liquidity"),
        MarketError::InsufficientBalance { .. } => (StatusCode::PAYMENT_REQUIRED, "insufficient_balance"),
        MarketError::MarketState { .. } => (StatusCode::CONFLICT, "market_state"),
        MarketError::VoteThreshold { .. } => (StatusCode::CONFLICT, "vote_threshold"),
        MarketError::NoWinningStake { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "no_winning_stake"),
        MarketError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
        MarketError::ExternalService(_) => (StatusCode::BAD_GATEWAY, "external_service"),
    };
    if !err.is_recoverable() {
        error!(error = %err, "request failed");
    }
    (
        status,
        Json(json!({
            "success": false,
            "kind": kind,
            "error": err.to_string(),
        })),
    )
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        // Health
        .route("/", get(health_check))
        .route("/health", get(health_check))
        // Markets
        .route("/markets", get(list_markets).post(create_market))
        .route("/categories", get(list_categories))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/quote", get(get_quote))
        .route("/markets/:id/bets", get(get_bets).post(place_bet))
        .route("/markets/:id/options/:option/positions", get(get_option_positions))
        .route("/markets/:id/end", post(end_market))
        .route("/markets/:id/votes", get(get_votes).post(cast_vote))
        .route("/markets/:id/resolve", post(resolve_market))
        .route("/markets/:id/refund", post(refund_market))
        .route("/markets/:id/resolution", get(get_resolution))
        // Balances
        .route("/balance/:user_id", get(get_balance))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ===== HEALTH =====

pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "prediction-market-ledger",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
    }))
}

// ===== MARKETS =====

pub async fn create_market(
    State(state): State<SharedState>,
    Json(request): Json<CreateMarketRequest>,
) -> Result<(StatusCode, Json<Market>), ApiError> {
    let new_market = request.into_new_market().map_err(api_error)?;
    let market = state.markets.create_market(new_market).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(market)))
}

fn parse_status(status: Option<&str>) -> Result<Option<MarketStatus>, ApiError> {
    status.map(str::parse::<MarketStatus>).transpose().map_err(api_error)
}

pub async fn list_markets(
    State(state): State<SharedState>,
    Query(query): Query<MarketsQuery>,
) -> ApiResult<Vec<Market>> {
    let filter = MarketFilter {
        guild_id: query.guild_id,
        status: parse_status(query.status.as_deref())?,
        category: query.category.filter(|c| !c.trim().is_empty()),
    };
    state.markets.find_markets(&filter).map(Json).map_err(api_error)
}

pub async fn list_categories(
    State(state): State<SharedState>,
    Query(query): Query<CategoriesQuery>,
) -> ApiResult<Vec<String>> {
    let status = parse_status(query.status.as_deref())?;
    state.markets.categories(query.guild_id, status).map(Json).map_err(api_error)
}

pub async fn get_market(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<MarketDetail> {
    let market = state.markets.market(&id).map_err(api_error)?;
    let votes = state.markets.get_vote_counts(&id).map_err(api_error)?;
    Ok(Json(MarketDetail::new(market, votes)))
}

pub async fn get_quote(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<QuoteQuery>,
) -> ApiResult<MarketQuote> {
    let points = query.points.unwrap_or(DEFAULT_QUOTE_POINTS);
    state.markets.quote(&id, points).map(Json).map_err(api_error)
}

pub async fn end_market(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Market> {
    state.markets.end_market(&id).await.map(Json).map_err(api_error)
}

// ===== BETS =====

pub async fn place_bet(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<PlaceBetRequest>,
) -> Result<(StatusCode, Json<Bet>), ApiError> {
    let bet = state
        .markets
        .place_bet(&id, request.user_id, &request.option, request.amount)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(bet)))
}

pub async fn get_bets(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<BetsQuery>,
) -> ApiResult<Vec<Bet>> {
    match query.user_id {
        Some(user_id) => state.markets.bets_for_user(&id, user_id),
        None => state.markets.bets(&id),
    }
    .map(Json)
    .map_err(api_error)
}

pub async fn get_option_positions(
    State(state): State<SharedState>,
    Path((id, option)): Path<(String, String)>,
) -> ApiResult<Vec<OptionPosition>> {
    state.markets.option_positions(&id, &option).map(Json).map_err(api_error)
}

// ===== VOTING & SETTLEMENT =====

pub async fn cast_vote(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> ApiResult<VoteOutcome> {
    state
        .markets
        .cast_vote(&id, request.user_id, &request.option)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn get_votes(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<BTreeMap<String, usize>> {
    state.markets.get_vote_counts(&id).map(Json).map_err(api_error)
}

pub async fn resolve_market(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<ResolutionReport> {
    state
        .markets
        .resolve(&id, &request.option, request.resolved_by)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn refund_market(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<RefundReport> {
    state.markets.refund(&id).await.map(Json).map_err(api_error)
}

pub async fn get_resolution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<ResolutionDetail> {
    let resolution = state.markets.resolution(&id).map_err(api_error)?;
    let payouts = state.markets.payouts(&id).map_err(api_error)?;
    Ok(Json(ResolutionDetail { resolution, payouts }))
}

// ===== BALANCES =====

pub async fn get_balance(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<BalanceResponse> {
    let balance = state.markets.balance(user_id).await.map_err(api_error)?;
    Ok(Json(BalanceResponse { user_id, balance }))
}
