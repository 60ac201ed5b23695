mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::*;
use prediction_market_ledger::ledger::LedgerStore;
use prediction_market_ledger::{handlers, AppState, ManualClock, MemoryNotifier, PointsBank};

struct Api {
    app: Router,
    clock: Arc<ManualClock>,
}

fn api() -> Api {
    let clock = Arc::new(ManualClock::new(start_time()));
    let state = AppState::with_parts(
        LedgerStore::temporary().unwrap(),
        Arc::new(PointsBank::new(STARTING_BALANCE)),
        Arc::new(MemoryNotifier::new()),
        clock.clone(),
        settings(),
        fast_retry(),
    );
    Api {
        app: handlers::router(Arc::new(state)),
        clock,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_market(app: &Router) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/markets",
        Some(json!({
            "guild_id": GUILD,
            "creator_id": CREATOR,
            "question": "Will it rain on Friday?",
            "options": "Yes, No",
            "duration": ",2,",
            "channel_id": CHANNEL
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_check() {
    let api = api();
    let (status, body) = send(&api.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_and_fetch_market() {
    let api = api();
    let id = create_market(&api.app).await;

    let (status, body) = send(&api.app, "GET", &format!("/markets/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["options"], json!(["Yes", "No"]));
    assert_eq!(body["resolved"], false);
    assert_eq!(body["votes"]["Yes"], 0);

    let (_, list) = send(&api.app, "GET", &format!("/markets?guild_id={}&status=active", GUILD), None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    let (_, list) = send(&api.app, "GET", "/markets?status=resolved", None).await;
    assert!(list.as_array().unwrap().is_empty());
    let (status, _) = send(&api.app, "GET", "/markets?status=sideways", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_market_is_rejected() {
    let api = api();
    let (status, body) = send(
        &api.app,
        "POST",
        "/markets",
        Some(json!({
            "guild_id": GUILD,
            "creator_id": CREATOR,
            "question": "Q?",
            "options": ["Only one"],
            "duration": "1,,"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn test_alice_bets_through_the_api() {
    let api = api();
    let id = create_market(&api.app).await;

    let (status, quote) = send(&api.app, "GET", &format!("/markets/{}/quote", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quote["points"], 100);
    assert_eq!(quote["options"][0]["potential_shares"], "90.90909090");

    let (status, bet) = send(
        &api.app,
        "POST",
        &format!("/markets/{}/bets", id),
        Some(json!({ "user_id": ALICE, "option": "yes", "amount": 100 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(bet["option"], "Yes");

    let (_, balance) = send(&api.app, "GET", &format!("/balance/{}", ALICE), None).await;
    assert_eq!(balance["balance"], STARTING_BALANCE - 100);

    let (status, body) = send(
        &api.app,
        "POST",
        &format!("/markets/{}/bets", id),
        Some(json!({ "user_id": BOB, "option": "Yes", "amount": 5000 })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["kind"], "insufficient_balance");

    let (_, bets) = send(&api.app, "GET", &format!("/markets/{}/bets", id), None).await;
    assert_eq!(bets.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bet_and_category_queries() {
    let api = api();
    let id = create_market(&api.app).await;
    let (status, _) = send(
        &api.app,
        "POST",
        "/markets",
        Some(json!({
            "guild_id": GUILD,
            "creator_id": CREATOR,
            "question": "Will the home team win?",
            "options": "Yes, No",
            "duration": ",2,",
            "category": "Sports"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    for (user, option, amount) in [(ALICE, "Yes", 100), (BOB, "Yes", 40), (ALICE, "Yes", 10)] {
        let (status, _) = send(
            &api.app,
            "POST",
            &format!("/markets/{}/bets", id),
            Some(json!({ "user_id": user, "option": option, "amount": amount })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        api.clock.advance(Duration::minutes(1));
    }

    let (_, bets) = send(&api.app, "GET", &format!("/markets/{}/bets?user_id={}", id, ALICE), None).await;
    let amounts: Vec<i64> = bets.as_array().unwrap().iter().map(|b| b["amount"].as_i64().unwrap()).collect();
    assert_eq!(amounts, vec![10, 100]);

    let uri = format!("/markets/{}/options/yes/positions", id);
    let (status, positions) = send(&api.app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(positions[0]["user_id"], ALICE);
    assert_eq!(positions[0]["total_amount"], 110);
    assert_eq!(positions[1]["total_amount"], 40);

    let uri = format!("/markets/{}/options/maybe/positions", id);
    let (status, _) = send(&api.app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, sports) = send(&api.app, "GET", "/markets?category=sports", None).await;
    assert_eq!(sports.as_array().unwrap().len(), 1);
    assert_eq!(sports[0]["category"], "Sports");
    let (_, none) = send(&api.app, "GET", "/markets?category=weather", None).await;
    assert!(none.as_array().unwrap().is_empty());

    let (_, categories) = send(&api.app, "GET", &format!("/categories?guild_id={}", GUILD), None).await;
    assert_eq!(categories, json!(["Sports"]));
}

#[tokio::test]
async fn test_unknown_market_is_404() {
    let api = api();
    let (status, body) = send(&api.app, "GET", "/markets/mkt_nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_vote_and_resolve_flow() {
    let api = api();
    let id = create_market(&api.app).await;
    for (user, option, amount) in [(ALICE, "Yes", 100), (BOB, "No", 50)] {
        let (status, _) = send(
            &api.app,
            "POST",
            &format!("/markets/{}/bets", id),
            Some(json!({ "user_id": user, "option": option, "amount": amount })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &api.app,
        "POST",
        &format!("/markets/{}/votes", id),
        Some(json!({ "user_id": CAROL, "option": "Yes" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "market_state");

    api.clock.advance(Duration::hours(3));
    let (status, body) = send(&api.app, "POST", &format!("/markets/{}/end", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ended");

    let (_, first) = send(
        &api.app,
        "POST",
        &format!("/markets/{}/votes", id),
        Some(json!({ "user_id": CAROL, "option": "Yes" })),
    )
    .await;
    assert_eq!(first["outcome"], "recorded");

    let (status, body) = send(
        &api.app,
        "POST",
        &format!("/markets/{}/resolve", id),
        Some(json!({ "option": "Yes", "resolved_by": CREATOR })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "vote_threshold");

    let (_, second) = send(
        &api.app,
        "POST",
        &format!("/markets/{}/votes", id),
        Some(json!({ "user_id": DAVE, "option": "Yes" })),
    )
    .await;
    assert_eq!(second["outcome"], "resolved");
    assert_eq!(second["report"]["total_paid"], 150);

    let (_, resolution) = send(&api.app, "GET", &format!("/markets/{}/resolution", id), None).await;
    assert_eq!(resolution["resolution"]["winning_option"], "Yes");
    assert_eq!(resolution["payouts"][0]["payout"], 150);

    let (_, balance) = send(&api.app, "GET", &format!("/balance/{}", ALICE), None).await;
    assert_eq!(balance["balance"], STARTING_BALANCE + 50);

    let (status, _) = send(&api.app, "POST", &format!("/markets/{}/refund", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
