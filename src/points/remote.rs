//! HTTP client for an external points API
//!
//! Endpoints:
//! - `GET  {base}/balance/{user_id}`  -> `{ "user_id": u64, "balance": i64 }`
//! - `POST {base}/debit`              body `{ "user_id", "amount" }`
//! - `POST {base}/credit`             body `{ "user_id", "amount" }`
//!
//! Mutating calls carry an `Idempotency-Key` header. Status mapping:
//! 402 -> Insufficient, 5xx and transport failures -> Unavailable,
//! any other non-success -> Rejected.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{BalanceService, PointsError};
use crate::market_resolve::markets::{Points, UserId};

/// Default timeout for points API calls
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct AdjustRequest {
    user_id: UserId,
    amount: Points,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Points,
}

#[derive(Debug, Deserialize)]
struct InsufficientResponse {
    available: Points,
}

#[derive(Debug, Clone)]
pub struct RemotePointsClient {
    base_url: String,
    client: Client,
}

impl RemotePointsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = crate::http::client_with_timeout(timeout, "points api");
        info!(base_url = %base_url, "remote points API configured");
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn adjust(
        &self,
        path: &str,
        user_id: UserId,
        amount: Points,
        idempotency_key: &str,
    ) -> Result<Points, PointsError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, user_id, amount, key = idempotency_key, "points request");

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", idempotency_key)
            .json(&AdjustRequest { user_id, amount })
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, amount).await?;
        read_balance(response).await
    }
}

fn transport_error(e: reqwest::Error) -> PointsError {
    PointsError::Unavailable(e.to_string())
}

async fn check_status(response: Response, required: Points) -> Result<Response, PointsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::PAYMENT_REQUIRED {
        let available = response
            .json::<InsufficientResponse>()
            .await
            .map(|body| body.available)
            .unwrap_or(0);
        return Err(PointsError::Insufficient { required, available });
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("points API returned {}: {}", status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(PointsError::Unavailable(message))
    } else {
        Err(PointsError::Rejected(message))
    }
}

async fn read_balance(response: Response) -> Result<Points, PointsError> {
    response
        .json::<BalanceResponse>()
        .await
        .map(|body| body.balance)
        .map_err(|e| PointsError::Rejected(format!("invalid points API response: {}", e)))
}

#[async_trait]
impl BalanceService for RemotePointsClient {
    async fn balance(&self, user_id: UserId) -> Result<Points, PointsError> {
        let url = format!("{}/balance/{}", self.base_url, user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, 0).await?;
        read_balance(response).await
    }

    async fn debit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError> {
        self.adjust("debit", user_id, amount, idempotency_key).await
    }

    async fn credit(&self, user_id: UserId, amount: Points, idempotency_key: &str) -> Result<Points, PointsError> {
        self.adjust("credit", user_id, amount, idempotency_key).await
    }
}
