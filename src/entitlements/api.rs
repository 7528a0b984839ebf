use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::models::{Account, ProviderListing, RankingCandidate, UnresolvedPayment};
use super::usage::{JobAcceptance, QuotaStatus};
use super::webhook::WebhookOutcome;
use super::EntitlementEngine;

/// key: entitlements-api -> payment webhook endpoint
pub async fn payment_webhook(
    Extension(engine): Extension<EntitlementEngine>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookReceipt>> {
    let signature = headers
        .get(engine.signature_header.as_str())
        .and_then(|value| value.to_str().ok());
    let outcome = engine.ingress.handle(&body, signature).await?;
    Ok(Json(WebhookReceipt::from(outcome)))
}

pub async fn list_unresolved_payments(
    Extension(engine): Extension<EntitlementEngine>,
) -> AppResult<Json<Vec<UnresolvedPayment>>> {
    let payments = engine.store.unresolved_payments().await?;
    Ok(Json(payments))
}

pub async fn register_account(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<String>,
) -> AppResult<Json<AccountEnvelope>> {
    if account_id.trim().is_empty() {
        return Err(AppError::BadRequest("account id required".into()));
    }
    let account = engine.store.register(&account_id).await?;
    let quota = engine.usage.status(&account, Utc::now()).await?;
    Ok(Json(AccountEnvelope { account, quota }))
}

pub async fn get_account(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<String>,
) -> AppResult<Json<AccountEnvelope>> {
    let account = engine.store.get(&account_id).await?;
    let quota = engine.usage.status(&account, Utc::now()).await?;
    Ok(Json(AccountEnvelope { account, quota }))
}

pub async fn accept_job(
    Extension(engine): Extension<EntitlementEngine>,
    Path(account_id): Path<String>,
) -> AppResult<Json<JobAcceptance>> {
    let outcome = engine
        .usage
        .accept_job(engine.store.as_ref(), &account_id, Utc::now())
        .await?;
    Ok(Json(outcome))
}

pub async fn rank_providers(
    Extension(engine): Extension<EntitlementEngine>,
    Json(payload): Json<RankRequest>,
) -> AppResult<Json<Vec<RankingCandidate>>> {
    let ranked = engine.ranking.rank(&payload.candidates, Utc::now()).await?;
    Ok(Json(ranked))
}

pub async fn root() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Marketplace Entitlements API")
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookReceipt {
    pub status: String,
}

impl From<WebhookOutcome> for WebhookReceipt {
    fn from(outcome: WebhookOutcome) -> Self {
        let status = match outcome {
            WebhookOutcome::Granted { .. } => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored { .. } => "ignored",
        };
        Self {
            status: status.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AccountEnvelope {
    pub account: Account,
    pub quota: QuotaStatus,
}

#[derive(Debug, Deserialize)]
pub struct RankRequest {
    #[serde(default)]
    pub candidates: Vec<ProviderListing>,
}
