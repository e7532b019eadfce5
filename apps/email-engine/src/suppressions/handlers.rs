//! Axum route handlers for the suppression list, unsubscribe and provider webhooks.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::scheduled::SuppressionReason;
use crate::models::suppression::{Suppression, SuppressionSource};
use crate::state::AppState;
use crate::store::SuppressionStore;
use crate::suppressions::{self, ResendWebhook};

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressRequest {
    pub email_address: String,
    pub user_id: Option<Uuid>,
    pub reason: SuppressionReason,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub email_address: String,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SuppressionsResponse {
    pub suppressions: Vec<Suppression>,
}

#[derive(Debug, Serialize)]
pub struct SuppressionResponse {
    pub suppression: Suppression,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResponse {
    pub suppression: Suppression,
    pub cancelled_count: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/email/suppressions
pub async fn handle_list_suppressions(
    State(state): State<AppState>,
) -> Result<Json<SuppressionsResponse>, AppError> {
    let suppressions = state.store.list_suppressions().await?;
    Ok(Json(SuppressionsResponse { suppressions }))
}

/// POST /api/email/suppressions
pub async fn handle_suppress(
    State(state): State<AppState>,
    Json(request): Json<SuppressRequest>,
) -> Result<Json<SuppressionResponse>, AppError> {
    let suppression = suppressions::suppress(
        state.store.as_ref(),
        &request.email_address,
        request.user_id,
        request.reason,
        SuppressionSource::Admin,
    )
    .await?;
    Ok(Json(SuppressionResponse { suppression }))
}

/// DELETE /api/email/suppressions/:email
pub async fn handle_unsuppress(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<Value>, AppError> {
    suppressions::unsuppress(state.store.as_ref(), &email).await?;
    Ok(Json(json!({})))
}

/// POST /api/email/unsubscribe
pub async fn handle_unsubscribe(
    State(state): State<AppState>,
    Json(request): Json<UnsubscribeRequest>,
) -> Result<Json<UnsubscribeResponse>, AppError> {
    let result = suppressions::unsubscribe(
        state.store.as_ref(),
        state.provider.as_ref(),
        &request.email_address,
        request.user_id,
        Utc::now(),
    )
    .await?;
    Ok(Json(UnsubscribeResponse {
        suppression: result.suppression,
        cancelled_count: result.cancelled_count,
    }))
}

/// POST /api/email/webhooks/resend
pub async fn handle_resend_webhook(
    State(state): State<AppState>,
    Json(event): Json<ResendWebhook>,
) -> Result<Json<Value>, AppError> {
    let processed = suppressions::apply_webhook(state.store.as_ref(), event).await?;
    Ok(Json(json!({ "processed": processed })))
}
