//! Axum route handlers for scheduling, listing and cancelling individual emails.

use std::fmt;
use std::str::FromStr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::ledger::{self, ScheduleRequest};
use crate::models::scheduled::{EmailStatus, ScheduledEmail, ScheduledEmailFilter};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEmailRequest {
    pub user_id: Option<Uuid>,
    pub email_address: String,
    pub template_id: Uuid,
    pub template_version: Option<i32>,
    /// Defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub variables: Value,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEmailResponse {
    pub scheduled_email: ScheduledEmail,
    pub created: bool,
}

/// Filters arrive from a form, so an empty value means "not set".
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListScheduledQuery {
    pub status: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub is_test: Option<bool>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub flow_id: Option<Uuid>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub flow_trigger_id: Option<Uuid>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub limit: Option<i64>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub offset: Option<i64>,
}

fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(de::Error::custom),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListScheduledResponse {
    pub scheduled_emails: Vec<ScheduledEmail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelEmailRequest {
    pub scheduled_email_id: Uuid,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/email/schedule
///
/// 201 for a new row, 200 when the idempotency key was already used.
pub async fn handle_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleEmailRequest>,
) -> Result<(StatusCode, Json<ScheduleEmailResponse>), AppError> {
    let inserted = ledger::schedule(
        state.store.as_ref(),
        ScheduleRequest {
            user_id: request.user_id,
            email_address: request.email_address,
            template_id: request.template_id,
            template_version: request.template_version,
            scheduled_at: request.scheduled_at.unwrap_or_else(Utc::now),
            variables: request.variables,
            is_test: request.is_test,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata,
        },
    )
    .await?;

    let status = if inserted.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(ScheduleEmailResponse {
            scheduled_email: inserted.email,
            created: inserted.created,
        }),
    ))
}

/// GET /api/email/scheduled
pub async fn handle_list_scheduled(
    State(state): State<AppState>,
    Query(query): Query<ListScheduledQuery>,
) -> Result<Json<ListScheduledResponse>, AppError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<EmailStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    let filter = ScheduledEmailFilter {
        status,
        is_test: query.is_test,
        user_id: query.user_id,
        flow_id: query.flow_id,
        flow_trigger_id: query.flow_trigger_id,
        limit: ledger::clamp_limit(
            query.limit,
            state.config.list_default_limit,
            state.config.list_max_limit,
        ),
        offset: query.offset.unwrap_or(0),
    };

    let scheduled_emails = ledger::list(state.store.as_ref(), &filter).await?;
    Ok(Json(ListScheduledResponse { scheduled_emails }))
}

/// POST /api/email/cancel
pub async fn handle_cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelEmailRequest>,
) -> Result<Json<Value>, AppError> {
    ledger::cancel(
        state.store.as_ref(),
        state.provider.as_ref(),
        request.scheduled_email_id,
        Utc::now(),
    )
    .await?;
    Ok(Json(json!({})))
}
