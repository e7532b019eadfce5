//! Axum route handlers for the Flow API and product events.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::AppError;
use crate::flows::definitions::{self, AddStep, CreateFlow};
use crate::flows::orchestrator::{self, EventOutcome, EventRequest, FlowInstance, TriggerRequest};
use crate::flows::stats::{self, FlowStats};
use crate::models::flow::{EmailFlow, EmailFlowStep, FlowWithSteps};
use crate::models::template::EmailType;
use crate::state::AppState;
use crate::store::FlowStore;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowRequest {
    pub name: String,
    pub description: Option<String>,
    pub trigger_event: String,
    #[serde(default)]
    pub cancel_events: Vec<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlowRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddStepRequest {
    pub template_id: Uuid,
    pub template_version: Option<i32>,
    pub time_offset_minutes: i32,
    pub subject_override: Option<String>,
    pub email_type: Option<EmailType>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFlowRequest {
    pub flow_id: Uuid,
    pub user_id: Option<Uuid>,
    pub email_address: String,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub variables: Value,
    pub flow_trigger_id: Option<Uuid>,
}

/// Either `flowTriggerId`, or `userId` together with `flowId`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelFlowRequest {
    pub flow_trigger_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    pub event: String,
    pub user_id: Option<Uuid>,
    pub email_address: Option<String>,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub is_test: bool,
}

#[derive(Debug, Serialize)]
pub struct FlowsResponse {
    pub flows: Vec<EmailFlow>,
}

#[derive(Debug, Serialize)]
pub struct FlowResponse {
    pub flow: EmailFlow,
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub step: EmailFlowStep,
}

#[derive(Debug, Serialize)]
pub struct StepsResponse {
    pub steps: Vec<EmailFlowStep>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatsResponse {
    pub flow_stats: BTreeMap<Uuid, FlowStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelFlowResponse {
    pub cancelled_count: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/email/flows
pub async fn handle_list_flows(
    State(state): State<AppState>,
) -> Result<Json<FlowsResponse>, AppError> {
    let flows = state.store.list_flows().await?;
    Ok(Json(FlowsResponse { flows }))
}

/// POST /api/email/flows
pub async fn handle_create_flow(
    State(state): State<AppState>,
    Json(request): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<FlowResponse>), AppError> {
    let flow = definitions::create_flow(
        state.store.as_ref(),
        CreateFlow {
            name: request.name,
            description: request.description,
            trigger_event: request.trigger_event,
            cancel_events: request.cancel_events,
            is_active: request.is_active.unwrap_or(true),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(FlowResponse { flow })))
}

/// GET /api/email/flows/stats
pub async fn handle_flow_stats(
    State(state): State<AppState>,
) -> Result<Json<FlowStatsResponse>, AppError> {
    let flow_stats = stats::flow_stats(state.store.as_ref()).await?;
    Ok(Json(FlowStatsResponse { flow_stats }))
}

/// GET /api/email/flows/:id
pub async fn handle_get_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
) -> Result<Json<FlowWithSteps>, AppError> {
    let detail = definitions::get_flow_with_steps(state.store.as_ref(), flow_id).await?;
    Ok(Json(detail))
}

/// PATCH /api/email/flows/:id
pub async fn handle_update_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Json(request): Json<UpdateFlowRequest>,
) -> Result<Json<FlowResponse>, AppError> {
    let flow = definitions::set_active(state.store.as_ref(), flow_id, request.is_active).await?;
    Ok(Json(FlowResponse { flow }))
}

/// POST /api/email/flows/:id/steps
pub async fn handle_add_step(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Json(request): Json<AddStepRequest>,
) -> Result<(StatusCode, Json<StepResponse>), AppError> {
    let step = definitions::add_step(
        state.store.as_ref(),
        flow_id,
        AddStep {
            template_id: request.template_id,
            template_version: request.template_version,
            time_offset_minutes: request.time_offset_minutes,
            subject_override: request.subject_override,
            email_type: request.email_type,
            metadata: request.metadata,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(StepResponse { step })))
}

/// DELETE /api/email/flows/:id/steps/:step_id
pub async fn handle_remove_step(
    State(state): State<AppState>,
    Path((flow_id, step_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<StepsResponse>, AppError> {
    let steps = definitions::remove_step(state.store.as_ref(), flow_id, step_id).await?;
    Ok(Json(StepsResponse { steps }))
}

/// POST /api/email/flows/trigger
pub async fn handle_trigger_flow(
    State(state): State<AppState>,
    Json(request): Json<TriggerFlowRequest>,
) -> Result<(StatusCode, Json<FlowInstance>), AppError> {
    let instance = orchestrator::trigger(
        state.store.as_ref(),
        TriggerRequest {
            flow_id: request.flow_id,
            email_address: request.email_address,
            user_id: request.user_id,
            variables: request.variables,
            is_test: request.is_test,
            flow_trigger_id: request.flow_trigger_id,
            triggered_at: Utc::now(),
        },
    )
    .await?;

    let status = if instance.created > 0 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(instance)))
}

/// POST /api/email/flows/cancel
pub async fn handle_cancel_flow(
    State(state): State<AppState>,
    Json(request): Json<CancelFlowRequest>,
) -> Result<Json<CancelFlowResponse>, AppError> {
    let store = state.store.as_ref();
    let provider = state.provider.as_ref();
    let now = Utc::now();

    let cancelled_count = match request {
        CancelFlowRequest {
            flow_trigger_id: Some(flow_trigger_id),
            ..
        } => orchestrator::cancel_instance(store, provider, flow_trigger_id, now).await?,
        CancelFlowRequest {
            user_id: Some(user_id),
            flow_id: Some(flow_id),
            ..
        } => orchestrator::cancel_for_user_and_flow(store, provider, user_id, flow_id, now).await?,
        _ => {
            return Err(AppError::Validation(
                "Provide flowTriggerId, or userId and flowId".to_string(),
            ))
        }
    };
    Ok(Json(CancelFlowResponse { cancelled_count }))
}

/// POST /api/email/events
pub async fn handle_event(
    State(state): State<AppState>,
    Json(body): Json<EventBody>,
) -> Result<Json<EventOutcome>, AppError> {
    let outcome = orchestrator::handle_event(
        state.store.as_ref(),
        state.provider.as_ref(),
        EventRequest {
            event: body.event,
            user_id: body.user_id,
            email_address: body.email_address,
            variables: body.variables,
            is_test: body.is_test,
        },
        Utc::now(),
    )
    .await?;
    Ok(Json(outcome))
}
