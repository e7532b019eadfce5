//! Axum route handlers for the Template API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::template::{EmailTemplate, TemplateMetadata};
use crate::state::AppState;
use crate::store::TemplateStore;
use crate::templates::{self, CreateTemplate};

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    pub name: String,
    pub subject: String,
    pub html_content: String,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub name: String,
    pub version: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub template_id: Uuid,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<EmailTemplate>,
}

#[derive(Debug, Serialize)]
pub struct TemplateResponse {
    pub template: EmailTemplate,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub html: String,
    pub subject: String,
    pub text: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/email/templates
pub async fn handle_list_templates(
    State(state): State<AppState>,
) -> Result<Json<TemplatesResponse>, AppError> {
    let templates = state.store.list_templates().await?;
    Ok(Json(TemplatesResponse { templates }))
}

/// POST /api/email/templates
///
/// Creates the next version of a named template. Never edits an existing version.
pub async fn handle_create_template(
    State(state): State<AppState>,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<TemplateResponse>), AppError> {
    let template = templates::create_version(
        state.store.as_ref(),
        CreateTemplate {
            name: request.name,
            subject: request.subject,
            html_content: request.html_content,
            text_content: request.text_content,
            metadata: request.metadata,
            activate: request.activate,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(TemplateResponse { template })))
}

/// POST /api/email/templates/activate
pub async fn handle_activate_template(
    State(state): State<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<TemplateResponse>, AppError> {
    let template = templates::activate(state.store.as_ref(), &request.name, request.version).await?;
    Ok(Json(TemplateResponse { template }))
}

/// GET /api/email/templates/active/:name
pub async fn handle_get_active_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TemplateResponse>, AppError> {
    let template = templates::get_active(state.store.as_ref(), &name).await?;
    Ok(Json(TemplateResponse { template }))
}

/// POST /api/email/templates/preview
pub async fn handle_preview_template(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, AppError> {
    let rendered = templates::preview(
        state.store.as_ref(),
        request.template_id,
        &request.variables,
        &state.config.unsubscribe_base_url,
    )
    .await?;

    Ok(Json(PreviewResponse {
        html: rendered.html,
        subject: rendered.subject,
        text: rendered.text,
    }))
}
