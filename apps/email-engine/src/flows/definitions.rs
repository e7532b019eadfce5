//! Flow Definition Store operations.
//!
//! Steps are validated against the template store when they are written, so a
//! flow that references a missing template fails at authoring time rather than
//! when it is triggered.

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::flow::{sort_steps, EmailFlow, EmailFlowStep, FlowWithSteps, NewFlow, NewFlowStep};
use crate::models::template::EmailType;
use crate::store::{EmailStore, FlowStore};
use crate::templates;

#[derive(Debug, Clone)]
pub struct CreateFlow {
    pub name: String,
    pub description: Option<String>,
    pub trigger_event: String,
    pub cancel_events: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct AddStep {
    pub template_id: Uuid,
    pub template_version: Option<i32>,
    pub time_offset_minutes: i32,
    pub subject_override: Option<String>,
    /// Defaults to the template's own type.
    pub email_type: Option<EmailType>,
    pub metadata: Value,
}

pub async fn create_flow(store: &dyn EmailStore, request: CreateFlow) -> Result<EmailFlow, AppError> {
    let name = request.name.trim().to_string();
    let trigger_event = request.trigger_event.trim().to_string();
    if name.is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if trigger_event.is_empty() {
        return Err(AppError::Validation("triggerEvent cannot be empty".to_string()));
    }

    let mut cancel_events: Vec<String> = request
        .cancel_events
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    cancel_events.sort();
    cancel_events.dedup();
    if cancel_events.contains(&trigger_event) {
        return Err(AppError::Validation(format!(
            "'{trigger_event}' cannot both trigger and cancel the flow"
        )));
    }

    let flow = store
        .create_flow(NewFlow {
            name,
            description: request.description.filter(|d| !d.trim().is_empty()),
            trigger_event,
            cancel_events,
            is_active: request.is_active,
        })
        .await?;
    Ok(flow)
}

pub async fn set_active(
    store: &dyn EmailStore,
    flow_id: Uuid,
    is_active: bool,
) -> Result<EmailFlow, AppError> {
    let flow = store.set_flow_active(flow_id, is_active).await?;
    info!(
        "Flow '{}' {}",
        flow.name,
        if is_active { "activated" } else { "deactivated" }
    );
    Ok(flow)
}

pub async fn get_flow_with_steps(
    store: &dyn EmailStore,
    flow_id: Uuid,
) -> Result<FlowWithSteps, AppError> {
    let flow = store
        .get_flow(flow_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Flow {flow_id} not found")))?;
    let mut steps = store.get_flow_steps(flow_id).await?;
    sort_steps(&mut steps);
    Ok(FlowWithSteps { flow, steps })
}

/// Appends a step after the flow's current last step.
pub async fn add_step(
    store: &dyn EmailStore,
    flow_id: Uuid,
    request: AddStep,
) -> Result<EmailFlowStep, AppError> {
    if store.get_flow(flow_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Flow {flow_id} not found")));
    }
    if request.time_offset_minutes < 0 {
        return Err(AppError::Validation(
            "timeOffsetMinutes cannot be negative".to_string(),
        ));
    }

    let template =
        templates::resolve(store, request.template_id, request.template_version).await?;

    let step = store
        .add_flow_step(NewFlowStep {
            flow_id,
            time_offset_minutes: request.time_offset_minutes,
            template_id: request.template_id,
            template_version: request.template_version,
            subject_override: request.subject_override.filter(|s| !s.trim().is_empty()),
            email_type: request.email_type.unwrap_or(template.metadata.email_type),
            metadata: if request.metadata.is_null() {
                Value::Object(Default::default())
            } else {
                request.metadata
            },
        })
        .await?;

    info!(
        "Flow {flow_id} step {} -> template '{}' at +{}m",
        step.step_order, template.name, step.time_offset_minutes
    );
    Ok(step)
}

/// Removes a step and returns the remaining, renumbered steps.
pub async fn remove_step(
    store: &dyn EmailStore,
    flow_id: Uuid,
    step_id: Uuid,
) -> Result<Vec<EmailFlowStep>, AppError> {
    store.remove_flow_step(flow_id, step_id).await?;
    let mut steps = store.get_flow_steps(flow_id).await?;
    sort_steps(&mut steps);
    Ok(steps)
}
