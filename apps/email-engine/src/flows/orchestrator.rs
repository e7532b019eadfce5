//! Flow Orchestrator: expands a trigger into one ledger row per step, cancels
//! open instances in bulk, and routes product events to both.
//!
//! Instance creation is a single all-or-nothing insert. Each row's idempotency
//! key is derived from `(flow_trigger_id, step_order)`, so replaying a trigger
//! with the same instance id returns the rows it already created.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::provider::EmailProvider;
use crate::errors::AppError;
use crate::ledger::{release_provider_schedules, validate_address, validate_variables};
use crate::models::flow::{sort_steps, EmailFlow, EmailFlowStep};
use crate::models::scheduled::{CancelSelector, NewScheduledEmail, ScheduledEmail};
use crate::models::template::TemplateSnapshot;
use crate::store::{EmailStore, FlowStore, LedgerStore};
use crate::templates;

#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub flow_id: Uuid,
    pub email_address: String,
    pub user_id: Option<Uuid>,
    pub variables: Value,
    pub is_test: bool,
    /// Supplied by callers that retry; a fresh id is generated otherwise.
    pub flow_trigger_id: Option<Uuid>,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInstance {
    pub flow_id: Uuid,
    pub flow_trigger_id: Uuid,
    /// Ordered by `step_order`.
    pub scheduled_emails: Vec<ScheduledEmail>,
    pub count: usize,
    /// Rows inserted by this call; zero on a replay.
    pub created: usize,
}

#[derive(Debug, Clone)]
pub struct EventRequest {
    pub event: String,
    pub user_id: Option<Uuid>,
    pub email_address: Option<String>,
    pub variables: Value,
    pub is_test: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    pub cancelled_count: usize,
    pub triggered: Vec<FlowInstance>,
}

pub fn step_idempotency_key(flow_trigger_id: Uuid, step_order: i32) -> String {
    format!("flow:{flow_trigger_id}:step:{step_order}")
}

/// Rows for one instance, validated and resolved but not yet stored.
struct PlannedInstance {
    flow: EmailFlow,
    flow_trigger_id: Uuid,
    rows: Vec<NewScheduledEmail>,
}

/// Starts (or replays) one instance of a flow.
pub async fn trigger(store: &dyn EmailStore, request: TriggerRequest) -> Result<FlowInstance, AppError> {
    let flow = store
        .get_flow(request.flow_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Flow {} not found", request.flow_id)))?;
    if !flow.is_active {
        return Err(AppError::NotFound(format!(
            "Flow '{}' ({}) is inactive",
            flow.name, flow.id
        )));
    }

    let steps = store.get_flow_steps(flow.id).await?;
    if steps.is_empty() {
        return Err(AppError::Validation(format!(
            "Flow '{}' has no steps",
            flow.name
        )));
    }

    let plan = plan_instance(store, flow, steps, request).await?;
    commit_instance(store, plan).await
}

/// Validates the recipient and resolves every step's template. Touches nothing.
async fn plan_instance(
    store: &dyn EmailStore,
    flow: EmailFlow,
    mut steps: Vec<EmailFlowStep>,
    request: TriggerRequest,
) -> Result<PlannedInstance, AppError> {
    let email_address = validate_address(&request.email_address)?;
    let variables = validate_variables(request.variables)?;
    sort_steps(&mut steps);

    let flow_trigger_id = request.flow_trigger_id.unwrap_or_else(Uuid::new_v4);
    let mut rows = Vec::with_capacity(steps.len());
    for step in &steps {
        let template = templates::resolve(store, step.template_id, step.template_version).await?;
        let mut snapshot =
            TemplateSnapshot::from_template(&template, step.subject_override.as_deref());
        snapshot.email_type = step.email_type;

        rows.push(NewScheduledEmail {
            idempotency_key: step_idempotency_key(flow_trigger_id, step.step_order),
            user_id: request.user_id,
            email_address: email_address.clone(),
            template_id: template.id,
            template_version: template.version,
            template_snapshot: snapshot,
            variables: variables.clone(),
            flow_id: Some(flow.id),
            flow_step_id: Some(step.id),
            flow_trigger_id: Some(flow_trigger_id),
            triggered_at: Some(request.triggered_at),
            scheduled_at: request.triggered_at
                + Duration::minutes(i64::from(step.time_offset_minutes)),
            is_test: request.is_test,
            metadata: step.metadata.clone(),
        });
    }

    Ok(PlannedInstance {
        flow,
        flow_trigger_id,
        rows,
    })
}

async fn commit_instance(
    store: &dyn EmailStore,
    plan: PlannedInstance,
) -> Result<FlowInstance, AppError> {
    let PlannedInstance {
        flow,
        flow_trigger_id,
        rows,
    } = plan;
    let inserted = store.insert_scheduled(rows).await?;
    let created = inserted.iter().filter(|i| i.created).count();
    let scheduled_emails: Vec<ScheduledEmail> = inserted.into_iter().map(|i| i.email).collect();

    if created == 0 {
        info!("Replayed instance {flow_trigger_id} of flow '{}'", flow.name);
    } else {
        info!(
            "Triggered flow '{}' instance {flow_trigger_id}: {created} emails",
            flow.name
        );
    }

    Ok(FlowInstance {
        flow_id: flow.id,
        flow_trigger_id,
        count: scheduled_emails.len(),
        scheduled_emails,
        created,
    })
}

/// Cancels every open row of one instance. Returns how many rows moved.
pub async fn cancel_instance(
    store: &dyn EmailStore,
    provider: &dyn EmailProvider,
    flow_trigger_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let cancelled = store
        .cancel_open(CancelSelector::Instance(flow_trigger_id), now)
        .await?;
    release_provider_schedules(provider, &cancelled).await;
    info!(
        "Cancelled {} emails of instance {flow_trigger_id}",
        cancelled.len()
    );
    Ok(cancelled.len())
}

/// Cancels every open row of every instance of `flow_id` for one user.
pub async fn cancel_for_user_and_flow(
    store: &dyn EmailStore,
    provider: &dyn EmailProvider,
    user_id: Uuid,
    flow_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let cancelled = store
        .cancel_open(CancelSelector::UserAndFlow { user_id, flow_id }, now)
        .await?;
    release_provider_schedules(provider, &cancelled).await;
    info!(
        "Cancelled {} emails of flow {flow_id} for user {user_id}",
        cancelled.len()
    );
    Ok(cancelled.len())
}

/// Cancels the user's open instances of every active flow that stops on `event`.
/// Flows that `event` triggers are left alone.
pub async fn cancel_for_event(
    store: &dyn EmailStore,
    provider: &dyn EmailProvider,
    event: &str,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let mut cancelled = 0;
    for flow in store.flows_cancelled_by(event.trim()).await? {
        cancelled += cancel_for_user_and_flow(store, provider, user_id, flow.id, now).await?;
    }
    Ok(cancelled)
}

/// Routes a product event: first cancels the user's open instances of every flow
/// listing the event in `cancel_events`, then starts every flow it triggers.
///
/// Every new instance is validated and resolved before anything is cancelled, so
/// a rejected event leaves the ledger untouched.
pub async fn handle_event(
    store: &dyn EmailStore,
    provider: &dyn EmailProvider,
    request: EventRequest,
    now: DateTime<Utc>,
) -> Result<EventOutcome, AppError> {
    let event = request.event.trim();
    if event.is_empty() {
        return Err(AppError::Validation("event cannot be empty".to_string()));
    }

    let cancelling = store.flows_cancelled_by(event).await?;
    let triggering = store.flows_triggered_by(event).await?;
    if !cancelling.is_empty() && request.user_id.is_none() {
        return Err(AppError::Validation(format!(
            "userId is required: '{event}' cancels {}",
            flow_names(&cancelling)
        )));
    }

    let mut plans = Vec::with_capacity(triggering.len());
    if !triggering.is_empty() {
        let Some(email_address) = request.email_address.as_deref() else {
            return Err(AppError::Validation(format!(
                "emailAddress is required: '{event}' triggers {}",
                flow_names(&triggering)
            )));
        };
        for flow in triggering {
            let steps = store.get_flow_steps(flow.id).await?;
            if steps.is_empty() {
                warn!("Flow '{}' listens for '{event}' but has no steps", flow.name);
                continue;
            }
            let trigger = TriggerRequest {
                flow_id: flow.id,
                email_address: email_address.to_string(),
                user_id: request.user_id,
                variables: request.variables.clone(),
                is_test: request.is_test,
                flow_trigger_id: None,
                triggered_at: now,
            };
            plans.push(plan_instance(store, flow, steps, trigger).await?);
        }
    }

    let mut outcome = EventOutcome::default();
    if let Some(user_id) = request.user_id {
        for flow in &cancelling {
            outcome.cancelled_count +=
                cancel_for_user_and_flow(store, provider, user_id, flow.id, now).await?;
        }
    }
    for plan in plans {
        outcome.triggered.push(commit_instance(store, plan).await?);
    }

    debug!(
        "Event '{event}': {} cancelled, {} instances started",
        outcome.cancelled_count,
        outcome.triggered.len()
    );
    Ok(outcome)
}

fn flow_names(flows: &[EmailFlow]) -> String {
    flows
        .iter()
        .map(|f| format!("'{}'", f.name))
        .collect::<Vec<_>>()
        .join(", ")
}
