//! Scheduled-Email Ledger: idempotent creation, conditional cancellation and
//! listing. Status changes after creation belong to the dispatch worker and the
//! cancel paths here; nothing else writes a row.

pub mod handlers;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::provider::EmailProvider;
use crate::errors::AppError;
use crate::models::scheduled::{
    EmailStatus, Inserted, NewScheduledEmail, ScheduledEmail, ScheduledEmailFilter, StatusUpdate,
};
use crate::models::template::TemplateSnapshot;
use crate::store::{EmailStore, LedgerStore};
use crate::templates;

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub user_id: Option<Uuid>,
    pub email_address: String,
    pub template_id: Uuid,
    pub template_version: Option<i32>,
    pub scheduled_at: DateTime<Utc>,
    pub variables: Value,
    pub is_test: bool,
    /// Generated when absent, which makes the call non-idempotent.
    pub idempotency_key: Option<String>,
    pub metadata: Value,
}

/// Trims the address and checks its shape: one `@` between a non-empty local part
/// and domain, and no whitespace.
pub fn validate_address(raw: &str) -> Result<String, AppError> {
    let address = raw.trim();
    let invalid = || AppError::Validation(format!("Invalid email address '{raw}'"));

    if address.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = address.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    Ok(address.to_string())
}

/// Variables must be a JSON object; `null` means none.
pub fn validate_variables(variables: Value) -> Result<Value, AppError> {
    match variables {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(_) => Ok(variables),
        _ => Err(AppError::Validation(
            "variables must be a JSON object".to_string(),
        )),
    }
}

/// Inserts one `pending` row. A repeated idempotency key returns the stored row
/// with `created == false`.
pub async fn schedule(
    store: &dyn EmailStore,
    request: ScheduleRequest,
) -> Result<Inserted, AppError> {
    let email_address = validate_address(&request.email_address)?;
    let variables = validate_variables(request.variables)?;
    let template =
        templates::resolve(store, request.template_id, request.template_version).await?;

    let idempotency_key = request
        .idempotency_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| format!("adhoc:{}", Uuid::new_v4()));

    let row = NewScheduledEmail {
        idempotency_key,
        user_id: request.user_id,
        email_address,
        template_id: template.id,
        template_version: template.version,
        template_snapshot: TemplateSnapshot::from_template(&template, None),
        variables,
        flow_id: None,
        flow_step_id: None,
        flow_trigger_id: None,
        triggered_at: None,
        scheduled_at: request.scheduled_at,
        is_test: request.is_test,
        metadata: if request.metadata.is_null() {
            Value::Object(Default::default())
        } else {
            request.metadata
        },
    };

    let inserted = store
        .insert_scheduled(vec![row])
        .await?
        .pop()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("insert returned no row")))?;

    if inserted.created {
        info!(
            "Scheduled {} ({} v{}) for {}",
            inserted.email.id, template.name, template.version, inserted.email.scheduled_at
        );
    } else {
        info!(
            "Idempotent replay of '{}' returned {}",
            inserted.email.idempotency_key, inserted.email.id
        );
    }
    Ok(inserted)
}

/// Cancels one row. Only `pending` and `scheduled` rows can be cancelled; a row
/// being sent, or already finished, is rejected.
pub async fn cancel(
    store: &dyn EmailStore,
    provider: &dyn EmailProvider,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<ScheduledEmail, AppError> {
    let current = store
        .get_scheduled(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Scheduled email {id} not found")))?;
    if !current.status.is_open() {
        return Err(not_cancellable(id, current.status));
    }
    if current.provider_send_due(now) {
        return Err(AppError::InvalidState(format!(
            "Scheduled email {id} was handed to the provider for {} and may already be sent",
            current.scheduled_at
        )));
    }

    let cancelled = match store
        .transition(
            id,
            &EmailStatus::CANCELLABLE,
            StatusUpdate::Cancelled { at: now },
            now,
        )
        .await?
    {
        Some(row) => row,
        None => {
            // Claimed or cancelled between the read and the conditional update.
            let status = store
                .get_scheduled(id)
                .await?
                .map(|row| row.status)
                .unwrap_or(current.status);
            return Err(not_cancellable(id, status));
        }
    };

    info!("Cancelled scheduled email {id}");
    release_provider_schedules(provider, std::slice::from_ref(&cancelled)).await;
    Ok(cancelled)
}

fn not_cancellable(id: Uuid, status: EmailStatus) -> AppError {
    AppError::InvalidState(format!(
        "Scheduled email {id} is {status} and cannot be cancelled"
    ))
}

/// Best-effort cancellation of provider-side scheduled sends for rows that were
/// just cancelled in the ledger.
pub async fn release_provider_schedules(provider: &dyn EmailProvider, rows: &[ScheduledEmail]) {
    for row in rows {
        let Some(provider_id) = row.resend_scheduled_id.as_deref() else {
            continue;
        };
        if let Err(e) = provider.cancel_scheduled(provider_id).await {
            warn!(
                "Provider cancel of {provider_id} for {} failed: {e}",
                row.id
            );
        }
    }
}

/// Clamps a requested page size to `1..=max`, using `default` when absent.
pub fn clamp_limit(requested: Option<i64>, default: i64, max: i64) -> i64 {
    requested.unwrap_or(default).clamp(1, max)
}

pub async fn list(
    store: &dyn EmailStore,
    filter: &ScheduledEmailFilter,
) -> Result<Vec<ScheduledEmail>, AppError> {
    if filter.offset < 0 {
        return Err(AppError::Validation("offset cannot be negative".to_string()));
    }
    store.list_scheduled(filter).await
}
