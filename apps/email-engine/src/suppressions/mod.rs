//! Suppression List: recipients who must never be emailed again.
//!
//! Entries come from admins, the unsubscribe endpoint and provider webhooks. The
//! dispatch worker consults the list right before each send, so a suppression
//! takes effect for rows that were scheduled before it existed.

pub mod handlers;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::provider::EmailProvider;
use crate::errors::AppError;
use crate::flows::orchestrator;
use crate::ledger::validate_address;
use crate::models::scheduled::SuppressionReason;
use crate::models::suppression::{NewSuppression, Suppression, SuppressionSource};
use crate::store::{EmailStore, SuppressionStore};

/// Event routed through the orchestrator when a recipient unsubscribes.
pub const UNSUBSCRIBED_EVENT: &str = "unsubscribed";

pub async fn suppress(
    store: &dyn EmailStore,
    email_address: &str,
    user_id: Option<Uuid>,
    reason: SuppressionReason,
    source: SuppressionSource,
) -> Result<Suppression, AppError> {
    let address = validate_address(email_address)?;
    let suppression = store
        .add_suppression(NewSuppression {
            email_address: address,
            user_id,
            reason,
            source,
        })
        .await?;
    info!(
        "Suppressed {} ({}, via {})",
        suppression.email_address,
        reason.as_str(),
        source.as_str()
    );
    Ok(suppression)
}

pub async fn unsuppress(store: &dyn EmailStore, email_address: &str) -> Result<(), AppError> {
    if !store.remove_suppression(email_address).await? {
        return Err(AppError::NotFound(format!(
            "{email_address} is not suppressed"
        )));
    }
    info!("Removed suppression for {email_address}");
    Ok(())
}

pub async fn is_suppressed(
    store: &dyn EmailStore,
    email_address: &str,
    user_id: Option<Uuid>,
) -> Result<bool, AppError> {
    Ok(store.find_suppression(email_address, user_id).await?.is_some())
}

#[derive(Debug, Clone)]
pub struct Unsubscribed {
    pub suppression: Suppression,
    pub cancelled_count: usize,
}

/// Suppresses the address and cancels the user's flows that stop on unsubscribe.
/// Flows are only cancelled when the user id is known. Flows triggered by the
/// unsubscribe event are never started here.
pub async fn unsubscribe(
    store: &dyn EmailStore,
    provider: &dyn EmailProvider,
    email_address: &str,
    user_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Unsubscribed, AppError> {
    let suppression = suppress(
        store,
        email_address,
        user_id,
        SuppressionReason::Unsubscribed,
        SuppressionSource::Unsubscribe,
    )
    .await?;

    let cancelled_count = match user_id {
        Some(user_id) => {
            orchestrator::cancel_for_event(store, provider, UNSUBSCRIBED_EVENT, user_id, now).await?
        }
        None => {
            debug!(
                "No user id for {}; flows left to dispatch-time suppression",
                suppression.email_address
            );
            0
        }
    };

    Ok(Unsubscribed {
        suppression,
        cancelled_count,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Resend webhooks
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResendWebhook {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: ResendWebhookData,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResendWebhookData {
    #[serde(default)]
    pub email_id: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
}

pub fn webhook_reason(kind: &str) -> Option<SuppressionReason> {
    match kind {
        "email.bounced" => Some(SuppressionReason::Bounced),
        "email.complained" => Some(SuppressionReason::Complained),
        _ => None,
    }
}

/// Suppresses every recipient of a bounce or complaint. Returns how many entries
/// were written; other event types are acknowledged with zero.
pub async fn apply_webhook(store: &dyn EmailStore, event: ResendWebhook) -> Result<usize, AppError> {
    let Some(reason) = webhook_reason(&event.kind) else {
        debug!("Ignoring webhook '{}'", event.kind);
        return Ok(0);
    };

    let mut processed = 0;
    for recipient in &event.data.to {
        suppress(store, recipient, None, reason, SuppressionSource::Webhook).await?;
        processed += 1;
    }
    info!(
        "Webhook '{}' for {} suppressed {processed} recipients",
        event.kind,
        event.data.email_id.as_deref().unwrap_or("unknown email")
    );
    Ok(processed)
}
