//! Dispatch Worker: claims due ledger rows and hands them to the provider.
//!
//! Every externally visible side effect happens after the row has been moved to
//! `sending` by a conditional claim, so concurrent workers never send the same row.
//! A row's failure is recorded on that row and never aborts the tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DispatchConfig};
use crate::dispatch::provider::{EmailProvider, OutboundEmail};
use crate::dispatch::retry::RetryPolicy;
use crate::errors::AppError;
use crate::models::scheduled::{EmailStatus, ScheduledEmail, StatusUpdate};
use crate::store::{EmailStore, LedgerStore, SuppressionStore};
use crate::templates::render::{render_snapshot, unsubscribe_link};

const SENDING: [EmailStatus; 1] = [EmailStatus::Sending];

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub released: u64,
    pub requeued: u64,
    pub confirmed: u64,
    pub claimed: u64,
    pub sent: u64,
    pub handed_off: u64,
    pub suppressed: u64,
    pub failed: u64,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

enum Outcome {
    Sent,
    HandedOff,
    Suppressed,
    Failed,
    /// The row left `sending` under us; nothing was recorded.
    Lost,
}

pub struct DispatchWorker {
    store: Arc<dyn EmailStore>,
    provider: Arc<dyn EmailProvider>,
    settings: DispatchConfig,
    policy: RetryPolicy,
    email_from: String,
    unsubscribe_base_url: String,
    worker_id: String,
}

impl DispatchWorker {
    pub fn new(store: Arc<dyn EmailStore>, provider: Arc<dyn EmailProvider>, config: &Config) -> Self {
        Self {
            store,
            provider,
            policy: RetryPolicy::from_config(&config.dispatch),
            settings: config.dispatch.clone(),
            email_from: config.email_from.clone(),
            unsubscribe_base_url: config.unsubscribe_base_url.clone(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Ticks every poll interval until `shutdown` flips to `true` or its sender drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Dispatch worker {} started (poll every {}ms, batch {})",
            self.worker_id,
            self.settings.poll_interval.as_millis(),
            self.settings.batch_size
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.is_idle() => debug!("Dispatch tick idle"),
                        Ok(report) => info!(?report, "Dispatch tick"),
                        Err(e) => error!("Dispatch tick failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Dispatch worker {} stopped", self.worker_id);
    }

    /// One pass: release stale claims, requeue retries, confirm provider-scheduled
    /// sends, then claim and send due rows and hand off upcoming ones.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let mut report = TickReport {
            released: self.release_stale_claims(now).await?,
            ..TickReport::default()
        };

        report.requeued = self.store.requeue_failed(now).await?.len() as u64;
        report.confirmed = self.store.confirm_provider_scheduled(now).await?;

        let due = self
            .store
            .claim_due(now, self.settings.batch_size, &self.worker_id)
            .await?;
        report.claimed = due.len() as u64;
        for row in due {
            let id = row.id;
            match self.process(row, None, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => error!("Dispatch of {id} failed: {e}"),
            }
        }

        if let Some(horizon) = self.handoff_horizon(now) {
            let upcoming = self
                .store
                .claim_for_handoff(now, horizon, self.settings.batch_size, &self.worker_id)
                .await?;
            report.claimed += upcoming.len() as u64;
            for row in upcoming {
                let id = row.id;
                let scheduled_at = row.scheduled_at;
                match self.process(row, Some(scheduled_at), now).await {
                    Ok(outcome) => report.record(outcome),
                    Err(e) => error!("Hand-off of {id} failed: {e}"),
                }
            }
        }

        Ok(report)
    }

    fn handoff_horizon(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.settings.schedule_ahead.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.settings.schedule_ahead)
            .ok()
            .map(|ahead| now + ahead)
    }

    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let Ok(lease) = chrono::Duration::from_std(self.settings.claim_lease) else {
            return Ok(0);
        };
        let mut released = 0;
        for row in self.store.stale_claims(now - lease).await? {
            let update = StatusUpdate::Failed {
                error: format!(
                    "claim by {} expired",
                    row.claimed_by.as_deref().unwrap_or("unknown worker")
                ),
                next_retry_at: self.policy.next_retry_at(row.retry_count, now),
            };
            if self.store.transition(row.id, &SENDING, update, now).await?.is_some() {
                warn!("Released stale claim on {}", row.id);
                released += 1;
            }
        }
        Ok(released)
    }

    /// Sends a claimed row, or submits it for provider-side delivery at `deliver_at`.
    async fn process(
        &self,
        row: ScheduledEmail,
        deliver_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, AppError> {
        if let Some(suppression) = self
            .store
            .find_suppression(&row.email_address, row.user_id)
            .await?
        {
            info!(
                "Suppressed {} to {} ({})",
                row.id,
                row.email_address,
                suppression.reason.as_str()
            );
            let update = StatusUpdate::Suppressed {
                reason: suppression.reason,
            };
            return self.finish(&row, update, Outcome::Suppressed, now).await;
        }

        let unsubscribe_url = unsubscribe_link(&self.unsubscribe_base_url, &row.email_address);
        let rendered = match render_snapshot(&row.template_snapshot, &row.variables, &unsubscribe_url) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("Render of {} failed: {e}", row.id);
                let update = StatusUpdate::Failed {
                    error: format!("render: {e}"),
                    next_retry_at: None,
                };
                return self.finish(&row, update, Outcome::Failed, now).await;
            }
        };

        let mut tags = vec![
            ("scheduled_email_id".to_string(), row.id.to_string()),
            ("template".to_string(), row.template_snapshot.name.clone()),
        ];
        if let Some(flow_id) = row.flow_id {
            tags.push(("flow_id".to_string(), flow_id.to_string()));
        }
        let email = OutboundEmail {
            idempotency_key: row.idempotency_key.clone(),
            from: self.email_from.clone(),
            to: row.email_address.clone(),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
            scheduled_at: deliver_at,
            tags,
        };

        match self.provider.send(&email).await {
            Ok(receipt) if deliver_at.is_some() => {
                debug!("Handed off {} as {}", row.id, receipt.id);
                let update = StatusUpdate::ProviderScheduled {
                    resend_scheduled_id: receipt.id,
                };
                self.finish(&row, update, Outcome::HandedOff, now).await
            }
            Ok(receipt) => {
                debug!("Sent {} as {}", row.id, receipt.id);
                let update = StatusUpdate::Sent {
                    resend_email_id: Some(receipt.id),
                    sent_at: now,
                };
                self.finish(&row, update, Outcome::Sent, now).await
            }
            Err(e) => {
                let next_retry_at = if e.is_retryable() {
                    self.policy.next_retry_at(row.retry_count, now)
                } else {
                    None
                };
                match next_retry_at {
                    Some(at) => warn!("Send of {} failed, retrying at {at}: {e}", row.id),
                    None => error!("Send of {} failed permanently: {e}", row.id),
                }
                let update = StatusUpdate::Failed {
                    error: e.to_string(),
                    next_retry_at,
                };
                self.finish(&row, update, Outcome::Failed, now).await
            }
        }
    }

    async fn finish(
        &self,
        row: &ScheduledEmail,
        update: StatusUpdate,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Outcome, AppError> {
        match self.store.transition(row.id, &SENDING, update, now).await? {
            Some(_) => Ok(outcome),
            None => {
                warn!("Row {} left sending before its outcome was recorded", row.id);
                Ok(Outcome::Lost)
            }
        }
    }
}

impl TickReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::HandedOff => self.handed_off += 1,
            Outcome::Suppressed => self.suppressed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Lost => {}
        }
    }
}
