use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{FlowStore, LedgerStore, SuppressionStore, TemplateStore};
use crate::errors::AppError;
use crate::flows::stats::compute_flow_stats;
use crate::models::flow::{
    sort_steps, EmailFlow, EmailFlowStep, FlowStats, NewFlow, NewFlowStep,
};
use crate::models::scheduled::{
    CancelSelector, EmailStatus, Inserted, NewScheduledEmail, ScheduledEmail,
    ScheduledEmailFilter, StatusUpdate,
};
use crate::models::suppression::{normalize_address, NewSuppression, Suppression};
use crate::models::template::{EmailTemplate, NewTemplateVersion};

#[derive(Default)]
struct State {
    templates: Vec<EmailTemplate>,
    flows: Vec<EmailFlow>,
    steps: Vec<EmailFlowStep>,
    /// Insertion order.
    emails: Vec<ScheduledEmail>,
    idempotency: HashMap<String, Uuid>,
    suppressions: Vec<Suppression>,
}

impl State {
    fn email_mut(&mut self, id: Uuid) -> Option<&mut ScheduledEmail> {
        self.emails.iter_mut().find(|e| e.id == id)
    }
}

/// In-memory store. Every operation runs under one mutex, so each conditional
/// transition is atomic with respect to every other.
#[derive(Default)]
pub struct MemoryEmailStore {
    state: Mutex<State>,
}

impl MemoryEmailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ledger row that belongs to a flow.
    #[cfg(test)]
    pub fn flow_rows(&self) -> Result<Vec<ScheduledEmail>, AppError> {
        Ok(self
            .state()?
            .emails
            .iter()
            .filter(|e| e.flow_id.is_some())
            .cloned()
            .collect())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("memory store mutex poisoned")))
    }
}

#[async_trait]
impl TemplateStore for MemoryEmailStore {
    async fn list_templates(&self) -> Result<Vec<EmailTemplate>, AppError> {
        let mut templates = self.state()?.templates.clone();
        templates.sort_by(|a, b| a.name.cmp(&b.name).then(b.version.cmp(&a.version)));
        Ok(templates)
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, AppError> {
        Ok(self.state()?.templates.iter().find(|t| t.id == id).cloned())
    }

    async fn get_template_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<EmailTemplate>, AppError> {
        Ok(self
            .state()?
            .templates
            .iter()
            .find(|t| t.name == name && t.version == version)
            .cloned())
    }

    async fn get_active_template(&self, name: &str) -> Result<Option<EmailTemplate>, AppError> {
        Ok(self
            .state()?
            .templates
            .iter()
            .find(|t| t.name == name && t.is_active)
            .cloned())
    }

    async fn create_template_version(
        &self,
        new: NewTemplateVersion,
    ) -> Result<EmailTemplate, AppError> {
        let mut state = self.state()?;
        let version = state
            .templates
            .iter()
            .filter(|t| t.name == new.name)
            .map(|t| t.version)
            .max()
            .unwrap_or(0)
            + 1;
        let template = EmailTemplate {
            id: Uuid::new_v4(),
            name: new.name,
            version,
            subject: new.subject,
            html_content: new.html_content,
            text_content: new.text_content,
            is_active: false,
            metadata: new.metadata,
            created_at: Utc::now(),
        };
        state.templates.push(template.clone());
        Ok(template)
    }

    async fn activate_template(
        &self,
        name: &str,
        version: i32,
    ) -> Result<EmailTemplate, AppError> {
        let mut state = self.state()?;
        if !state
            .templates
            .iter()
            .any(|t| t.name == name && t.version == version)
        {
            return Err(AppError::NotFound(format!(
                "Template {name} version {version} not found"
            )));
        }
        let mut activated = None;
        for template in state.templates.iter_mut().filter(|t| t.name == name) {
            template.is_active = template.version == version;
            if template.is_active {
                activated = Some(template.clone());
            }
        }
        activated.ok_or_else(|| AppError::NotFound(format!("Template {name} not found")))
    }
}

#[async_trait]
impl LedgerStore for MemoryEmailStore {
    async fn insert_scheduled(
        &self,
        rows: Vec<NewScheduledEmail>,
    ) -> Result<Vec<Inserted>, AppError> {
        let mut state = self.state()?;
        let now = Utc::now();

        // Validate the whole batch before touching state so a failure leaves nothing behind.
        for row in &rows {
            if !state.templates.iter().any(|t| t.id == row.template_id) {
                return Err(AppError::Validation(format!(
                    "Template {} does not exist",
                    row.template_id
                )));
            }
        }

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(existing_id) = state.idempotency.get(&row.idempotency_key).copied() {
                let existing = state
                    .emails
                    .iter()
                    .find(|e| e.id == existing_id)
                    .cloned()
                    .ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "idempotency index points at missing row {existing_id}"
                        ))
                    })?;
                results.push(Inserted {
                    email: existing,
                    created: false,
                });
                continue;
            }
            let email = row.into_row(Uuid::new_v4(), now);
            state
                .idempotency
                .insert(email.idempotency_key.clone(), email.id);
            state.emails.push(email.clone());
            results.push(Inserted {
                email,
                created: true,
            });
        }
        Ok(results)
    }

    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledEmail>, AppError> {
        Ok(self.state()?.emails.iter().find(|e| e.id == id).cloned())
    }

    async fn list_scheduled(
        &self,
        filter: &ScheduledEmailFilter,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let state = self.state()?;
        let mut rows: Vec<ScheduledEmail> = state
            .emails
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[EmailStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledEmail>, AppError> {
        let mut state = self.state()?;
        let Some(row) = state.email_mut(id) else {
            return Ok(None);
        };
        if !from.contains(&row.status) {
            return Ok(None);
        }
        update.apply(row, now);
        Ok(Some(row.clone()))
    }

    async fn cancel_open(
        &self,
        selector: CancelSelector,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let mut state = self.state()?;
        let update = StatusUpdate::Cancelled { at: now };
        let mut cancelled = Vec::new();
        for row in state
            .emails
            .iter_mut()
            .filter(|e| e.status.is_open() && !e.provider_send_due(now) && selector.matches(e))
        {
            update.apply(row, now);
            cancelled.push(row.clone());
        }
        Ok(cancelled)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let mut state = self.state()?;
        let mut due: Vec<&mut ScheduledEmail> = state
            .emails
            .iter_mut()
            .filter(|e| {
                e.status.is_open() && e.resend_scheduled_id.is_none() && e.scheduled_at <= now
            })
            .collect();
        due.sort_by_key(|e| e.scheduled_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|row| {
                claim(row, worker_id, now);
                row.clone()
            })
            .collect())
    }

    async fn claim_for_handoff(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let mut state = self.state()?;
        let mut upcoming: Vec<&mut ScheduledEmail> = state
            .emails
            .iter_mut()
            .filter(|e| {
                e.status == EmailStatus::Pending && e.scheduled_at > now && e.scheduled_at <= horizon
            })
            .collect();
        upcoming.sort_by_key(|e| e.scheduled_at);
        Ok(upcoming
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|row| {
                claim(row, worker_id, now);
                row.clone()
            })
            .collect())
    }

    async fn confirm_provider_scheduled(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state()?;
        let mut confirmed = 0;
        for row in state.emails.iter_mut().filter(|e| {
            e.status == EmailStatus::Scheduled
                && e.resend_scheduled_id.is_some()
                && e.scheduled_at <= now
        }) {
            let sent_at = row.scheduled_at;
            StatusUpdate::Sent {
                resend_email_id: None,
                sent_at,
            }
            .apply(row, now);
            confirmed += 1;
        }
        Ok(confirmed)
    }

    async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEmail>, AppError> {
        let mut state = self.state()?;
        let mut requeued = Vec::new();
        for row in state.emails.iter_mut().filter(|e| {
            e.status == EmailStatus::Failed && e.next_retry_at.map_or(false, |at| at <= now)
        }) {
            if let Some(retry_at) = row.next_retry_at.take() {
                row.status = EmailStatus::Scheduled;
                row.scheduled_at = row.scheduled_at.max(retry_at);
                row.retry_count += 1;
                row.last_retry_at = Some(now);
                row.updated_at = now;
                requeued.push(row.clone());
            }
        }
        Ok(requeued)
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        Ok(self
            .state()?
            .emails
            .iter()
            .filter(|e| {
                e.status == EmailStatus::Sending
                    && e.claimed_at.map_or(true, |at| at < claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn flow_stats(&self) -> Result<BTreeMap<Uuid, FlowStats>, AppError> {
        let state = self.state()?;
        let rows: Vec<ScheduledEmail> = state
            .emails
            .iter()
            .filter(|e| e.flow_id.is_some())
            .cloned()
            .collect();
        Ok(compute_flow_stats(&state.flows, &rows))
    }
}

fn claim(row: &mut ScheduledEmail, worker_id: &str, now: DateTime<Utc>) {
    row.status = EmailStatus::Sending;
    row.claimed_by = Some(worker_id.to_string());
    row.claimed_at = Some(now);
    row.updated_at = now;
}

#[async_trait]
impl FlowStore for MemoryEmailStore {
    async fn list_flows(&self) -> Result<Vec<EmailFlow>, AppError> {
        let mut flows = self.state()?.flows.clone();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flows)
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<EmailFlow>, AppError> {
        Ok(self.state()?.flows.iter().find(|f| f.id == id).cloned())
    }

    async fn get_flow_steps(&self, flow_id: Uuid) -> Result<Vec<EmailFlowStep>, AppError> {
        let mut steps: Vec<EmailFlowStep> = self
            .state()?
            .steps
            .iter()
            .filter(|s| s.flow_id == flow_id)
            .cloned()
            .collect();
        sort_steps(&mut steps);
        Ok(steps)
    }

    async fn create_flow(&self, new: NewFlow) -> Result<EmailFlow, AppError> {
        let flow = EmailFlow {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            trigger_event: new.trigger_event,
            cancel_events: new.cancel_events,
            is_active: new.is_active,
            created_at: Utc::now(),
        };
        self.state()?.flows.push(flow.clone());
        Ok(flow)
    }

    async fn set_flow_active(&self, id: Uuid, is_active: bool) -> Result<EmailFlow, AppError> {
        let mut state = self.state()?;
        let flow = state
            .flows
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Flow {id} not found")))?;
        flow.is_active = is_active;
        Ok(flow.clone())
    }

    async fn add_flow_step(&self, new: NewFlowStep) -> Result<EmailFlowStep, AppError> {
        let mut state = self.state()?;
        if !state.flows.iter().any(|f| f.id == new.flow_id) {
            return Err(AppError::NotFound(format!("Flow {} not found", new.flow_id)));
        }
        let step_order = state
            .steps
            .iter()
            .filter(|s| s.flow_id == new.flow_id)
            .map(|s| s.step_order)
            .max()
            .unwrap_or(0)
            + 1;
        let step = EmailFlowStep {
            id: Uuid::new_v4(),
            flow_id: new.flow_id,
            step_order,
            time_offset_minutes: new.time_offset_minutes,
            template_id: new.template_id,
            template_version: new.template_version,
            subject_override: new.subject_override,
            email_type: new.email_type,
            metadata: new.metadata,
        };
        state.steps.push(step.clone());
        Ok(step)
    }

    async fn remove_flow_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state()?;
        let removed_order = state
            .steps
            .iter()
            .find(|s| s.flow_id == flow_id && s.id == step_id)
            .map(|s| s.step_order)
            .ok_or_else(|| AppError::NotFound(format!("Step {step_id} not found in flow {flow_id}")))?;
        state.steps.retain(|s| s.id != step_id);
        for step in state
            .steps
            .iter_mut()
            .filter(|s| s.flow_id == flow_id && s.step_order > removed_order)
        {
            step.step_order -= 1;
        }
        Ok(())
    }

    async fn flows_triggered_by(&self, event: &str) -> Result<Vec<EmailFlow>, AppError> {
        Ok(self
            .state()?
            .flows
            .iter()
            .filter(|f| f.is_active && f.trigger_event == event)
            .cloned()
            .collect())
    }

    async fn flows_cancelled_by(&self, event: &str) -> Result<Vec<EmailFlow>, AppError> {
        Ok(self
            .state()?
            .flows
            .iter()
            .filter(|f| f.is_active && f.cancel_events.iter().any(|e| e == event))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SuppressionStore for MemoryEmailStore {
    async fn list_suppressions(&self) -> Result<Vec<Suppression>, AppError> {
        Ok(self.state()?.suppressions.clone())
    }

    async fn find_suppression(
        &self,
        email_address: &str,
        user_id: Option<Uuid>,
    ) -> Result<Option<Suppression>, AppError> {
        let address = normalize_address(email_address);
        Ok(self
            .state()?
            .suppressions
            .iter()
            .find(|s| s.email_address == address || (user_id.is_some() && s.user_id == user_id))
            .cloned())
    }

    async fn add_suppression(&self, new: NewSuppression) -> Result<Suppression, AppError> {
        let mut state = self.state()?;
        let address = normalize_address(&new.email_address);
        if let Some(existing) = state
            .suppressions
            .iter_mut()
            .find(|s| s.email_address == address)
        {
            existing.reason = new.reason;
            existing.source = new.source;
            if new.user_id.is_some() {
                existing.user_id = new.user_id;
            }
            return Ok(existing.clone());
        }
        let suppression = Suppression {
            id: Uuid::new_v4(),
            email_address: address,
            user_id: new.user_id,
            reason: new.reason,
            source: new.source,
            created_at: Utc::now(),
        };
        state.suppressions.push(suppression.clone());
        Ok(suppression)
    }

    async fn remove_suppression(&self, email_address: &str) -> Result<bool, AppError> {
        let mut state = self.state()?;
        let address = normalize_address(email_address);
        let before = state.suppressions.len();
        state.suppressions.retain(|s| s.email_address != address);
        Ok(state.suppressions.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scheduled::SuppressionReason;
    use crate::models::suppression::SuppressionSource;
    use crate::models::template::{TemplateMetadata, TemplateSnapshot};
    use serde_json::json;

    async fn seed_template(store: &MemoryEmailStore) -> EmailTemplate {
        store
            .create_template_version(NewTemplateVersion {
                name: "welcome".to_string(),
                subject: "Welcome".to_string(),
                html_content: "<p>Hi</p>".to_string(),
                text_content: None,
                metadata: TemplateMetadata::default(),
            })
            .await
            .unwrap()
    }

    fn new_row(template: &EmailTemplate, key: &str, at: DateTime<Utc>) -> NewScheduledEmail {
        NewScheduledEmail {
            idempotency_key: key.to_string(),
            user_id: None,
            email_address: "user@example.com".to_string(),
            template_id: template.id,
            template_version: template.version,
            template_snapshot: TemplateSnapshot::from_template(template, None),
            variables: json!({}),
            flow_id: None,
            flow_step_id: None,
            flow_trigger_id: None,
            triggered_at: None,
            scheduled_at: at,
            is_test: false,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_batch_with_unknown_template_inserts_nothing() {
        let store = MemoryEmailStore::new();
        let template = seed_template(&store).await;
        let mut bad = new_row(&template, "b", Utc::now());
        bad.template_id = Uuid::new_v4();

        let result = store
            .insert_scheduled(vec![new_row(&template, "a", Utc::now()), bad])
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        let all = store
            .list_scheduled(&ScheduledEmailFilter {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_claim_due_orders_earliest_first_and_skips_future() {
        let store = MemoryEmailStore::new();
        let template = seed_template(&store).await;
        let now = Utc::now();
        store
            .insert_scheduled(vec![
                new_row(&template, "late", now - chrono::Duration::minutes(1)),
                new_row(&template, "early", now - chrono::Duration::minutes(10)),
                new_row(&template, "future", now + chrono::Duration::minutes(10)),
            ])
            .await
            .unwrap();

        let claimed = store.claim_due(now, 10, "w1").await.unwrap();
        let keys: Vec<&str> = claimed.iter().map(|e| e.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["early", "late"]);
        assert!(claimed.iter().all(|e| e.status == EmailStatus::Sending));
        assert!(store.claim_due(now, 10, "w2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_respects_source_states() {
        let store = MemoryEmailStore::new();
        let template = seed_template(&store).await;
        let inserted = store
            .insert_scheduled(vec![new_row(&template, "k", Utc::now())])
            .await
            .unwrap();
        let id = inserted[0].email.id;

        let sent = store
            .transition(
                id,
                &[EmailStatus::Sending],
                StatusUpdate::Sent {
                    resend_email_id: Some("re_1".into()),
                    sent_at: Utc::now(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(sent.is_none(), "pending row must not jump to sent");
    }

    #[tokio::test]
    async fn test_remove_step_keeps_order_contiguous() {
        let store = MemoryEmailStore::new();
        let template = seed_template(&store).await;
        let flow = store
            .create_flow(NewFlow {
                name: "Onboarding".into(),
                description: None,
                trigger_event: "signup".into(),
                cancel_events: vec![],
                is_active: true,
            })
            .await
            .unwrap();
        let mut ids = Vec::new();
        for offset in [0, 60, 120] {
            let step = store
                .add_flow_step(NewFlowStep {
                    flow_id: flow.id,
                    time_offset_minutes: offset,
                    template_id: template.id,
                    template_version: None,
                    subject_override: None,
                    email_type: Default::default(),
                    metadata: json!({}),
                })
                .await
                .unwrap();
            ids.push(step.id);
        }

        store.remove_flow_step(flow.id, ids[0]).await.unwrap();

        let steps = store.get_flow_steps(flow.id).await.unwrap();
        let orders: Vec<i32> = steps.iter().map(|s| s.step_order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(steps[0].time_offset_minutes, 60);
    }

    #[tokio::test]
    async fn test_suppression_matches_case_insensitively_and_by_user() {
        let store = MemoryEmailStore::new();
        let user_id = Uuid::new_v4();
        store
            .add_suppression(NewSuppression {
                email_address: "Someone@Example.com".into(),
                user_id: Some(user_id),
                reason: SuppressionReason::Bounced,
                source: SuppressionSource::Webhook,
            })
            .await
            .unwrap();

        assert!(store
            .find_suppression("someone@example.com", None)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_suppression("other@example.com", Some(user_id))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_suppression("other@example.com", None)
            .await
            .unwrap()
            .is_none());
    }
}
