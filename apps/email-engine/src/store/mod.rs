//! Persistence seams for the engine.
//!
//! Every state change on the ledger is a conditional transition: the store only
//! moves a row when its current status is one of the expected source states, and
//! reports whether it did. That predicate is the only concurrency guard between
//! HTTP handlers and dispatch workers; nothing reads a status and writes it back
//! in two steps.
//!
//! `PgEmailStore` is the production backend. `MemoryEmailStore` gives the same
//! guarantees under a single mutex and backs local runs without Postgres and the
//! test suite. `AppState` holds either as `Arc<dyn EmailStore>`.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::flow::{EmailFlow, EmailFlowStep, FlowStats, NewFlow, NewFlowStep};
use crate::models::scheduled::{
    CancelSelector, EmailStatus, Inserted, NewScheduledEmail, ScheduledEmail,
    ScheduledEmailFilter, StatusUpdate,
};
use crate::models::suppression::{NewSuppression, Suppression};
use crate::models::template::{EmailTemplate, NewTemplateVersion};

pub use memory::MemoryEmailStore;
pub use postgres::PgEmailStore;

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// All versions of all templates, by name then version descending.
    async fn list_templates(&self) -> Result<Vec<EmailTemplate>, AppError>;

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, AppError>;

    async fn get_template_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<EmailTemplate>, AppError>;

    async fn get_active_template(&self, name: &str) -> Result<Option<EmailTemplate>, AppError>;

    /// Inserts `max(version) + 1` for the name.
    async fn create_template_version(
        &self,
        new: NewTemplateVersion,
    ) -> Result<EmailTemplate, AppError>;

    /// Activates exactly one version of `name` and deactivates its siblings in a
    /// single atomic step.
    async fn activate_template(&self, name: &str, version: i32)
        -> Result<EmailTemplate, AppError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts all rows or none. Rows whose idempotency key already exists are
    /// returned as they are stored with `created == false`.
    async fn insert_scheduled(
        &self,
        rows: Vec<NewScheduledEmail>,
    ) -> Result<Vec<Inserted>, AppError>;

    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledEmail>, AppError>;

    async fn list_scheduled(
        &self,
        filter: &ScheduledEmailFilter,
    ) -> Result<Vec<ScheduledEmail>, AppError>;

    /// Moves the row to `update.target()` only if its status is one of `from`.
    /// Returns `None` when the predicate did not match.
    async fn transition(
        &self,
        id: Uuid,
        from: &[EmailStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledEmail>, AppError>;

    /// Cancels every open (`pending`/`scheduled`) row matching the selector and
    /// returns the rows that were actually transitioned. Rows the provider holds
    /// whose `scheduled_at` has passed are skipped.
    async fn cancel_open(
        &self,
        selector: CancelSelector,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEmail>, AppError>;

    /// Claims up to `limit` due rows (`pending`/`scheduled`, no provider-side
    /// schedule, `scheduled_at <= now`), earliest first, moving them to `sending`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<ScheduledEmail>, AppError>;

    /// Claims `pending` rows due in `(now, horizon]` for provider-side scheduling.
    async fn claim_for_handoff(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<ScheduledEmail>, AppError>;

    /// Marks provider-scheduled rows whose time has passed as `sent`.
    async fn confirm_provider_scheduled(&self, now: DateTime<Utc>) -> Result<u64, AppError>;

    /// Moves `failed` rows whose `next_retry_at <= now` back to `scheduled`,
    /// incrementing `retry_count`. A retry never moves a row ahead of its own
    /// `scheduled_at`.
    async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEmail>, AppError>;

    /// Rows left in `sending` by a worker that claimed them before `claimed_before`.
    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEmail>, AppError>;

    /// Aggregates for every flow, including flows with no rows yet.
    async fn flow_stats(&self) -> Result<BTreeMap<Uuid, FlowStats>, AppError>;
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn list_flows(&self) -> Result<Vec<EmailFlow>, AppError>;

    async fn get_flow(&self, id: Uuid) -> Result<Option<EmailFlow>, AppError>;

    /// Ordered by `step_order`, then `time_offset_minutes`.
    async fn get_flow_steps(&self, flow_id: Uuid) -> Result<Vec<EmailFlowStep>, AppError>;

    async fn create_flow(&self, new: NewFlow) -> Result<EmailFlow, AppError>;

    async fn set_flow_active(&self, id: Uuid, is_active: bool) -> Result<EmailFlow, AppError>;

    /// Appends the step at `max(step_order) + 1`.
    async fn add_flow_step(&self, new: NewFlowStep) -> Result<EmailFlowStep, AppError>;

    /// Deletes the step and closes the gap in `step_order`.
    async fn remove_flow_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<(), AppError>;

    async fn flows_triggered_by(&self, event: &str) -> Result<Vec<EmailFlow>, AppError>;

    async fn flows_cancelled_by(&self, event: &str) -> Result<Vec<EmailFlow>, AppError>;
}

#[async_trait]
pub trait SuppressionStore: Send + Sync {
    async fn list_suppressions(&self) -> Result<Vec<Suppression>, AppError>;

    /// Matches on the (normalized) address, or on `user_id` when given.
    async fn find_suppression(
        &self,
        email_address: &str,
        user_id: Option<Uuid>,
    ) -> Result<Option<Suppression>, AppError>;

    /// Upserts by address; an existing entry takes the new reason.
    async fn add_suppression(&self, new: NewSuppression) -> Result<Suppression, AppError>;

    async fn remove_suppression(&self, email_address: &str) -> Result<bool, AppError>;
}

/// Everything the engine persists.
pub trait EmailStore: TemplateStore + LedgerStore + FlowStore + SuppressionStore {}

impl<T> EmailStore for T where T: TemplateStore + LedgerStore + FlowStore + SuppressionStore {}
