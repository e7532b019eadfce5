use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use super::{FlowStore, LedgerStore, SuppressionStore, TemplateStore};
use crate::errors::{conflict_on_unique, AppError};
use crate::models::flow::{EmailFlow, EmailFlowStep, FlowStats, NewFlow, NewFlowStep};
use crate::models::scheduled::{
    CancelSelector, EmailStatus, Inserted, NewScheduledEmail, ScheduledEmail,
    ScheduledEmailFilter, StatusUpdate,
};
use crate::models::suppression::{normalize_address, NewSuppression, Suppression};
use crate::models::template::{EmailTemplate, NewTemplateVersion, TemplateMetadata, TemplateSnapshot};

/// PostgreSQL-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgEmailStore {
    pool: PgPool,
}

impl PgEmailStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Row records (TEXT columns decoded into typed enums on the way out)
// ────────────────────────────────────────────────────────────────────────────

#[derive(FromRow)]
struct TemplateRecord {
    id: Uuid,
    name: String,
    version: i32,
    subject: String,
    html_content: String,
    text_content: Option<String>,
    is_active: bool,
    metadata: Json<TemplateMetadata>,
    created_at: DateTime<Utc>,
}

impl From<TemplateRecord> for EmailTemplate {
    fn from(r: TemplateRecord) -> Self {
        EmailTemplate {
            id: r.id,
            name: r.name,
            version: r.version,
            subject: r.subject,
            html_content: r.html_content,
            text_content: r.text_content,
            is_active: r.is_active,
            metadata: r.metadata.0,
            created_at: r.created_at,
        }
    }
}

#[derive(FromRow)]
struct FlowStatsRecord {
    flow_id: Uuid,
    pending: i64,
    scheduled: i64,
    sending: i64,
    sent: i64,
    cancelled: i64,
    failed: i64,
    suppressed: i64,
    total: i64,
    unique_users: i64,
    test_count: i64,
    production_count: i64,
    active_instances: i64,
}

impl From<FlowStatsRecord> for FlowStats {
    fn from(r: FlowStatsRecord) -> Self {
        let n = |v: i64| u64::try_from(v).unwrap_or_default();
        FlowStats {
            pending: n(r.pending),
            scheduled: n(r.scheduled),
            sending: n(r.sending),
            sent: n(r.sent),
            cancelled: n(r.cancelled),
            failed: n(r.failed),
            suppressed: n(r.suppressed),
            total: n(r.total),
            unique_users: n(r.unique_users),
            test_count: n(r.test_count),
            production_count: n(r.production_count),
            active_instances: n(r.active_instances),
        }
    }
}

#[derive(FromRow)]
struct ScheduledEmailRecord {
    id: Uuid,
    idempotency_key: String,
    user_id: Option<Uuid>,
    email_address: String,
    template_id: Uuid,
    template_version: i32,
    template_snapshot: Json<TemplateSnapshot>,
    variables: Value,
    flow_id: Option<Uuid>,
    flow_step_id: Option<Uuid>,
    flow_trigger_id: Option<Uuid>,
    triggered_at: Option<DateTime<Utc>>,
    status: String,
    scheduled_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_retry_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    suppression_reason: Option<String>,
    is_test: bool,
    metadata: Value,
    resend_email_id: Option<String>,
    resend_scheduled_id: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduledEmailRecord> for ScheduledEmail {
    type Error = AppError;

    fn try_from(r: ScheduledEmailRecord) -> Result<Self, Self::Error> {
        Ok(ScheduledEmail {
            id: r.id,
            idempotency_key: r.idempotency_key,
            user_id: r.user_id,
            email_address: r.email_address,
            template_id: r.template_id,
            template_version: r.template_version,
            template_snapshot: r.template_snapshot.0,
            variables: r.variables,
            flow_id: r.flow_id,
            flow_step_id: r.flow_step_id,
            flow_trigger_id: r.flow_trigger_id,
            triggered_at: r.triggered_at,
            status: r.status.parse().map_err(decode_error)?,
            scheduled_at: r.scheduled_at,
            sent_at: r.sent_at,
            cancelled_at: r.cancelled_at,
            retry_count: r.retry_count,
            last_retry_at: r.last_retry_at,
            next_retry_at: r.next_retry_at,
            last_error: r.last_error,
            suppression_reason: r
                .suppression_reason
                .map(|s| s.parse())
                .transpose()
                .map_err(decode_error)?,
            is_test: r.is_test,
            metadata: r.metadata,
            resend_email_id: r.resend_email_id,
            resend_scheduled_id: r.resend_scheduled_id,
            claimed_by: r.claimed_by,
            claimed_at: r.claimed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct FlowRecord {
    id: Uuid,
    name: String,
    description: Option<String>,
    trigger_event: String,
    cancel_events: Vec<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<FlowRecord> for EmailFlow {
    fn from(r: FlowRecord) -> Self {
        EmailFlow {
            id: r.id,
            name: r.name,
            description: r.description,
            trigger_event: r.trigger_event,
            cancel_events: r.cancel_events,
            is_active: r.is_active,
            created_at: r.created_at,
        }
    }
}

#[derive(FromRow)]
struct FlowStepRecord {
    id: Uuid,
    flow_id: Uuid,
    step_order: i32,
    time_offset_minutes: i32,
    template_id: Uuid,
    template_version: Option<i32>,
    subject_override: Option<String>,
    email_type: String,
    metadata: Value,
}

impl TryFrom<FlowStepRecord> for EmailFlowStep {
    type Error = AppError;

    fn try_from(r: FlowStepRecord) -> Result<Self, Self::Error> {
        Ok(EmailFlowStep {
            id: r.id,
            flow_id: r.flow_id,
            step_order: r.step_order,
            time_offset_minutes: r.time_offset_minutes,
            template_id: r.template_id,
            template_version: r.template_version,
            subject_override: r.subject_override,
            email_type: r.email_type.parse().map_err(decode_error)?,
            metadata: r.metadata,
        })
    }
}

#[derive(FromRow)]
struct SuppressionRecord {
    id: Uuid,
    email_address: String,
    user_id: Option<Uuid>,
    reason: String,
    source: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SuppressionRecord> for Suppression {
    type Error = AppError;

    fn try_from(r: SuppressionRecord) -> Result<Self, Self::Error> {
        Ok(Suppression {
            id: r.id,
            email_address: r.email_address,
            user_id: r.user_id,
            reason: r.reason.parse().map_err(decode_error)?,
            source: r.source.parse().map_err(decode_error)?,
            created_at: r.created_at,
        })
    }
}

fn decode_error(msg: String) -> AppError {
    AppError::Internal(anyhow::anyhow!("corrupt row: {msg}"))
}

fn convert_all<R, T>(records: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    records.into_iter().map(T::try_from).collect()
}

fn status_list(statuses: &[EmailStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Templates
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl TemplateStore for PgEmailStore {
    async fn list_templates(&self) -> Result<Vec<EmailTemplate>, AppError> {
        let records = sqlx::query_as::<_, TemplateRecord>(
            "SELECT * FROM email_templates ORDER BY name ASC, version DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(EmailTemplate::from).collect())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, AppError> {
        Ok(
            sqlx::query_as::<_, TemplateRecord>("SELECT * FROM email_templates WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .map(EmailTemplate::from),
        )
    }

    async fn get_template_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<EmailTemplate>, AppError> {
        Ok(sqlx::query_as::<_, TemplateRecord>(
            "SELECT * FROM email_templates WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .map(EmailTemplate::from))
    }

    async fn get_active_template(&self, name: &str) -> Result<Option<EmailTemplate>, AppError> {
        Ok(sqlx::query_as::<_, TemplateRecord>(
            "SELECT * FROM email_templates WHERE name = $1 AND is_active",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .map(EmailTemplate::from))
    }

    async fn create_template_version(
        &self,
        new: NewTemplateVersion,
    ) -> Result<EmailTemplate, AppError> {
        // Version assignment and insert are one statement; a concurrent insert of the
        // same name loses on UNIQUE (name, version).
        let record = sqlx::query_as::<_, TemplateRecord>(
            r#"
            INSERT INTO email_templates
                (id, name, version, subject, html_content, text_content, is_active, metadata)
            SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3, $4, $5, FALSE, $6
            FROM email_templates
            WHERE name = $2
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.subject)
        .bind(&new.html_content)
        .bind(&new.text_content)
        .bind(Json(&new.metadata))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "template version"))?;

        info!(
            "Created template {} version {}",
            record.name, record.version
        );
        Ok(record.into())
    }

    async fn activate_template(
        &self,
        name: &str,
        version: i32,
    ) -> Result<EmailTemplate, AppError> {
        let mut tx = self.pool.begin().await?;

        // Lock every version of the name so concurrent activations serialize.
        let versions: Vec<i32> = sqlx::query_scalar(
            "SELECT version FROM email_templates WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_all(&mut *tx)
        .await?;
        if !versions.contains(&version) {
            return Err(AppError::NotFound(format!(
                "Template {name} version {version} not found"
            )));
        }

        // Two statements: the partial unique index is checked per row, so the
        // old active row has to be cleared before the new one is set.
        sqlx::query("UPDATE email_templates SET is_active = FALSE WHERE name = $1 AND is_active")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let record = sqlx::query_as::<_, TemplateRecord>(
            "UPDATE email_templates SET is_active = TRUE WHERE name = $1 AND version = $2 RETURNING *",
        )
        .bind(name)
        .bind(version)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("Activated template {name} version {version}");
        Ok(record.into())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Ledger
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for PgEmailStore {
    async fn insert_scheduled(
        &self,
        rows: Vec<NewScheduledEmail>,
    ) -> Result<Vec<Inserted>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(rows.len());

        for row in rows {
            let inserted = sqlx::query_as::<_, ScheduledEmailRecord>(
                r#"
                INSERT INTO scheduled_emails
                    (id, idempotency_key, user_id, email_address, template_id, template_version,
                     template_snapshot, variables, flow_id, flow_step_id, flow_trigger_id,
                     triggered_at, status, scheduled_at, is_test, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending', $13, $14, $15)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&row.idempotency_key)
            .bind(row.user_id)
            .bind(&row.email_address)
            .bind(row.template_id)
            .bind(row.template_version)
            .bind(Json(&row.template_snapshot))
            .bind(&row.variables)
            .bind(row.flow_id)
            .bind(row.flow_step_id)
            .bind(row.flow_trigger_id)
            .bind(row.triggered_at)
            .bind(row.scheduled_at)
            .bind(row.is_test)
            .bind(&row.metadata)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    AppError::Validation(format!(
                        "Template {} or flow reference does not exist",
                        row.template_id
                    ))
                }
                _ => AppError::Database(e),
            })?;

            let inserted = match inserted {
                Some(record) => Inserted {
                    email: record.try_into()?,
                    created: true,
                },
                None => {
                    let existing = sqlx::query_as::<_, ScheduledEmailRecord>(
                        "SELECT * FROM scheduled_emails WHERE idempotency_key = $1",
                    )
                    .bind(&row.idempotency_key)
                    .fetch_one(&mut *tx)
                    .await?;
                    Inserted {
                        email: existing.try_into()?,
                        created: false,
                    }
                }
            };
            results.push(inserted);
        }

        tx.commit().await?;
        Ok(results)
    }

    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledEmail>, AppError> {
        sqlx::query_as::<_, ScheduledEmailRecord>("SELECT * FROM scheduled_emails WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScheduledEmail::try_from)
            .transpose()
    }

    async fn list_scheduled(
        &self,
        filter: &ScheduledEmailFilter,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let records = sqlx::query_as::<_, ScheduledEmailRecord>(
            r#"
            SELECT * FROM scheduled_emails
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::boolean IS NULL OR is_test = $2)
              AND ($3::uuid IS NULL OR user_id = $3)
              AND ($4::uuid IS NULL OR flow_id = $4)
              AND ($5::uuid IS NULL OR flow_trigger_id = $5)
            ORDER BY scheduled_at DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.is_test)
        .bind(filter.user_id)
        .bind(filter.flow_id)
        .bind(filter.flow_trigger_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[EmailStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledEmail>, AppError> {
        let mut sent_at = None;
        let mut resend_email_id = None;
        let mut resend_scheduled_id = None;
        let mut last_error = None;
        let mut next_retry_at = None;
        let mut suppression_reason = None;
        let mut cancelled_at = None;
        match &update {
            StatusUpdate::Sent {
                resend_email_id: provider_id,
                sent_at: at,
            } => {
                sent_at = Some(*at);
                resend_email_id = provider_id.clone();
            }
            StatusUpdate::ProviderScheduled {
                resend_scheduled_id: provider_id,
            } => {
                resend_email_id = Some(provider_id.clone());
                resend_scheduled_id = Some(provider_id.clone());
            }
            StatusUpdate::Failed {
                error,
                next_retry_at: retry_at,
            } => {
                last_error = Some(error.clone());
                next_retry_at = *retry_at;
            }
            StatusUpdate::Suppressed { reason } => suppression_reason = Some(reason.as_str()),
            StatusUpdate::Cancelled { at } => cancelled_at = Some(*at),
        }

        sqlx::query_as::<_, ScheduledEmailRecord>(
            r#"
            UPDATE scheduled_emails SET
                status = $3,
                updated_at = $4,
                sent_at = COALESCE($5, sent_at),
                resend_email_id = COALESCE($6, resend_email_id),
                resend_scheduled_id = COALESCE($7, resend_scheduled_id),
                last_error = CASE WHEN $3 = 'sent' THEN NULL ELSE COALESCE($8, last_error) END,
                next_retry_at = CASE WHEN $3 = 'failed' THEN $9 ELSE next_retry_at END,
                suppression_reason = COALESCE($10, suppression_reason),
                cancelled_at = COALESCE($11, cancelled_at),
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_list(from))
        .bind(update.target().as_str())
        .bind(now)
        .bind(sent_at)
        .bind(resend_email_id)
        .bind(resend_scheduled_id)
        .bind(last_error)
        .bind(next_retry_at)
        .bind(suppression_reason)
        .bind(cancelled_at)
        .fetch_optional(&self.pool)
        .await?
        .map(ScheduledEmail::try_from)
        .transpose()
    }

    async fn cancel_open(
        &self,
        selector: CancelSelector,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        const SET_CANCELLED: &str = "UPDATE scheduled_emails SET status = 'cancelled', \
             cancelled_at = $1, updated_at = $1, claimed_by = NULL, claimed_at = NULL";
        // Provider-held sends whose time has passed are left for confirmation.
        const STILL_CANCELLABLE: &str = "status IN ('pending', 'scheduled') \
             AND NOT (resend_scheduled_id IS NOT NULL AND scheduled_at <= $1)";

        let records = match selector {
            CancelSelector::Instance(flow_trigger_id) => {
                sqlx::query_as::<_, ScheduledEmailRecord>(&format!(
                    "{SET_CANCELLED} WHERE flow_trigger_id = $2 AND {STILL_CANCELLABLE} RETURNING *"
                ))
                .bind(now)
                .bind(flow_trigger_id)
                .fetch_all(&self.pool)
                .await?
            }
            CancelSelector::UserAndFlow { user_id, flow_id } => {
                sqlx::query_as::<_, ScheduledEmailRecord>(&format!(
                    "{SET_CANCELLED} WHERE user_id = $2 AND flow_id = $3 \
                     AND {STILL_CANCELLABLE} RETURNING *"
                ))
                .bind(now)
                .bind(user_id)
                .bind(flow_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        convert_all(records)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let records = sqlx::query_as::<_, ScheduledEmailRecord>(
            r#"
            UPDATE scheduled_emails SET
                status = 'sending', claimed_by = $3, claimed_at = $1, updated_at = $1
            WHERE id IN (
                SELECT id FROM scheduled_emails
                WHERE status IN ('pending', 'scheduled')
                  AND resend_scheduled_id IS NULL
                  AND scheduled_at <= $1
                ORDER BY scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            AND status IN ('pending', 'scheduled')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        let mut claimed: Vec<ScheduledEmail> = convert_all(records)?;
        claimed.sort_by_key(|e| e.scheduled_at);
        Ok(claimed)
    }

    async fn claim_for_handoff(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let records = sqlx::query_as::<_, ScheduledEmailRecord>(
            r#"
            UPDATE scheduled_emails SET
                status = 'sending', claimed_by = $4, claimed_at = $1, updated_at = $1
            WHERE id IN (
                SELECT id FROM scheduled_emails
                WHERE status = 'pending'
                  AND scheduled_at > $1
                  AND scheduled_at <= $2
                ORDER BY scheduled_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(horizon)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        let mut claimed: Vec<ScheduledEmail> = convert_all(records)?;
        claimed.sort_by_key(|e| e.scheduled_at);
        Ok(claimed)
    }

    async fn confirm_provider_scheduled(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_emails SET status = 'sent', sent_at = scheduled_at, updated_at = $1
            WHERE status = 'scheduled'
              AND resend_scheduled_id IS NOT NULL
              AND scheduled_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEmail>, AppError> {
        let records = sqlx::query_as::<_, ScheduledEmailRecord>(
            r#"
            UPDATE scheduled_emails SET
                status = 'scheduled',
                scheduled_at = GREATEST(scheduled_at, next_retry_at),
                next_retry_at = NULL,
                retry_count = retry_count + 1,
                last_retry_at = $1,
                updated_at = $1
            WHERE status = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledEmail>, AppError> {
        let records = sqlx::query_as::<_, ScheduledEmailRecord>(
            r#"
            SELECT * FROM scheduled_emails
            WHERE status = 'sending' AND (claimed_at IS NULL OR claimed_at < $1)
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn flow_stats(&self) -> Result<BTreeMap<Uuid, FlowStats>, AppError> {
        let records = sqlx::query_as::<_, FlowStatsRecord>(
            r#"
            SELECT f.id AS flow_id,
                   COUNT(e.id) FILTER (WHERE e.status = 'pending')    AS pending,
                   COUNT(e.id) FILTER (WHERE e.status = 'scheduled')  AS scheduled,
                   COUNT(e.id) FILTER (WHERE e.status = 'sending')    AS sending,
                   COUNT(e.id) FILTER (WHERE e.status = 'sent')       AS sent,
                   COUNT(e.id) FILTER (WHERE e.status = 'cancelled')  AS cancelled,
                   COUNT(e.id) FILTER (WHERE e.status = 'failed')     AS failed,
                   COUNT(e.id) FILTER (WHERE e.status = 'suppressed') AS suppressed,
                   COUNT(e.id) AS total,
                   COUNT(DISTINCT CASE
                       WHEN e.user_id IS NOT NULL THEN 'u:' || e.user_id::text
                       WHEN e.id IS NOT NULL THEN 'a:' || LOWER(TRIM(e.email_address))
                   END) AS unique_users,
                   COUNT(e.id) FILTER (WHERE e.is_test)     AS test_count,
                   COUNT(e.id) FILTER (WHERE NOT e.is_test) AS production_count,
                   COUNT(DISTINCT e.flow_trigger_id) FILTER (
                       WHERE e.status IN ('pending', 'scheduled', 'sending')
                          OR (e.status = 'failed' AND e.next_retry_at IS NOT NULL)
                   ) AS active_instances
            FROM email_flows f
            LEFT JOIN scheduled_emails e ON e.flow_id = f.id
            GROUP BY f.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records
            .into_iter()
            .map(|r| (r.flow_id, FlowStats::from(r)))
            .collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Flows
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl FlowStore for PgEmailStore {
    async fn list_flows(&self) -> Result<Vec<EmailFlow>, AppError> {
        let records =
            sqlx::query_as::<_, FlowRecord>("SELECT * FROM email_flows ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(records.into_iter().map(EmailFlow::from).collect())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<EmailFlow>, AppError> {
        Ok(
            sqlx::query_as::<_, FlowRecord>("SELECT * FROM email_flows WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .map(EmailFlow::from),
        )
    }

    async fn get_flow_steps(&self, flow_id: Uuid) -> Result<Vec<EmailFlowStep>, AppError> {
        let records = sqlx::query_as::<_, FlowStepRecord>(
            r#"
            SELECT * FROM email_flow_steps
            WHERE flow_id = $1
            ORDER BY step_order ASC, time_offset_minutes ASC
            "#,
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn create_flow(&self, new: NewFlow) -> Result<EmailFlow, AppError> {
        let record = sqlx::query_as::<_, FlowRecord>(
            r#"
            INSERT INTO email_flows (id, name, description, trigger_event, cancel_events, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.trigger_event)
        .bind(&new.cancel_events)
        .bind(new.is_active)
        .fetch_one(&self.pool)
        .await?;
        info!("Created flow '{}' ({})", record.name, record.id);
        Ok(record.into())
    }

    async fn set_flow_active(&self, id: Uuid, is_active: bool) -> Result<EmailFlow, AppError> {
        sqlx::query_as::<_, FlowRecord>(
            "UPDATE email_flows SET is_active = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(is_active)
        .fetch_optional(&self.pool)
        .await?
        .map(EmailFlow::from)
        .ok_or_else(|| AppError::NotFound(format!("Flow {id} not found")))
    }

    async fn add_flow_step(&self, new: NewFlowStep) -> Result<EmailFlowStep, AppError> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent appends to the same flow.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM email_flows WHERE id = $1 FOR UPDATE")
                .bind(new.flow_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(AppError::NotFound(format!("Flow {} not found", new.flow_id)));
        }

        let record = sqlx::query_as::<_, FlowStepRecord>(
            r#"
            INSERT INTO email_flow_steps
                (id, flow_id, step_order, time_offset_minutes, template_id, template_version,
                 subject_override, email_type, metadata)
            SELECT $1, $2, COALESCE(MAX(step_order), 0) + 1, $3, $4, $5, $6, $7, $8
            FROM email_flow_steps
            WHERE flow_id = $2
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.flow_id)
        .bind(new.time_offset_minutes)
        .bind(new.template_id)
        .bind(new.template_version)
        .bind(&new.subject_override)
        .bind(new.email_type.as_str())
        .bind(&new.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "flow step"))?;

        tx.commit().await?;
        record.try_into()
    }

    async fn remove_flow_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let removed: Option<i32> = sqlx::query_scalar(
            "DELETE FROM email_flow_steps WHERE id = $1 AND flow_id = $2 RETURNING step_order",
        )
        .bind(step_id)
        .bind(flow_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(removed_order) = removed else {
            return Err(AppError::NotFound(format!(
                "Step {step_id} not found in flow {flow_id}"
            )));
        };

        // The shift collides row-by-row with UNIQUE (flow_id, step_order) unless deferred.
        sqlx::query("SET CONSTRAINTS ALL DEFERRED")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE email_flow_steps SET step_order = step_order - 1 WHERE flow_id = $1 AND step_order > $2",
        )
        .bind(flow_id)
        .bind(removed_order)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn flows_triggered_by(&self, event: &str) -> Result<Vec<EmailFlow>, AppError> {
        let records = sqlx::query_as::<_, FlowRecord>(
            "SELECT * FROM email_flows WHERE is_active AND trigger_event = $1",
        )
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(EmailFlow::from).collect())
    }

    async fn flows_cancelled_by(&self, event: &str) -> Result<Vec<EmailFlow>, AppError> {
        let records = sqlx::query_as::<_, FlowRecord>(
            "SELECT * FROM email_flows WHERE is_active AND $1 = ANY(cancel_events)",
        )
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(EmailFlow::from).collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Suppressions
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl SuppressionStore for PgEmailStore {
    async fn list_suppressions(&self) -> Result<Vec<Suppression>, AppError> {
        let records = sqlx::query_as::<_, SuppressionRecord>(
            "SELECT * FROM email_suppressions ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(records)
    }

    async fn find_suppression(
        &self,
        email_address: &str,
        user_id: Option<Uuid>,
    ) -> Result<Option<Suppression>, AppError> {
        sqlx::query_as::<_, SuppressionRecord>(
            r#"
            SELECT * FROM email_suppressions
            WHERE email_address = $1 OR ($2::uuid IS NOT NULL AND user_id = $2)
            LIMIT 1
            "#,
        )
        .bind(normalize_address(email_address))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Suppression::try_from)
        .transpose()
    }

    async fn add_suppression(&self, new: NewSuppression) -> Result<Suppression, AppError> {
        sqlx::query_as::<_, SuppressionRecord>(
            r#"
            INSERT INTO email_suppressions (id, email_address, user_id, reason, source)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email_address) DO UPDATE SET
                reason = EXCLUDED.reason,
                source = EXCLUDED.source,
                user_id = COALESCE(EXCLUDED.user_id, email_suppressions.user_id)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(normalize_address(&new.email_address))
        .bind(new.user_id)
        .bind(new.reason.as_str())
        .bind(new.source.as_str())
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn remove_suppression(&self, email_address: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM email_suppressions WHERE email_address = $1")
            .bind(normalize_address(email_address))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// Needs a reachable Postgres in DATABASE_URL; each test gets a fresh database.
#[cfg(all(test, feature = "pg-tests"))]
mod tests {
    use super::*;
    use crate::flows::stats::compute_flow_stats;
    use crate::models::template::EmailType;
    use crate::test_support::{at, new_email, seed_template};
    use serde_json::json;

    async fn insert(store: &PgEmailStore, rows: Vec<NewScheduledEmail>) -> Vec<ScheduledEmail> {
        store
            .insert_scheduled(rows)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.email)
            .collect()
    }

    async fn flow(store: &PgEmailStore, name: &str) -> EmailFlow {
        store
            .create_flow(NewFlow {
                name: name.to_string(),
                description: None,
                trigger_event: format!("{name}_started"),
                cancel_events: vec![],
                is_active: true,
            })
            .await
            .unwrap()
    }

    fn step(flow_id: Uuid, template_id: Uuid, offset: i32) -> NewFlowStep {
        NewFlowStep {
            flow_id,
            time_offset_minutes: offset,
            template_id,
            template_version: None,
            subject_override: None,
            email_type: EmailType::Transactional,
            metadata: json!({}),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_concurrent_claims_never_share_a_row(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "claim").await;
        let rows = (0..6)
            .map(|i| new_email(&template, &format!("due-{i}"), "a@example.com", at("2024-01-01T00:00:00Z")))
            .chain([new_email(&template, "later", "a@example.com", at("2024-01-02T00:00:00Z"))])
            .collect();
        insert(&store, rows).await;

        let now = at("2024-01-01T00:05:00Z");
        let (first, second) = tokio::join!(
            store.claim_due(now, 4, "worker-a"),
            store.claim_due(now, 4, "worker-b"),
        );
        let mut ids: Vec<Uuid> = first.unwrap().into_iter().chain(second.unwrap()).map(|e| e.id).collect();
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 6);
        assert!(store.claim_due(now, 10, "worker-c").await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_claim_skips_provider_scheduled_rows(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "handoff").await;
        let row = insert(
            &store,
            vec![new_email(&template, "handoff-1", "a@example.com", at("2024-01-01T00:30:00Z"))],
        )
        .await
        .remove(0);

        let now = at("2024-01-01T00:00:00Z");
        let claimed = store
            .claim_for_handoff(now, at("2024-01-01T01:00:00Z"), 10, "worker-a")
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        store
            .transition(
                row.id,
                &[EmailStatus::Sending],
                StatusUpdate::ProviderScheduled {
                    resend_scheduled_id: "re_1".to_string(),
                },
                now,
            )
            .await
            .unwrap()
            .unwrap();

        let later = at("2024-01-01T00:45:00Z");
        assert!(store.claim_due(later, 10, "worker-a").await.unwrap().is_empty());
        assert_eq!(store.confirm_provider_scheduled(later).await.unwrap(), 1);
        let stored = store.get_scheduled(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EmailStatus::Sent);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_transition_only_moves_expected_states(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "cancel").await;
        let row = insert(
            &store,
            vec![new_email(&template, "cancel-1", "a@example.com", at("2024-01-01T00:00:00Z"))],
        )
        .await
        .remove(0);
        let now = at("2024-01-01T00:00:00Z");

        let wrong_source = store
            .transition(
                row.id,
                &[EmailStatus::Sending],
                StatusUpdate::Sent {
                    resend_email_id: None,
                    sent_at: now,
                },
                now,
            )
            .await
            .unwrap();
        assert!(wrong_source.is_none());

        let cancelled = store
            .transition(row.id, &EmailStatus::CANCELLABLE, StatusUpdate::Cancelled { at: now }, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, EmailStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(now));

        let again = store
            .transition(row.id, &EmailStatus::CANCELLABLE, StatusUpdate::Cancelled { at: now }, now)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_cancel_open_leaves_claimed_rows(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "instance").await;
        let instance = Uuid::new_v4();
        let rows = [("inst-0", "2024-01-01T00:00:00Z"), ("inst-1", "2024-01-02T00:00:00Z")]
            .into_iter()
            .map(|(key, when)| {
                let mut new = new_email(&template, key, "a@example.com", at(when));
                new.flow_trigger_id = Some(instance);
                new
            })
            .collect();
        insert(&store, rows).await;

        let now = at("2024-01-01T00:01:00Z");
        let claimed = store.claim_due(now, 10, "worker-a").await.unwrap();
        assert_eq!(claimed.len(), 1);

        let cancelled = store.cancel_open(CancelSelector::Instance(instance), now).await.unwrap();

        assert_eq!(cancelled.len(), 1);
        assert_ne!(cancelled[0].id, claimed[0].id);
        let in_flight = store.get_scheduled(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(in_flight.status, EmailStatus::Sending);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_requeue_keeps_the_original_send_time(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "retry").await;
        let deliver_at = at("2024-01-01T01:00:00Z");
        let row = insert(&store, vec![new_email(&template, "retry-1", "a@example.com", deliver_at)])
            .await
            .remove(0);

        let now = at("2024-01-01T00:00:00Z");
        store
            .claim_for_handoff(now, at("2024-01-01T02:00:00Z"), 10, "worker-a")
            .await
            .unwrap();
        store
            .transition(
                row.id,
                &[EmailStatus::Sending],
                StatusUpdate::Failed {
                    error: "503".to_string(),
                    next_retry_at: Some(at("2024-01-01T00:01:00Z")),
                },
                now,
            )
            .await
            .unwrap()
            .unwrap();

        let requeued = store.requeue_failed(at("2024-01-01T00:01:00Z")).await.unwrap();

        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].status, EmailStatus::Scheduled);
        assert_eq!(requeued[0].retry_count, 1);
        assert_eq!(requeued[0].scheduled_at, deliver_at);
        assert!(requeued[0].next_retry_at.is_none());
        assert!(store
            .claim_due(at("2024-01-01T00:02:00Z"), 10, "worker-a")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.claim_due(deliver_at, 10, "worker-a").await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_removing_a_step_renumbers_the_rest(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "series").await;
        let series = flow(&store, "series").await;
        let mut added = Vec::new();
        for offset in [0, 60, 120, 180] {
            added.push(store.add_flow_step(step(series.id, template.id, offset)).await.unwrap());
        }

        store.remove_flow_step(series.id, added[1].id).await.unwrap();

        let steps = store.get_flow_steps(series.id).await.unwrap();
        let orders: Vec<(i32, i32)> = steps.iter().map(|s| (s.step_order, s.time_offset_minutes)).collect();
        assert_eq!(orders, vec![(1, 0), (2, 120), (3, 180)]);

        let missing = store.remove_flow_step(series.id, added[1].id).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_activation_keeps_one_active_version(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let first = seed_template(&store, "welcome").await;
        let second = seed_template(&store, "welcome").await;

        assert_eq!((first.version, second.version), (1, 2));
        store.activate_template("welcome", 1).await.unwrap();

        let active: Vec<i32> = store
            .list_templates()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.name == "welcome" && t.is_active)
            .map(|t| t.version)
            .collect();
        assert_eq!(active, vec![1]);
        let current = store.get_active_template("welcome").await.unwrap().unwrap();
        assert_eq!(current.version, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_flow_stats_match_the_in_process_fold(pool: PgPool) {
        let store = PgEmailStore::new(pool);
        let template = seed_template(&store, "stats").await;
        let busy = flow(&store, "busy").await;
        let idle = flow(&store, "idle").await;
        let user = Uuid::new_v4();
        let live = Uuid::new_v4();
        let done = Uuid::new_v4();

        let rows = [
            ("s-0", Some(user), "a@example.com", live, false),
            ("s-1", Some(user), "a@example.com", live, false),
            ("s-2", None, "A@Example.com", done, true),
            ("s-3", None, "b@example.com", done, false),
        ]
        .into_iter()
        .map(|(key, user_id, address, instance, is_test)| {
            let mut new = new_email(&template, key, address, at("2024-01-02T00:00:00Z"));
            new.user_id = user_id;
            new.flow_id = Some(busy.id);
            new.flow_trigger_id = Some(instance);
            new.is_test = is_test;
            new
        })
        .collect();
        insert(&store, rows).await;
        store
            .cancel_open(CancelSelector::Instance(done), at("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let stats = store.flow_stats().await.unwrap();

        let flows = store.list_flows().await.unwrap();
        let rows = store
            .list_scheduled(&ScheduledEmailFilter {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stats, compute_flow_stats(&flows, &rows));
        assert_eq!(stats[&idle.id], FlowStats::default());
        assert_eq!(stats[&busy.id].cancelled, 2);
        assert_eq!(stats[&busy.id].unique_users, 3);
        assert_eq!(stats[&busy.id].active_instances, 1);
    }
}
