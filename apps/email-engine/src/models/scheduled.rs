use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::template::TemplateSnapshot;

/// Lifecycle of a ledger row.
///
/// `sending` is the dispatch claim: a row in `sending` belongs to exactly one
/// worker invocation and is invisible to both the due-row query and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Pending,
    Scheduled,
    Sending,
    Sent,
    Cancelled,
    Failed,
    Suppressed,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 7] = [
        EmailStatus::Pending,
        EmailStatus::Scheduled,
        EmailStatus::Sending,
        EmailStatus::Sent,
        EmailStatus::Cancelled,
        EmailStatus::Failed,
        EmailStatus::Suppressed,
    ];

    /// States a cancel request may move out of.
    pub const CANCELLABLE: [EmailStatus; 2] = [EmailStatus::Pending, EmailStatus::Scheduled];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Scheduled => "scheduled",
            EmailStatus::Sending => "sending",
            EmailStatus::Sent => "sent",
            EmailStatus::Cancelled => "cancelled",
            EmailStatus::Failed => "failed",
            EmailStatus::Suppressed => "suppressed",
        }
    }

    /// `failed` is excluded: it stays retry-eligible until the policy gives up.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmailStatus::Sent | EmailStatus::Cancelled | EmailStatus::Suppressed
        )
    }

    /// An instance with any row in one of these states is still active.
    pub fn is_open(&self) -> bool {
        matches!(self, EmailStatus::Pending | EmailStatus::Scheduled)
    }

    pub fn can_transition_to(&self, next: EmailStatus) -> bool {
        use EmailStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled | Cancelled | Suppressed | Sending)
                | (Scheduled, Sent | Cancelled | Failed | Suppressed | Sending)
                | (Sending, Sent | Failed | Suppressed | Scheduled)
                | (Failed, Scheduled)
        )
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown email status '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Bounced,
    Complained,
    Unsubscribed,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::Bounced => "bounced",
            SuppressionReason::Complained => "complained",
            SuppressionReason::Unsubscribed => "unsubscribed",
        }
    }
}

impl FromStr for SuppressionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bounced" => Ok(SuppressionReason::Bounced),
            "complained" => Ok(SuppressionReason::Complained),
            "unsubscribed" => Ok(SuppressionReason::Unsubscribed),
            other => Err(format!("unknown suppression reason '{other}'")),
        }
    }
}

/// One row of the scheduled-email ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: Uuid,
    pub idempotency_key: String,
    pub user_id: Option<Uuid>,
    pub email_address: String,
    pub template_id: Uuid,
    pub template_version: i32,
    pub template_snapshot: TemplateSnapshot,
    pub variables: Value,
    pub flow_id: Option<Uuid>,
    pub flow_step_id: Option<Uuid>,
    pub flow_trigger_id: Option<Uuid>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub status: EmailStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub suppression_reason: Option<SuppressionReason>,
    pub is_test: bool,
    pub metadata: Value,
    pub resend_email_id: Option<String>,
    pub resend_scheduled_id: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledEmail {
    /// The provider holds this send and its time has come, so it may already be out.
    pub fn provider_send_due(&self, now: DateTime<Utc>) -> bool {
        self.resend_scheduled_id.is_some() && self.scheduled_at <= now
    }
}

/// Insert payload for a ledger row. Always created in `pending`.
#[derive(Debug, Clone)]
pub struct NewScheduledEmail {
    pub idempotency_key: String,
    pub user_id: Option<Uuid>,
    pub email_address: String,
    pub template_id: Uuid,
    pub template_version: i32,
    pub template_snapshot: TemplateSnapshot,
    pub variables: Value,
    pub flow_id: Option<Uuid>,
    pub flow_step_id: Option<Uuid>,
    pub flow_trigger_id: Option<Uuid>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub is_test: bool,
    pub metadata: Value,
}

impl NewScheduledEmail {
    /// Materializes the row as it is stored on insert.
    pub fn into_row(self, id: Uuid, now: DateTime<Utc>) -> ScheduledEmail {
        ScheduledEmail {
            id,
            idempotency_key: self.idempotency_key,
            user_id: self.user_id,
            email_address: self.email_address,
            template_id: self.template_id,
            template_version: self.template_version,
            template_snapshot: self.template_snapshot,
            variables: self.variables,
            flow_id: self.flow_id,
            flow_step_id: self.flow_step_id,
            flow_trigger_id: self.flow_trigger_id,
            triggered_at: self.triggered_at,
            status: EmailStatus::Pending,
            scheduled_at: self.scheduled_at,
            sent_at: None,
            cancelled_at: None,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
            last_error: None,
            suppression_reason: None,
            is_test: self.is_test,
            metadata: self.metadata,
            resend_email_id: None,
            resend_scheduled_id: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of an idempotent insert: `created == false` means the key already existed
/// and `email` is the original row.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub email: ScheduledEmail,
    pub created: bool,
}

/// Status change applied by a conditional transition.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Sent {
        resend_email_id: Option<String>,
        sent_at: DateTime<Utc>,
    },
    /// The provider accepted a future send; the row waits for its `scheduled_at`.
    ProviderScheduled {
        resend_scheduled_id: String,
    },
    Failed {
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
    },
    Suppressed {
        reason: SuppressionReason,
    },
    Cancelled {
        at: DateTime<Utc>,
    },
}

impl StatusUpdate {
    pub fn target(&self) -> EmailStatus {
        match self {
            StatusUpdate::Sent { .. } => EmailStatus::Sent,
            StatusUpdate::ProviderScheduled { .. } => EmailStatus::Scheduled,
            StatusUpdate::Failed { .. } => EmailStatus::Failed,
            StatusUpdate::Suppressed { .. } => EmailStatus::Suppressed,
            StatusUpdate::Cancelled { .. } => EmailStatus::Cancelled,
        }
    }

    /// Applies the update in place. The caller has already checked the source status.
    pub fn apply(&self, row: &mut ScheduledEmail, now: DateTime<Utc>) {
        row.status = self.target();
        row.updated_at = now;
        match self {
            StatusUpdate::Sent {
                resend_email_id,
                sent_at,
            } => {
                row.sent_at = Some(*sent_at);
                if resend_email_id.is_some() {
                    row.resend_email_id = resend_email_id.clone();
                }
                row.last_error = None;
            }
            StatusUpdate::ProviderScheduled {
                resend_scheduled_id,
            } => {
                row.resend_scheduled_id = Some(resend_scheduled_id.clone());
                row.resend_email_id = Some(resend_scheduled_id.clone());
            }
            StatusUpdate::Failed {
                error,
                next_retry_at,
            } => {
                row.last_error = Some(error.clone());
                row.next_retry_at = *next_retry_at;
            }
            StatusUpdate::Suppressed { reason } => {
                row.suppression_reason = Some(*reason);
            }
            StatusUpdate::Cancelled { at } => {
                row.cancelled_at = Some(*at);
            }
        }
        row.claimed_by = None;
        row.claimed_at = None;
    }
}

/// Which open rows a bulk cancel applies to.
#[derive(Debug, Clone, Copy)]
pub enum CancelSelector {
    Instance(Uuid),
    UserAndFlow { user_id: Uuid, flow_id: Uuid },
}

impl CancelSelector {
    pub fn matches(&self, row: &ScheduledEmail) -> bool {
        match self {
            CancelSelector::Instance(id) => row.flow_trigger_id == Some(*id),
            CancelSelector::UserAndFlow { user_id, flow_id } => {
                row.user_id == Some(*user_id) && row.flow_id == Some(*flow_id)
            }
        }
    }
}

/// Ledger listing filter. `limit` is already clamped by the caller.
#[derive(Debug, Clone, Default)]
pub struct ScheduledEmailFilter {
    pub status: Option<EmailStatus>,
    pub is_test: Option<bool>,
    pub user_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
    pub flow_trigger_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl ScheduledEmailFilter {
    pub fn matches(&self, row: &ScheduledEmail) -> bool {
        self.status.map_or(true, |s| row.status == s)
            && self.is_test.map_or(true, |t| row.is_test == t)
            && self.user_id.map_or(true, |u| row.user_id == Some(u))
            && self.flow_id.map_or(true, |f| row.flow_id == Some(f))
            && self
                .flow_trigger_id
                .map_or(true, |t| row.flow_trigger_id == Some(t))
    }
}
