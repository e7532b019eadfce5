use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::template::EmailType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailFlow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger_event: String,
    pub cancel_events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailFlowStep {
    pub id: Uuid,
    pub flow_id: Uuid,
    /// 1-based and contiguous within a flow.
    pub step_order: i32,
    pub time_offset_minutes: i32,
    pub template_id: Uuid,
    /// `None` follows the active version of the template's name at trigger time.
    pub template_version: Option<i32>,
    pub subject_override: Option<String>,
    pub email_type: EmailType,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct NewFlow {
    pub name: String,
    pub description: Option<String>,
    pub trigger_event: String,
    pub cancel_events: Vec<String>,
    pub is_active: bool,
}

/// Step insert payload. `step_order` is assigned by the store as `max + 1`.
#[derive(Debug, Clone)]
pub struct NewFlowStep {
    pub flow_id: Uuid,
    pub time_offset_minutes: i32,
    pub template_id: Uuid,
    pub template_version: Option<i32>,
    pub subject_override: Option<String>,
    pub email_type: EmailType,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowWithSteps {
    pub flow: EmailFlow,
    pub steps: Vec<EmailFlowStep>,
}

/// Dispatch order: `step_order`, tie-broken by offset.
pub fn sort_steps(steps: &mut [EmailFlowStep]) {
    steps.sort_by_key(|s| (s.step_order, s.time_offset_minutes));
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub pending: u64,
    pub scheduled: u64,
    pub sending: u64,
    pub sent: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub suppressed: u64,
    pub total: u64,
    /// Distinct recipients: by user id, or by address for anonymous rows.
    pub unique_users: u64,
    pub test_count: u64,
    pub production_count: u64,
    /// Instances with at least one row that can still be sent.
    pub active_instances: u64,
}
