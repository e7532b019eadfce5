use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::scheduled::SuppressionReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionSource {
    Admin,
    Webhook,
    Unsubscribe,
}

impl SuppressionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionSource::Admin => "admin",
            SuppressionSource::Webhook => "webhook",
            SuppressionSource::Unsubscribe => "unsubscribe",
        }
    }
}

impl FromStr for SuppressionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(SuppressionSource::Admin),
            "webhook" => Ok(SuppressionSource::Webhook),
            "unsubscribe" => Ok(SuppressionSource::Unsubscribe),
            other => Err(format!("unknown suppression source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suppression {
    pub id: Uuid,
    /// Always lower-cased.
    pub email_address: String,
    pub user_id: Option<Uuid>,
    pub reason: SuppressionReason,
    pub source: SuppressionSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSuppression {
    pub email_address: String,
    pub user_id: Option<Uuid>,
    pub reason: SuppressionReason,
    pub source: SuppressionSource,
}

pub fn normalize_address(email: &str) -> String {
    email.trim().to_lowercase()
}
