//! Outbound provider seam.
//!
//! `ResendProvider` is the production backend; the dispatch worker and the
//! cancel path only see `Arc<dyn EmailProvider>`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Network failures, 429 and 5xx may succeed later; any other rejection won't.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Parse(_) => false,
        }
    }
}

/// A fully rendered message ready for the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    /// Forwarded as the provider's `Idempotency-Key`.
    pub idempotency_key: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    /// Set for provider-side scheduling; `None` sends immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub id: String,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<ProviderReceipt, ProviderError>;

    /// Cancels a send previously accepted with a `scheduled_at`.
    async fn cancel_scheduled(&self, provider_id: &str) -> Result<(), ProviderError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Resend
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ResendSendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<ResendTag>,
}

#[derive(Debug, Serialize)]
struct ResendTag {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ResendSendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResendErrorBody {
    message: String,
}

/// Resend REST client.
#[derive(Clone)]
pub struct ResendProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ResendProvider {
    pub fn new(api_key: String, base_url: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ResendErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        warn!("Resend returned {status}: {message}");
        ProviderError::Api { status, message }
    }
}

#[async_trait]
impl EmailProvider for ResendProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<ProviderReceipt, ProviderError> {
        let body = ResendSendRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            text: email.text.as_deref(),
            scheduled_at: email
                .scheduled_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            tags: email
                .tags
                .iter()
                .map(|(name, value)| ResendTag {
                    name: tag_safe(name),
                    value: tag_safe(value),
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &email.idempotency_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let parsed: ResendSendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        debug!("Resend accepted {} as {}", email.idempotency_key, parsed.id);
        Ok(ProviderReceipt { id: parsed.id })
    }

    async fn cancel_scheduled(&self, provider_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!("{}/emails/{provider_id}/cancel", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }
}

/// Resend tags accept ASCII letters, digits, `_` and `-` only.
fn tag_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Recording double
// ────────────────────────────────────────────────────────────────────────────
