use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    #[default]
    Transactional,
    Marketing,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::Transactional => "transactional",
            EmailType::Marketing => "marketing",
        }
    }
}

impl FromStr for EmailType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transactional" => Ok(EmailType::Transactional),
            "marketing" => Ok(EmailType::Marketing),
            other => Err(format!("unknown email type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default)]
    pub email_type: EmailType,
    /// Name of the UI component the template was exported from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    /// Placeholder replaced with the recipient's unsubscribe link, e.g. `{{unsubscribe_url}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_placeholder: Option<String>,
}

/// One immutable version of a named template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    pub is_active: bool,
    pub metadata: TemplateMetadata,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new version. The store assigns `version`.
#[derive(Debug, Clone)]
pub struct NewTemplateVersion {
    pub name: String,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    pub metadata: TemplateMetadata,
}

/// Frozen copy of a template taken when a ledger row is created. Later edits or
/// activations of the template never change what an already-scheduled row sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub name: String,
    pub version: i32,
    pub subject: String,
    pub html_content: String,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub email_type: EmailType,
    #[serde(default)]
    pub unsubscribe_placeholder: Option<String>,
}

impl TemplateSnapshot {
    pub fn from_template(template: &EmailTemplate, subject_override: Option<&str>) -> Self {
        TemplateSnapshot {
            name: template.name.clone(),
            version: template.version,
            subject: subject_override
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(&template.subject)
                .to_string(),
            html_content: template.html_content.clone(),
            text_content: template.text_content.clone(),
            email_type: template.metadata.email_type,
            unsubscribe_placeholder: template.metadata.unsubscribe_placeholder.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> EmailTemplate {
        EmailTemplate {
            id: Uuid::new_v4(),
            name: "welcome".to_string(),
            version: 2,
            subject: "Welcome aboard".to_string(),
            html_content: "<p>Hi {{first_name}}</p>".to_string(),
            text_content: None,
            is_active: true,
            metadata: TemplateMetadata {
                email_type: EmailType::Marketing,
                component: Some("WelcomeEmail".to_string()),
                unsubscribe_placeholder: Some("{{unsubscribe_url}}".to_string()),
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_copies_template_fields() {
        let snapshot = TemplateSnapshot::from_template(&template(), None);
        assert_eq!(snapshot.name, "welcome");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.subject, "Welcome aboard");
        assert_eq!(snapshot.email_type, EmailType::Marketing);
    }

    #[test]
    fn test_snapshot_applies_subject_override() {
        let snapshot = TemplateSnapshot::from_template(&template(), Some("Day 2: your resume"));
        assert_eq!(snapshot.subject, "Day 2: your resume");
    }

    #[test]
    fn test_blank_subject_override_is_ignored() {
        let snapshot = TemplateSnapshot::from_template(&template(), Some("  "));
        assert_eq!(snapshot.subject, "Welcome aboard");
    }

    #[test]
    fn test_metadata_defaults_to_transactional() {
        let metadata: TemplateMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(metadata.email_type, EmailType::Transactional);
    }
}
