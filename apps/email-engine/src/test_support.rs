//! Fixtures shared by the unit tests.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::models::scheduled::{NewScheduledEmail, ScheduledEmail};
use crate::models::template::{EmailTemplate, NewTemplateVersion, TemplateMetadata, TemplateSnapshot};
use crate::store::{LedgerStore, MemoryEmailStore, TemplateStore};

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

/// Creates and activates the next version of `name`.
pub async fn seed_template<S: TemplateStore + ?Sized>(store: &S, name: &str) -> EmailTemplate {
    let created = store
        .create_template_version(NewTemplateVersion {
            name: name.to_string(),
            subject: format!("{name}: hello {{{{first_name}}}}"),
            html_content: "<p>Hi {{first_name}}</p><a href=\"{{unsubscribe_url}}\">unsubscribe</a>"
                .to_string(),
            text_content: Some("Hi {{first_name}}".to_string()),
            metadata: TemplateMetadata::default(),
        })
        .await
        .unwrap();
    store
        .activate_template(&created.name, created.version)
        .await
        .unwrap()
}

pub fn new_email(
    template: &EmailTemplate,
    key: &str,
    address: &str,
    scheduled_at: DateTime<Utc>,
) -> NewScheduledEmail {
    NewScheduledEmail {
        idempotency_key: key.to_string(),
        user_id: None,
        email_address: address.to_string(),
        template_id: template.id,
        template_version: template.version,
        template_snapshot: TemplateSnapshot::from_template(template, None),
        variables: json!({"first_name": "Ada"}),
        flow_id: None,
        flow_step_id: None,
        flow_trigger_id: None,
        triggered_at: None,
        scheduled_at,
        is_test: false,
        metadata: json!({}),
    }
}

pub async fn insert_email(
    store: &MemoryEmailStore,
    template: &EmailTemplate,
    key: &str,
    scheduled_at: DateTime<Utc>,
) -> ScheduledEmail {
    store
        .insert_scheduled(vec![new_email(template, key, "ada@example.com", scheduled_at)])
        .await
        .unwrap()
        .remove(0)
        .email
}
