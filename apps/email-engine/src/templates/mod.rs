//! Template Store operations: versioned named templates with at most one active
//! version per name, plus preview rendering.

pub mod handlers;
pub mod render;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::template::{
    EmailTemplate, NewTemplateVersion, TemplateMetadata, TemplateSnapshot,
};
use crate::store::{EmailStore, TemplateStore};
use crate::templates::render::{render_snapshot, unsubscribe_link, RenderedEmail};

#[derive(Debug, Clone)]
pub struct CreateTemplate {
    pub name: String,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    pub metadata: TemplateMetadata,
    pub activate: bool,
}

/// Stores the next version of `name`, activating it when asked.
pub async fn create_version(
    store: &dyn EmailStore,
    request: CreateTemplate,
) -> Result<EmailTemplate, AppError> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if request.subject.trim().is_empty() {
        return Err(AppError::Validation("subject cannot be empty".to_string()));
    }
    if request.html_content.trim().is_empty() {
        return Err(AppError::Validation("htmlContent cannot be empty".to_string()));
    }

    let created = store
        .create_template_version(NewTemplateVersion {
            name,
            subject: request.subject,
            html_content: request.html_content,
            text_content: request.text_content.filter(|t| !t.trim().is_empty()),
            metadata: request.metadata,
        })
        .await?;

    if request.activate {
        return store.activate_template(&created.name, created.version).await;
    }
    Ok(created)
}

pub async fn activate(
    store: &dyn EmailStore,
    name: &str,
    version: i32,
) -> Result<EmailTemplate, AppError> {
    let activated = store.activate_template(name, version).await?;
    info!("Template '{name}' now serving version {version}");
    Ok(activated)
}

pub async fn get_active(store: &dyn EmailStore, name: &str) -> Result<EmailTemplate, AppError> {
    store
        .get_active_template(name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No active version of template '{name}'")))
}

/// Picks the template row a send should snapshot.
///
/// A pinned version is looked up under the referenced template's name. Without a
/// pin the active version of that name wins, falling back to the referenced row
/// when nothing is active.
pub async fn resolve(
    store: &dyn EmailStore,
    template_id: Uuid,
    version: Option<i32>,
) -> Result<EmailTemplate, AppError> {
    let referenced = store
        .get_template(template_id)
        .await?
        .ok_or_else(|| AppError::Validation(format!("Unknown template id {template_id}")))?;

    match version {
        Some(v) if v == referenced.version => Ok(referenced),
        Some(v) => store
            .get_template_version(&referenced.name, v)
            .await?
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Template '{}' has no version {v}",
                    referenced.name
                ))
            }),
        None => {
            let active = store.get_active_template(&referenced.name).await?;
            Ok(active.unwrap_or(referenced))
        }
    }
}

/// Renders a stored template with sample variables.
pub async fn preview(
    store: &dyn EmailStore,
    template_id: Uuid,
    variables: &Value,
    unsubscribe_base_url: &str,
) -> Result<RenderedEmail, AppError> {
    let template = store
        .get_template(template_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Template {template_id} not found")))?;

    let snapshot = TemplateSnapshot::from_template(&template, None);
    let unsubscribe_url = unsubscribe_link(unsubscribe_base_url, "preview@example.com");
    render_snapshot(&snapshot, variables, &unsubscribe_url)
        .map_err(|e| AppError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEmailStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn request(name: &str, subject: &str, activate: bool) -> CreateTemplate {
        CreateTemplate {
            name: name.to_string(),
            subject: subject.to_string(),
            html_content: "<p>Hi {{first_name}}</p>".to_string(),
            text_content: None,
            metadata: TemplateMetadata::default(),
            activate,
        }
    }

    #[tokio::test]
    async fn test_versions_are_assigned_per_name() {
        let store = MemoryEmailStore::new();
        let a1 = create_version(&store, request("welcome", "v1", false)).await.unwrap();
        let a2 = create_version(&store, request("welcome", "v2", false)).await.unwrap();
        let b1 = create_version(&store, request("nudge", "v1", false)).await.unwrap();
        assert_eq!((a1.version, a2.version, b1.version), (1, 2, 1));
    }

    #[tokio::test]
    async fn test_get_active_without_activation_is_not_found() {
        let store = MemoryEmailStore::new();
        create_version(&store, request("welcome", "v1", false)).await.unwrap();
        let err = get_active(&store, "welcome").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_activate_unknown_version_is_not_found() {
        let store = MemoryEmailStore::new();
        create_version(&store, request("welcome", "v1", true)).await.unwrap();
        let err = activate(&store, "welcome", 7).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(get_active(&store, "welcome").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_empty_subject_is_rejected() {
        let store = MemoryEmailStore::new();
        let err = create_version(&store, request("welcome", "  ", false)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_random_activation_sequences_keep_one_active() {
        let store = MemoryEmailStore::new();
        for i in 0..5 {
            create_version(&store, request("welcome", &format!("v{i}"), false))
                .await
                .unwrap();
            create_version(&store, request("nudge", &format!("v{i}"), false))
                .await
                .unwrap();
        }

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let name = if rng.gen_bool(0.5) { "welcome" } else { "nudge" };
            let version = rng.gen_range(1..=6);
            let result = activate(&store, name, version).await;
            assert_eq!(result.is_ok(), version <= 5);

            for checked in ["welcome", "nudge"] {
                let active = store
                    .list_templates()
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|t| t.name == checked && t.is_active)
                    .count();
                assert!(active <= 1, "{checked} has {active} active versions");
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_prefers_pin_then_active() {
        let store = MemoryEmailStore::new();
        let v1 = create_version(&store, request("welcome", "v1", false)).await.unwrap();
        let v2 = create_version(&store, request("welcome", "v2", true)).await.unwrap();

        assert_eq!(resolve(&store, v1.id, Some(1)).await.unwrap().id, v1.id);
        assert_eq!(resolve(&store, v1.id, None).await.unwrap().id, v2.id);
        let err = resolve(&store, v1.id, Some(9)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = resolve(&store, Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_preview_substitutes_variables() {
        let store = MemoryEmailStore::new();
        let t = create_version(&store, request("welcome", "Hi {{first_name}}", false))
            .await
            .unwrap();
        let rendered = preview(&store, t.id, &json!({"first_name": "Ada"}), "https://x/unsub")
            .await
            .unwrap();
        assert_eq!(rendered.html, "<p>Hi Ada</p>");
        assert_eq!(rendered.subject, "Hi Ada");

        let err = preview(&store, t.id, &json!({}), "https://x/unsub").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
