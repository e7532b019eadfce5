pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::flows::handlers as flows;
use crate::ledger::handlers as ledger;
use crate::state::AppState;
use crate::suppressions::handlers as suppressions;
use crate::templates::handlers as templates;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Templates
        .route(
            "/api/email/templates",
            get(templates::handle_list_templates).post(templates::handle_create_template),
        )
        .route(
            "/api/email/templates/activate",
            post(templates::handle_activate_template),
        )
        .route(
            "/api/email/templates/active/:name",
            get(templates::handle_get_active_template),
        )
        .route(
            "/api/email/templates/preview",
            post(templates::handle_preview_template),
        )
        // Ledger
        .route("/api/email/schedule", post(ledger::handle_schedule))
        .route("/api/email/scheduled", get(ledger::handle_list_scheduled))
        .route("/api/email/cancel", post(ledger::handle_cancel))
        // Flows
        .route(
            "/api/email/flows",
            get(flows::handle_list_flows).post(flows::handle_create_flow),
        )
        .route("/api/email/flows/stats", get(flows::handle_flow_stats))
        .route("/api/email/flows/trigger", post(flows::handle_trigger_flow))
        .route("/api/email/flows/cancel", post(flows::handle_cancel_flow))
        .route(
            "/api/email/flows/:id",
            get(flows::handle_get_flow).patch(flows::handle_update_flow),
        )
        .route("/api/email/flows/:id/steps", post(flows::handle_add_step))
        .route(
            "/api/email/flows/:id/steps/:step_id",
            delete(flows::handle_remove_step),
        )
        .route("/api/email/events", post(flows::handle_event))
        // Suppressions
        .route(
            "/api/email/suppressions",
            get(suppressions::handle_list_suppressions).post(suppressions::handle_suppress),
        )
        .route(
            "/api/email/suppressions/:email",
            delete(suppressions::handle_unsuppress),
        )
        .route("/api/email/unsubscribe", post(suppressions::handle_unsubscribe))
        .route(
            "/api/email/webhooks/resend",
            post(suppressions::handle_resend_webhook),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::dispatch::provider::testing::RecordingProvider;
    use crate::store::MemoryEmailStore;

    fn app() -> Router {
        build_router(AppState {
            store: Arc::new(MemoryEmailStore::new()),
            provider: Arc::new(RecordingProvider::new()),
            config: Config::for_tests(),
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // Extractor rejections answer in plain text.
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    async fn create_template(app: &Router) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/email/templates",
            Some(json!({
                "name": "welcome",
                "subject": "Welcome {{first_name}}",
                "htmlContent": "<p>Hi {{first_name}}</p>",
                "activate": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["template"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "email-engine");
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_over_http() {
        let app = app();
        let template_id = create_template(&app).await;
        let request = json!({
            "emailAddress": "ada@example.com",
            "templateId": template_id,
            "scheduledAt": "2030-01-01T00:00:00Z",
            "variables": {"first_name": "Ada"},
            "idempotencyKey": "signup-ada"
        });

        let (first_status, first) =
            call(&app, Method::POST, "/api/email/schedule", Some(request.clone())).await;
        let (second_status, second) =
            call(&app, Method::POST, "/api/email/schedule", Some(request)).await;

        assert_eq!(first_status, StatusCode::CREATED);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["scheduledEmail"]["id"], second["scheduledEmail"]["id"]);
        assert_eq!(second["created"], false);

        let (_, listed) = call(&app, Method::GET, "/api/email/scheduled?status=pending", None).await;
        assert_eq!(listed["scheduledEmails"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_accepts_empty_filters() {
        let app = app();
        let template_id = create_template(&app).await;
        call(
            &app,
            Method::POST,
            "/api/email/schedule",
            Some(json!({"emailAddress": "ada@example.com", "templateId": template_id, "isTest": true})),
        )
        .await;

        for uri in [
            "/api/email/scheduled?status=&isTest=&limit=",
            "/api/email/scheduled?isTest=&limit=100",
            "/api/email/scheduled?userId=&flowId=&flowTriggerId=&offset=",
        ] {
            let (status, body) = call(&app, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body["scheduledEmails"].as_array().unwrap().len(), 1, "{uri}");
        }

        let (_, filtered) =
            call(&app, Method::GET, "/api/email/scheduled?isTest=false&limit=", None).await;
        assert!(filtered["scheduledEmails"].as_array().unwrap().is_empty());

        let (status, _) = call(&app, Method::GET, "/api/email/scheduled?isTest=maybe", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_address_is_a_validation_error() {
        let app = app();
        let template_id = create_template(&app).await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/email/schedule",
            Some(json!({"emailAddress": "not-an-address", "templateId": template_id})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_flow_lifecycle_over_http() {
        let app = app();
        let template_id = create_template(&app).await;

        let (status, created) = call(
            &app,
            Method::POST,
            "/api/email/flows",
            Some(json!({
                "name": "Welcome Series",
                "triggerEvent": "user_signed_up",
                "cancelEvents": ["unsubscribed"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let flow_id = created["flow"]["id"].as_str().unwrap().to_string();

        for offset in [0, 1440, 4320] {
            let (status, _) = call(
                &app,
                Method::POST,
                &format!("/api/email/flows/{flow_id}/steps"),
                Some(json!({"templateId": template_id, "timeOffsetMinutes": offset})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, instance) = call(
            &app,
            Method::POST,
            "/api/email/flows/trigger",
            Some(json!({
                "flowId": flow_id,
                "emailAddress": "sam@example.com",
                "isTest": true,
                "variables": {"first_name": "Sam"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(instance["count"], 3);

        let (_, stats) = call(&app, Method::GET, "/api/email/flows/stats", None).await;
        assert_eq!(stats["flowStats"][&flow_id]["pending"], 3);
        assert_eq!(stats["flowStats"][&flow_id]["activeInstances"], 1);

        let (status, cancelled) = call(
            &app,
            Method::POST,
            "/api/email/flows/cancel",
            Some(json!({"flowTriggerId": instance["flowTriggerId"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["cancelledCount"], 3);

        let (status, detail) =
            call(&app, Method::GET, &format!("/api/email/flows/{flow_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["steps"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_flow_cancel_needs_a_selector() {
        let (status, body) = call(
            &app(),
            Method::POST,
            "/api/email/flows/cancel",
            Some(json!({"userId": "7f8e2c4a-0000-4000-8000-000000000001"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_flow_is_not_found() {
        let (status, body) = call(
            &app(),
            Method::GET,
            "/api/email/flows/7f8e2c4a-0000-4000-8000-000000000002",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_suppression_round_trip_over_http() {
        let app = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/email/webhooks/resend",
            Some(json!({"type": "email.complained", "data": {"to": ["x@example.com"]}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = call(&app, Method::GET, "/api/email/suppressions", None).await;
        assert_eq!(listed["suppressions"][0]["reason"], "complained");

        let (status, _) = call(
            &app,
            Method::DELETE,
            "/api/email/suppressions/x@example.com",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            &app,
            Method::DELETE,
            "/api/email/suppressions/x@example.com",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
