//! Management API tests.
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot` over the
//! in-memory storage backend. Receivers are wiremock servers.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState};
use courier_core::{signing, Clock, TestClock};
use courier_delivery::{storage::mock::MockDeliveryStorage, DeliveryConfig, DeliveryEngine};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

struct TestApi {
    engine: DeliveryEngine,
    storage: Arc<MockDeliveryStorage>,
    app: Router,
    tenant: Uuid,
}

impl TestApi {
    fn new() -> Self {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let engine = DeliveryEngine::new(storage.clone(), DeliveryConfig::default(), clock.clone())
            .expect("engine builds");
        let app = create_router(AppState::new(engine.services(), clock), Duration::from_secs(5));
        Self { engine, storage, app, tenant: Uuid::new_v4() }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            },
            None => Body::empty(),
        };

        let response =
            self.app.clone().oneshot(builder.body(body).unwrap()).await.expect("request served");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("response is JSON")
        };
        (status, value)
    }

    fn tenant_uri(&self, rest: &str) -> String {
        format!("/v1/tenants/{}{rest}", self.tenant)
    }

    async fn create_endpoint(&self, body: Value) -> Value {
        let (status, created) = self.call("POST", &self.tenant_uri("/endpoints"), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        created
    }
}

#[tokio::test]
async fn health_reports_database_status() {
    let api = TestApi::new();

    let (status, body) = api.call("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "up");

    api.storage.fail_always("health_check").await;
    let (status, body) = api.call("GET", "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["database"]["status"], "down");

    let (status, _) = api.call("GET", "/live", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn event_type_catalog_lists_every_type() {
    let api = TestApi::new();

    let (status, body) = api.call("GET", "/v1/event-types", None).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> =
        body.as_array().unwrap().iter().map(|t| t["type"].as_str().unwrap()).collect();
    assert!(types.contains(&"feedback.created"));
    assert!(types.contains(&"webhook.test"));
}

#[tokio::test]
async fn endpoint_secret_is_shown_only_at_creation() {
    let api = TestApi::new();

    let created = api
        .create_endpoint(json!({
            "name": "crm",
            "url": "https://hooks.example.com/crm",
            "event_types": ["feedback.created"],
        }))
        .await;
    let secret = created["secret"].as_str().expect("secret returned");
    assert_eq!(secret.len(), signing::SECRET_BYTES * 2);
    assert_eq!(created["max_retries"], 3);
    assert_eq!(created["retry_delay_seconds"], 60);

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = api.call("GET", &api.tenant_uri(&format!("/endpoints/{id}")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(fetched.get("secret").is_none());

    let (status, rotated) =
        api.call("POST", &api.tenant_uri(&format!("/endpoints/{id}/rotate-secret")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["secret"].as_str().unwrap(), secret);
}

#[tokio::test]
async fn invalid_endpoint_is_rejected() {
    let api = TestApi::new();

    let (status, body) = api
        .call(
            "POST",
            &api.tenant_uri("/endpoints"),
            Some(json!({ "name": "bad", "url": "ftp://example.com", "event_types": ["*"] })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) =
        api.call("POST", &api.tenant_uri("/endpoints"), Some(json!({ "name": 7 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn endpoints_are_scoped_to_their_tenant() {
    let api = TestApi::new();
    let created = api
        .create_endpoint(json!({
            "name": "crm",
            "url": "https://hooks.example.com/crm",
            "event_types": ["*"],
        }))
        .await;
    let id = created["id"].as_str().unwrap();

    let other_tenant = Uuid::new_v4();
    let (status, body) = api
        .call("GET", &format!("/v1/tenants/{other_tenant}/endpoints/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (_, listed) = api.call("GET", &format!("/v1/tenants/{other_tenant}/endpoints"), None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn update_and_delete_endpoint() {
    let api = TestApi::new();
    let created = api
        .create_endpoint(json!({
            "name": "crm",
            "url": "https://hooks.example.com/crm",
            "description": "sales pipeline",
            "event_types": ["*"],
        }))
        .await;
    let uri = api.tenant_uri(&format!("/endpoints/{}", created["id"].as_str().unwrap()));

    let (status, updated) = api
        .call("PATCH", &uri, Some(json!({ "is_active": false, "description": null })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["is_active"], false);
    assert_eq!(updated["description"], Value::Null);
    assert_eq!(updated["name"], "crm");

    let (status, _) = api.call("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = api.call("GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn accepted_event_is_pending_until_processed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let api = TestApi::new();
    api.create_endpoint(json!({
        "name": "receiver",
        "url": format!("{}/hook", server.uri()),
        "event_types": ["feedback.created"],
    }))
    .await;

    let (status, accepted) = api
        .call(
            "POST",
            &api.tenant_uri("/events"),
            Some(json!({ "event_type": "feedback.created", "payload": { "id": 42 } })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "pending");
    let event_uri = api.tenant_uri(&format!("/events/{}", accepted["event_id"].as_str().unwrap()));

    api.engine.process_batch().await.unwrap();

    let (status, summary) = api.call("GET", &event_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["event"]["status"], "delivered");
    assert_eq!(summary["settled_status"], "delivered");
    assert_eq!(summary["pairs"].as_array().unwrap().len(), 1);

    let (status, attempts) = api.call("GET", &format!("{event_uri}/deliveries"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempts[0]["trigger"], "dispatch");
    assert_eq!(attempts[0]["response_status"], 200);
}

#[tokio::test]
async fn unknown_event_type_is_rejected() {
    let api = TestApi::new();

    let (status, body) = api
        .call(
            "POST",
            &api.tenant_uri("/events"),
            Some(json!({ "event_type": "invoice.paid", "payload": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("invoice.paid"));
}

#[tokio::test]
async fn test_delivery_reaches_inactive_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = TestApi::new();
    let created = api
        .create_endpoint(json!({
            "name": "receiver",
            "url": server.uri(),
            "event_types": ["feedback.created"],
            "is_active": false,
        }))
        .await;
    let id = created["id"].as_str().unwrap();

    let (status, delivery) =
        api.call("POST", &api.tenant_uri(&format!("/endpoints/{id}/test")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivery["event"]["event_type"], "webhook.test");
    assert_eq!(delivery["event"]["status"], "delivered");
    assert_eq!(delivery["outcome"]["succeeded"], true);
    assert_eq!(delivery["outcome"]["next_retry_at"], Value::Null);
}

#[tokio::test]
async fn replay_after_rotation_is_signed_with_new_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let api = TestApi::new();
    let created = api
        .create_endpoint(json!({
            "name": "receiver",
            "url": server.uri(),
            "event_types": ["*"],
            "max_retries": 1,
        }))
        .await;
    let id = created["id"].as_str().unwrap();
    let old_secret = created["secret"].as_str().unwrap().to_string();

    api.call(
        "POST",
        &api.tenant_uri("/events"),
        Some(json!({ "event_type": "vote.created", "payload": { "votes": 3 } })),
    )
    .await;
    api.engine.process_batch().await.unwrap();

    let deliveries_uri = api.tenant_uri(&format!("/endpoints/{id}/deliveries"));
    let (_, log) = api.call("GET", &deliveries_uri, None).await;
    let failed = &log[0];
    assert_eq!(failed["succeeded"], false);
    assert_eq!(failed["response_status"], 500);
    assert_eq!(failed["next_retry_at"], Value::Null);

    let (_, rotated) =
        api.call("POST", &api.tenant_uri(&format!("/endpoints/{id}/rotate-secret")), None).await;
    let new_secret = rotated["secret"].as_str().unwrap();

    let replay_uri =
        api.tenant_uri(&format!("/deliveries/{}/replay", failed["id"].as_str().unwrap()));
    let (status, outcome) = api.call("POST", &replay_uri, None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["attempt_number"], 2);
    assert_eq!(outcome["succeeded"], true);

    let (_, log) = api.call("GET", &deliveries_uri, None).await;
    let replayed = log
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["attempt_number"] == 2)
        .expect("replay recorded");
    assert_eq!(replayed["trigger"], "replay");

    let body = replayed["request_body"].as_str().unwrap().as_bytes();
    let old_signature = failed["request_headers"]["X-Courier-Signature"].as_str().unwrap();
    let new_signature = replayed["request_headers"]["X-Courier-Signature"].as_str().unwrap();
    assert_ne!(old_signature, new_signature);
    assert!(signing::verify_signature(new_secret, body, new_signature).unwrap());
    assert!(!signing::verify_signature(&old_secret, body, new_signature).unwrap());

    let succeeded_uri =
        api.tenant_uri(&format!("/deliveries/{}/replay", replayed["id"].as_str().unwrap()));
    let (status, body) = api.call("POST", &succeeded_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
}

#[tokio::test]
async fn stats_count_todays_traffic() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let api = TestApi::new();
    api.create_endpoint(json!({ "name": "a", "url": server.uri(), "event_types": ["*"] })).await;
    api.create_endpoint(json!({
        "name": "b",
        "url": server.uri(),
        "event_types": ["*"],
        "is_active": false,
    }))
    .await;

    api.call(
        "POST",
        &api.tenant_uri("/events"),
        Some(json!({ "event_type": "comment.created", "payload": {} })),
    )
    .await;
    api.engine.process_batch().await.unwrap();

    let (status, stats) = api.call("GET", &api.tenant_uri("/stats"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["endpoint_count"], 2);
    assert_eq!(stats["active_endpoint_count"], 1);
    assert_eq!(stats["events_today"], 1);
    assert_eq!(stats["deliveries_today"], 1);
    assert_eq!(stats["success_rate"], 1.0);
}
