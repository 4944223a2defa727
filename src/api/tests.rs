use super::*;
use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use warelay_core::session::{LifecycleEvent, SessionState};
use warelay_sessions::testing::{eventually, FakeBackend};
use warelay_sessions::RegistryOptions;

const KEY: &str = "secret";

// -----------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------

struct Harness {
    app: Router,
    backend: Arc<FakeBackend>,
    registry: InstanceRegistry,
}

impl Harness {
    fn new(mode: ServerMode, max_instances: usize) -> Self {
        Self::with_backend(mode, max_instances, KEY, FakeBackend::new())
    }

    fn with_backend(
        mode: ServerMode,
        max_instances: usize,
        api_key: &str,
        backend: FakeBackend,
    ) -> Self {
        let backend = Arc::new(backend);
        let options = RegistryOptions {
            max_instances,
            init_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(200),
            logout_timeout: Duration::from_millis(200),
        };
        let registry = InstanceRegistry::new(backend.clone(), options);
        let state = ApiState::new(registry.clone(), api_key, mode, "default");
        Self {
            app: build_router(state),
            backend,
            registry,
        }
    }

    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        (status, body_json(resp).await)
    }

    /// Provision `id` through the API and drive it to ready.
    async fn ready_instance(&self, id: &str) {
        let (status, _) = self
            .call(post_json("/instance", json!({"apiKey": KEY, "instanceId": id})))
            .await;
        assert_eq!(status, StatusCode::OK);
        self.make_ready(id).await;
    }

    async fn make_ready(&self, id: &str) {
        assert!(self.backend.emit(id, LifecycleEvent::Ready).await);
        let registry = &self.registry;
        assert!(
            eventually(|| async move {
                registry
                    .status(id)
                    .await
                    .is_ok_and(|s| s.state == SessionState::Ready)
            })
            .await
        );
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    post_raw(uri, &body.to_string())
}

fn post_raw(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// Parse response body as JSON (`Null` for empty bodies).
async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap_or(Value::Null)
}

// -----------------------------------------------------------------------
// Auth
// -----------------------------------------------------------------------

#[test]
fn test_constant_time_eq() {
    assert!(constant_time_eq("secret", "secret"));
    assert!(!constant_time_eq("secret", "secreT"));
    assert!(!constant_time_eq("secret", "secret2"));
    assert!(constant_time_eq("", ""));
}

#[tokio::test]
async fn test_missing_key_rejected_everywhere_without_mutation() {
    let h = Harness::new(ServerMode::Multi, 5);

    let requests = vec![
        post_json("/instance", json!({})),
        post_json("/instance", json!({"instanceId": "a"})),
        get_req("/qr/a"),
        get_req("/status/a"),
        get_req("/health"),
        post_json("/send/a", json!({"number": "1", "message": "hi"})),
        post_json("/logout/a", json!({})),
    ];
    for req in requests {
        let uri = req.uri().to_string();
        let (status, json) = h.call(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(json["error"], "Invalid API key", "{uri}");
    }

    assert_eq!(h.backend.opened(), 0);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_wrong_key_rejected() {
    let h = Harness::new(ServerMode::Multi, 5);

    let (status, _) = h
        .call(post_json("/instance", json!({"apiKey": "wrong"})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h.call(get_req("/qr/a?apiKey=wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_key_accepted_from_header() {
    let h = Harness::new(ServerMode::Multi, 5);
    let req = Request::get("/health")
        .header("x-api-key", KEY)
        .body(Body::empty())
        .unwrap();
    let (status, json) = h.call(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_body_key_wins_over_header() {
    let h = Harness::new(ServerMode::Multi, 5);
    let req = Request::post("/instance")
        .header("x-api-key", KEY)
        .body(Body::from(json!({"apiKey": "wrong"}).to_string()))
        .unwrap();
    let (status, _) = h.call(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_configured_key_rejects_everything() {
    let h = Harness::with_backend(ServerMode::Multi, 5, "", FakeBackend::new());
    let (status, _) = h
        .call(post_json("/instance", json!({"apiKey": ""})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.backend.opened(), 0);
}

#[tokio::test]
async fn test_malformed_json_is_unauthorized_without_header_key() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, _) = h.call(post_raw("/instance", "{not json")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request_after_auth() {
    let h = Harness::new(ServerMode::Multi, 5);
    let req = Request::post("/instance")
        .header("x-api-key", KEY)
        .body(Body::from("{not json"))
        .unwrap();
    let (status, json) = h.call(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Invalid JSON body");
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_mistyped_number_with_valid_key_is_bad_request() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;

    let (status, json) = h
        .call(post_json(
            "/send/a",
            json!({"apiKey": KEY, "number": 15551234567u64, "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid request body"));
    assert!(h.backend.client("a").unwrap().sent().is_empty());
}

#[tokio::test]
async fn test_mistyped_instance_id_with_valid_key_is_bad_request() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, _) = h
        .call(post_json("/instance", json!({"apiKey": KEY, "instanceId": 42})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.registry.is_empty().await);
    assert_eq!(h.backend.opened(), 0);
}

#[tokio::test]
async fn test_mistyped_field_with_wrong_key_is_unauthorized() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, _) = h
        .call(post_json("/instance", json!({"apiKey": "wrong", "instanceId": 42})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_key_leaves_ready_instance_untouched() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;
    let client = h.backend.client("a").unwrap();

    let requests = vec![
        post_json("/send/a", json!({"number": "15551234567", "message": "hi"})),
        post_json(
            "/send/a",
            json!({"apiKey": "wrong", "number": "15551234567", "message": "hi"}),
        ),
        post_json("/logout/a", json!({})),
        post_json("/logout/a", json!({"apiKey": "wrong"})),
        post_json("/instance", json!({"instanceId": "b"})),
    ];
    for req in requests {
        let uri = req.uri().to_string();
        let (status, _) = h.call(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
    }

    assert!(client.sent().is_empty());
    assert!(!client.is_logged_out());
    assert!(!client.is_closed());
    assert_eq!(h.registry.len().await, 1);
    assert_eq!(
        h.registry.status("a").await.unwrap().state,
        SessionState::Ready
    );
    assert_eq!(h.backend.opened(), 1);
}

// -----------------------------------------------------------------------
// POST /instance
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_create_instance_generates_uuid() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, json) = h.call(post_json("/instance", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::OK);

    let id = json["instanceId"].as_str().unwrap();
    assert!(Uuid::parse_str(id).is_ok());
    assert_eq!(json["apiKey"], KEY);
    assert!(h.registry.contains(id).await);
    assert_eq!(h.backend.opened(), 1);
}

#[tokio::test]
async fn test_create_instance_with_id_is_idempotent() {
    let h = Harness::new(ServerMode::Multi, 1);
    for _ in 0..2 {
        let (status, json) = h
            .call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "shop"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["instanceId"], "shop");
    }
    assert_eq!(h.backend.opened(), 1);
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_create_instance_beyond_capacity() {
    let h = Harness::new(ServerMode::Multi, 1);
    let (status, _) = h.call(post_json("/instance", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = h.call(post_json("/instance", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("capacity exceeded"));
    assert_eq!(h.registry.len().await, 1);
    assert_eq!(h.backend.opened(), 1);
}

#[tokio::test]
async fn test_create_instance_invalid_id() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, json) = h
        .call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "../etc"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("invalid instance id"));
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_create_instance_init_failure() {
    let backend = FakeBackend::new();
    backend.fail_open("browser crashed");
    let h = Harness::with_backend(ServerMode::Multi, 5, KEY, backend);

    let (status, json) = h.call(post_json("/instance", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("browser crashed"));
    assert!(h.registry.is_empty().await);
}

// -----------------------------------------------------------------------
// GET /qr
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_qr_lifecycle() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, _) = h
        .call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "a"})))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = h.call(get_req("/qr/a?apiKey=secret")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "QR code not available");

    assert!(
        h.backend
            .emit("a", LifecycleEvent::QrIssued("2@abc,def,ghi".into()))
            .await
    );
    let registry = &h.registry;
    assert!(eventually(|| async move { registry.qr("a").await.is_some() }).await);

    let (status, json) = h.call(get_req("/qr/a?apiKey=secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["qr"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    h.make_ready("a").await;
    let (status, _) = h.call(get_req("/qr/a?apiKey=secret")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_qr_cleared_on_disconnect() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "a"})))
        .await;
    h.backend
        .emit("a", LifecycleEvent::QrIssued("payload".into()))
        .await;
    let registry = &h.registry;
    assert!(eventually(|| async move { registry.qr("a").await.is_some() }).await);

    h.backend
        .emit("a", LifecycleEvent::Disconnected("NAVIGATION".into()))
        .await;
    assert!(eventually(|| async move { !registry.contains("a").await }).await);

    let (status, _) = h.call(get_req("/qr/a?apiKey=secret")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_qr_unknown_instance() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, _) = h.call(get_req("/qr/ghost?apiKey=secret")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// -----------------------------------------------------------------------
// POST /send/{id}
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_send_unknown_instance() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, json) = h
        .call(post_json(
            "/send/ghost",
            json!({"apiKey": KEY, "number": "15551234567", "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_send_not_ready() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "a"})))
        .await;

    let (status, json) = h
        .call(post_json(
            "/send/a",
            json!({"apiKey": KEY, "number": "15551234567", "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("not ready"));
    assert!(h.backend.client("a").unwrap().sent().is_empty());
}

#[tokio::test]
async fn test_send_ready_normalizes_recipient() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;

    let (status, json) = h
        .call(post_json(
            "/send/a",
            json!({"apiKey": KEY, "number": "15551234567", "message": "hello"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(
        h.backend.client("a").unwrap().sent(),
        vec![("15551234567@c.us".to_string(), "hello".to_string())]
    );
}

#[tokio::test]
async fn test_send_missing_fields() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;

    for body in [
        json!({"apiKey": KEY, "number": "15551234567"}),
        json!({"apiKey": KEY, "message": "hi"}),
        json!({"apiKey": KEY, "number": "", "message": "hi"}),
    ] {
        let (status, json) = h.call(post_json("/send/a", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Number and message required");
    }
    assert!(h.backend.client("a").unwrap().sent().is_empty());
}

#[tokio::test]
async fn test_send_underlying_error_surfaced() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;
    h.backend.client("a").unwrap().fail_sends("rate-overlimit");

    let (status, json) = h
        .call(post_json(
            "/send/a",
            json!({"apiKey": KEY, "number": "15551234567", "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "rate-overlimit");
    assert!(h.registry.contains("a").await);
}

// -----------------------------------------------------------------------
// POST /logout/{id}
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_logout_then_send_is_bad_request() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;

    let (status, json) = h.call(post_json("/logout/a", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(h.backend.client("a").unwrap().is_logged_out());

    let (status, _) = h
        .call(post_json(
            "/send/a",
            json!({"apiKey": KEY, "number": "15551234567", "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logout_frees_capacity() {
    let h = Harness::new(ServerMode::Multi, 1);
    h.ready_instance("a").await;
    h.call(post_json("/logout/a", json!({"apiKey": KEY}))).await;

    let (status, _) = h
        .call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "b"})))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_logout_unknown_instance() {
    let h = Harness::new(ServerMode::Multi, 5);
    let (status, _) = h.call(post_json("/logout/ghost", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logout_failure_keeps_instance() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.ready_instance("a").await;
    h.backend.client("a").unwrap().fail_logout("socket closed");

    let (status, json) = h.call(post_json("/logout/a", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "socket closed");
    assert!(h.registry.contains("a").await);
}

// -----------------------------------------------------------------------
// GET /status, GET /health
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_status_reports_state_and_qr() {
    let h = Harness::new(ServerMode::Multi, 5);
    h.call(post_json("/instance", json!({"apiKey": KEY, "instanceId": "a"})))
        .await;
    h.backend
        .emit("a", LifecycleEvent::QrIssued("payload".into()))
        .await;
    let registry = &h.registry;
    assert!(eventually(|| async move { registry.qr("a").await.is_some() }).await);

    let (status, json) = h.call(get_req("/status/a?apiKey=secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["instanceId"], "a");
    assert_eq!(json["state"], "awaiting-qr-scan");
    assert_eq!(json["hasQr"], true);

    let (status, _) = h.call(get_req("/status/ghost?apiKey=secret")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_counts_instances() {
    let h = Harness::new(ServerMode::Multi, 3);
    h.call(post_json("/instance", json!({"apiKey": KEY}))).await;

    let (status, json) = h.call(get_req("/health?apiKey=secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["mode"], "multi");
    assert_eq!(json["instances"], 1);
    assert_eq!(json["capacity"], 3);
}

// -----------------------------------------------------------------------
// Single-instance mode
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_single_mode_routes() {
    let h = Harness::new(ServerMode::Single, 1);
    let (status, _) = h.call(post_json("/instance", json!({"apiKey": KEY}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = h.call(get_req("/health?apiKey=secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["mode"], "single");
}

#[tokio::test]
async fn test_single_mode_send() {
    let h = Harness::new(ServerMode::Single, 1);
    h.registry.create("default").await.unwrap();
    h.make_ready("default").await;

    let (status, json) = h
        .call(post_json(
            "/send",
            json!({"apiKey": KEY, "number": "+15551234567", "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(
        h.backend.client("default").unwrap().sent(),
        vec![("15551234567@c.us".to_string(), "hi".to_string())]
    );
}

#[tokio::test]
async fn test_single_mode_send_without_client() {
    let h = Harness::new(ServerMode::Single, 1);
    let (status, json) = h
        .call(post_json(
            "/send",
            json!({"apiKey": KEY, "number": "15551234567", "message": "hi"}),
        ))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "WhatsApp client is not running");

    let (status, _) = h
        .call(post_json("/send", json!({"number": "1", "message": "hi"})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
