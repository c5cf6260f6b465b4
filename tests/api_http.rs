//! HTTP API integration tests, driven through the router with `oneshot`.

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::TestContext;
use scripthost::server::{ROLES_HEADER, USER_HEADER, router};
use scripthost::{ScriptRecord, ScriptType};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app(ctx: &TestContext) -> Router {
    router(ctx.service.clone())
}

fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri)
}

fn as_manager(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder
        .header(USER_HEADER, "manager@example.com")
        .header(ROLES_HEADER, "Script Manager")
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let ctx = TestContext::new();

    let (status, body) = send(
        app(&ctx),
        request("GET", "/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

// ============================================================================
// Script management
// ============================================================================

#[tokio::test]
async fn test_put_creates_then_updates() {
    let ctx = TestContext::new();
    let payload = json!({
        "script_type": "Scheduler Event",
        "script": "server.log('nightly');",
        "event_frequency": "Daily",
    });

    let put = || {
        as_manager(request("PUT", "/api/scripts/Nightly"))
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    };

    let (status, body) = send(app(&ctx), put()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["created"], json!(true));
    assert_eq!(
        body["messages"],
        json!(["Enabled scheduled execution for script Nightly"])
    );
    assert_eq!(ctx.bindings("Nightly").len(), 1);

    let (status, body) = send(app(&ctx), put()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], json!(false));
    assert_eq!(ctx.bindings("Nightly").len(), 1);
}

#[tokio::test]
async fn test_put_rejects_bad_script() {
    let ctx = TestContext::new();
    let payload = json!({"script_type": "API", "script": "function ("});

    let (status, body) = send(
        app(&ctx),
        as_manager(request("PUT", "/api/scripts/Broken"))
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("VALIDATION_ERROR"));
    assert!(ctx.record("Broken").is_none());
}

#[tokio::test]
async fn test_script_management_requires_manager() {
    let ctx = TestContext::new();
    let payload = json!({"script_type": "API", "script": ""});

    let (status, _) = send(
        app(&ctx),
        request("PUT", "/api/scripts/Sneaky")
            .header(USER_HEADER, "alice")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        app(&ctx),
        request("GET", "/api/scripts").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_get_list_and_delete() {
    let ctx = TestContext::new();
    ctx.save(ScriptRecord::new("Ping", ScriptType::Api, "server.flags.pong = true;"));

    let (status, body) = send(
        app(&ctx),
        as_manager(request("GET", "/api/scripts/Ping"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["script_type"], json!("API"));

    let (status, body) = send(
        app(&ctx),
        as_manager(request("GET", "/api/scripts"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    for uri in ["/api/scripts/Ping", "/api/scripts"] {
        let (status, body) = send(
            app(&ctx),
            request("GET", uri)
                .header(USER_HEADER, "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(body["error"]["code"], json!("FORBIDDEN"));
    }

    let (status, _) = send(
        app(&ctx),
        as_manager(request("DELETE", "/api/scripts/Ping"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(ctx.record("Ping").is_none());

    let (status, _) = send(
        app(&ctx),
        as_manager(request("GET", "/api/scripts/Ping"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// API methods
// ============================================================================

#[tokio::test]
async fn test_method_get_with_query() {
    let ctx = TestContext::new();
    ctx.save(
        ScriptRecord::new(
            "Greeter",
            ScriptType::Api,
            "server.flags.message = 'Hello ' + server.formDict.name + ' from ' + server.session.user;",
        )
        .with_api_method("greet"),
    );

    let (status, body) = send(
        app(&ctx),
        request("GET", "/api/method/greet?name=Ada")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"message": "Hello Ada from alice"}));
}

#[tokio::test]
async fn test_method_post_merges_body_over_query() {
    let ctx = TestContext::new();
    ctx.save(
        ScriptRecord::new(
            "Echo",
            ScriptType::Api,
            "server.flags.a = server.formDict.a; server.flags.b = server.formDict.b;",
        )
        .with_api_method("echo"),
    );

    let (status, body) = send(
        app(&ctx),
        request("POST", "/api/method/echo?a=query&b=query")
            .header(USER_HEADER, "alice")
            .header("content-type", "application/json")
            .body(Body::from(json!({"b": 2}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"a": "query", "b": 2}));

    let (status, _) = send(
        app(&ctx),
        request("POST", "/api/method/echo")
            .header(USER_HEADER, "alice")
            .body(Body::from("[1, 2]"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_guest_access_is_per_script() {
    let ctx = TestContext::new();
    ctx.save(ScriptRecord::new("private", ScriptType::Api, "server.flags.ok = true;"));
    ctx.save(
        ScriptRecord::new("public", ScriptType::Api, "server.flags.ok = true;")
            .with_guest_access(true),
    );

    let (status, body) = send(
        app(&ctx),
        request("GET", "/api/method/private")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], json!("FORBIDDEN"));

    let (status, body) = send(
        app(&ctx),
        request("GET", "/api/method/public").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn test_unknown_method_is_not_found() {
    let ctx = TestContext::new();

    let (status, body) = send(
        app(&ctx),
        request("GET", "/api/method/nothing_here")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], json!(404));
}

#[tokio::test]
async fn test_script_timeout_maps_to_gateway_timeout() {
    let mut config = common::test_config();
    config.javascript.execution_timeout_ms = 100;
    let ctx = TestContext::with_config(config);
    ctx.save(ScriptRecord::new("spin", ScriptType::Api, "for (;;) {}"));

    let (status, body) = send(
        app(&ctx),
        request("GET", "/api/method/spin")
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["code"], json!("SCRIPT_TIMEOUT"));
}
