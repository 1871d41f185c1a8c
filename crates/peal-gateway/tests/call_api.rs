//! Integration tests for the gateway call routes.
//!
//! Drives the router directly with tower's `oneshot`, against an in-memory
//! database with sessions inserted out of band.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::RwLock;
use tower::ServiceExt;

use peal_common::UserId;
use peal_core::{store, CallService};
use peal_gateway::{auth, build_router, ws, AppState};

struct Harness {
    router: Router,
    tokens: HashMap<String, String>,
}

impl Harness {
    async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("failed to open in-memory database");
        store::init_schema(&pool).await.expect("call schema");
        auth::init_schema(&pool).await.expect("session schema");

        let mut tokens = HashMap::new();
        for user in ["alice", "bob", "carol"] {
            let token = auth::create_session(&pool, &UserId::from(user))
                .await
                .expect("session");
            tokens.insert(user.to_string(), token);
        }

        let service = Arc::new(CallService::new(pool.clone()));
        let connections: ws::ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let router = build_router(AppState {
            pool,
            service,
            connections,
        });

        Self { router, tokens }
    }

    fn token(&self, user: &str) -> &str {
        &self.tokens[user]
    }

    async fn post(&self, path: &str, user: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(user) = user {
            request = request.header(auth::SESSION_TOKEN_HEADER, self.token(user));
        }
        let response = self
            .router
            .clone()
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, path: &str, user: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .header(auth::SESSION_TOKEN_HEADER, self.token(user))
            .body(Body::empty())
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

fn offer_body(callee: &str) -> Value {
    json!({
        "callee_id": callee,
        "offer": { "kind": "offer", "sdp": "v=0 test-offer" },
    })
}

#[tokio::test]
async fn requests_without_a_token_are_unauthenticated() {
    let harness = Harness::new().await;
    let (status, body) = harness.post("/calls/initiate", None, offer_body("bob")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("not authenticated"));
}

#[tokio::test]
async fn full_call_flow_over_http() {
    let harness = Harness::new().await;

    let (status, body) = harness
        .post("/calls/initiate", Some("alice"), offer_body("bob"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let call_id = body["call_id"].as_str().unwrap().to_string();

    // The callee finds the ring through the active-call route.
    let (status, body) = harness.get("/calls/active", "bob").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"].as_str().unwrap(), call_id);
    assert_eq!(body["status"], "ringing");

    let (status, _) = harness
        .post(
            "/calls/answer",
            Some("bob"),
            json!({ "call_id": call_id, "answer": { "kind": "answer", "sdp": "v=0 test-answer" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = harness
        .post(
            "/calls/candidate",
            Some("alice"),
            json!({ "call_id": call_id, "role": "caller", "candidate": { "candidate": "candidate:1" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stored"], true);

    let (status, body) = harness
        .post("/calls/connected", Some("bob"), json!({ "call_id": call_id }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);

    let (status, body) = harness
        .get(&format!("/calls/details?call_id={call_id}"), "alice")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "connected");
    assert_eq!(body["caller_candidates"][0]["candidate"], "candidate:1");

    let (status, _) = harness
        .post("/calls/end", Some("alice"), json!({ "call_id": call_id }))
        .await;
    assert_eq!(status, StatusCode::OK);

    // A duplicate end from the other side still succeeds.
    let (status, _) = harness
        .post("/calls/end", Some("bob"), json!({ "call_id": call_id }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = harness.get("/calls/active", "alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn busy_and_state_conflicts_map_to_409() {
    let harness = Harness::new().await;
    let (_, body) = harness
        .post("/calls/initiate", Some("alice"), offer_body("bob"))
        .await;
    let call_id = body["call_id"].as_str().unwrap().to_string();

    let (status, body) = harness
        .post("/calls/initiate", Some("carol"), offer_body("bob"))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("active call"));

    let (status, _) = harness
        .post(
            "/calls/answer",
            Some("bob"),
            json!({ "call_id": call_id, "answer": { "kind": "answer", "sdp": "a" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = harness
        .post(
            "/calls/answer",
            Some("bob"),
            json!({ "call_id": call_id, "answer": { "kind": "answer", "sdp": "a" } }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn self_call_is_a_bad_request() {
    let harness = Harness::new().await;
    let (status, _) = harness
        .post("/calls/initiate", Some("alice"), offer_body("alice"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn outsiders_cannot_read_call_details() {
    let harness = Harness::new().await;
    let (_, body) = harness
        .post("/calls/initiate", Some("alice"), offer_body("bob"))
        .await;
    let call_id = body["call_id"].as_str().unwrap().to_string();

    let (status, _) = harness
        .get(&format!("/calls/details?call_id={call_id}"), "carol")
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = harness
        .post("/calls/end", Some("carol"), json!({ "call_id": call_id }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_calls_are_not_found() {
    let harness = Harness::new().await;
    let (status, _) = harness
        .post("/calls/end", Some("alice"), json!({ "call_id": "nope" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_payloads_are_rejected() {
    let harness = Harness::new().await;
    let huge = "x".repeat(64 * 1024);
    let (status, _) = harness
        .post(
            "/calls/initiate",
            Some("alice"),
            json!({ "callee_id": "bob", "offer": { "kind": "offer", "sdp": huge } }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
