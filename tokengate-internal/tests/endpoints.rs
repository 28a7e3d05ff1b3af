//! End-to-end handler tests over the assembled router, using mock cache and
//! store backends.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tower::ServiceExt;

use tokengate_internal::config::Config;
use tokengate_internal::endpoints;
use tokengate_internal::gateway_util::AppStateData;
use tokengate_internal::session::require_session;

fn build_router(state: AppStateData) -> Router {
    let session_routes = Router::new()
        .route("/llm/chat", post(endpoints::chat::chat_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));
    Router::new()
        .merge(session_routes)
        .route("/llm/verify", post(endpoints::verify::verify_handler))
        .route("/health", get(endpoints::status::health_handler))
        .with_state(state)
}

static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();

fn keypair() -> (String, String) {
    KEYPAIR
        .get_or_init(|| {
            let private_key =
                RsaPrivateKey::new(&mut OsRng, 2048).expect("failed to generate RSA key");
            let public_key = RsaPublicKey::from(&private_key);
            (
                private_key
                    .to_pkcs1_pem(LineEnding::LF)
                    .expect("failed to encode private key")
                    .to_string(),
                public_key
                    .to_pkcs1_pem(LineEnding::LF)
                    .expect("failed to encode public key"),
            )
        })
        .clone()
}

fn sign_access_key(private_pem: &str, sub: &str, jti: &str) -> String {
    let claims = json!({
        "sub": sub,
        "jti": jti,
        "exp": chrono::Utc::now().timestamp() + 3600,
        "email": "student@example.com",
        "quota": 1000,
    });
    encode(
        &Header::new(Algorithm::RS256),
        &claims,
        &EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("invalid test private key"),
    )
    .expect("failed to sign test access key")
}

fn mock_state() -> AppStateData {
    let (_, public_pem) = keypair();
    AppStateData::new_mock(Config {
        credential_public_key: Some(public_pem),
        session_secret: SecretString::from("integration-test-secret"),
        ..Config::default()
    })
}

async fn body_json(body: Body) -> Value {
    let bytes = to_bytes(body, usize::MAX).await.expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body was not JSON")
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

#[tokio::test]
async fn test_health() {
    let router = build_router(mock_state());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_verify_rejects_missing_access_key() {
    let router = build_router(mock_state());
    let response = router
        .oneshot(json_request("/llm/verify", json!({})))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["message"], "Access key is required");
}

#[tokio::test]
async fn test_chat_without_session_is_unauthorized() {
    let router = build_router(mock_state());
    let response = router
        .oneshot(json_request(
            "/llm/chat",
            json!({ "messages": [{ "role": "user", "content": "hi" }] }),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_verify_then_chat_flow() {
    let (private_pem, _) = keypair();
    let state = mock_state();
    let router = build_router(state.clone());

    let access_key = sign_access_key(&private_pem, "2021000000", "it-jti-1");
    let response = router
        .clone()
        .oneshot(json_request("/llm/verify", json!({ "accessKey": access_key })))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["user"]["studentNo"], "2021000000");
    assert_eq!(body["user"]["email"], "student@example.com");
    let token = body["token"].as_str().expect("missing token").to_string();

    // No provider credentials configured, so chat answers with the mock
    // completion instead of streaming.
    let request = Request::builder()
        .method("POST")
        .uri("/llm/chat")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(
            json!({ "messages": [{ "role": "user", "content": "hello" }] }).to_string(),
        ))
        .expect("failed to build request");
    let response = router.oneshot(request).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await;
    assert!(body["choices"][0]["message"]["content"]
        .as_str()
        .expect("missing content")
        .starts_with("Mock:"));
}

#[tokio::test]
async fn test_replayed_access_key_is_forbidden_and_mutates_nothing() {
    let (private_pem, _) = keypair();
    let state = mock_state();
    let router = build_router(state.clone());
    let access_key = sign_access_key(&private_pem, "2021000001", "it-jti-2");

    let first = router
        .clone()
        .oneshot(json_request("/llm/verify", json!({ "accessKey": access_key.clone() })))
        .await
        .expect("request failed");
    assert_eq!(first.status(), StatusCode::OK);

    let record_before = state.store.get_usage("2021000001").await.expect("store read failed");
    let floor_before = state.cache.get("llm_min_iat:2021000001").await.expect("cache read failed");
    let limit_before = state.cache.get("llm_limit:2021000001").await.expect("cache read failed");
    let usage_before = state.cache.get("llm_usage:2021000001").await.expect("cache read failed");

    let second = router
        .oneshot(json_request("/llm/verify", json!({ "accessKey": access_key })))
        .await
        .expect("request failed");
    assert_eq!(second.status(), StatusCode::FORBIDDEN);
    let body = body_json(second.into_body()).await;
    assert_eq!(body["error"]["message"], "Access key has already been used");

    // The rejected replay left both the durable record and the fast-path
    // mirrors exactly as the first exchange did.
    assert_eq!(
        state.store.get_usage("2021000001").await.expect("store read failed"),
        record_before
    );
    assert_eq!(
        state.cache.get("llm_min_iat:2021000001").await.expect("cache read failed"),
        floor_before
    );
    assert_eq!(
        state.cache.get("llm_limit:2021000001").await.expect("cache read failed"),
        limit_before
    );
    assert_eq!(
        state.cache.get("llm_usage:2021000001").await.expect("cache read failed"),
        usage_before
    );
}

#[tokio::test]
async fn test_superseded_session_is_unauthorized() {
    let (private_pem, _) = keypair();
    let state = mock_state();
    let router = build_router(state.clone());

    let access_key = sign_access_key(&private_pem, "2021000002", "it-jti-3");
    let response = router
        .clone()
        .oneshot(json_request("/llm/verify", json!({ "accessKey": access_key })))
        .await
        .expect("request failed");
    let body = body_json(response.into_body()).await;
    let token = body["token"].as_str().expect("missing token").to_string();

    // Raise the subject's issued-at floor past the token's iat.
    let future = (chrono::Utc::now().timestamp() + 60).to_string();
    state
        .cache
        .set("llm_min_iat:2021000002", &future)
        .await
        .expect("cache write failed");

    let request = Request::builder()
        .method("POST")
        .uri("/llm/chat")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(
            json!({ "messages": [{ "role": "user", "content": "hi" }] }).to_string(),
        ))
        .expect("failed to build request");
    let response = router.oneshot(request).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_chat_rejects_concurrent_request() {
    let (private_pem, _) = keypair();
    let state = mock_state();
    let router = build_router(state.clone());

    let access_key = sign_access_key(&private_pem, "2021000003", "it-jti-4");
    let response = router
        .clone()
        .oneshot(json_request("/llm/verify", json!({ "accessKey": access_key })))
        .await
        .expect("request failed");
    let body = body_json(response.into_body()).await;
    let token = body["token"].as_str().expect("missing token").to_string();

    // Another request is already in flight for this subject.
    state
        .cache
        .set("llm_active:2021000003", "1")
        .await
        .expect("cache write failed");

    let request = Request::builder()
        .method("POST")
        .uri("/llm/chat")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(
            json!({ "messages": [{ "role": "user", "content": "hi" }] }).to_string(),
        ))
        .expect("failed to build request");
    let response = router.oneshot(request).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_chat_rejects_empty_messages() {
    let (private_pem, _) = keypair();
    let router = build_router(mock_state());

    let access_key = sign_access_key(&private_pem, "2021000004", "it-jti-5");
    let response = router
        .clone()
        .oneshot(json_request("/llm/verify", json!({ "accessKey": access_key })))
        .await
        .expect("request failed");
    let body = body_json(response.into_body()).await;
    let token = body["token"].as_str().expect("missing token").to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/llm/chat")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(json!({ "messages": [] }).to_string()))
        .expect("failed to build request");
    let response = router.oneshot(request).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["message"], "Messages array is required");
}
