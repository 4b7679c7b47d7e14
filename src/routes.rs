//! HTTP surface of the gateway
//!
//! Thin handlers: decode what needs normalizing, hand everything else to the
//! upstream client untouched. Conversation-send is the only route behind the
//! admission gate; every forwarded route requires an `Authorization` header.

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, Request, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::admission::{AdmissionGate, BUSY_MESSAGE};
use crate::error::ApiError;
use crate::login::LoginFlow;
use crate::session::SessionStore;
use crate::types::{
    ConversationsQuery, CreateConversationRequest, FeedbackMessageRequest, GenerateTitleRequest,
    LoginRequest, PatchConversationRequest,
};
use crate::upstream::UpstreamClient;

/// Reply when a forwarded request body fails to decode
pub const PARSE_JSON_ERROR: &str = "Failed to parse json request body.";
/// Reply when the login body fails to decode or misses a credential
pub const PARSE_LOGIN_ERROR: &str = "Failed to parse user login info.";
/// Reply when a forwarded route is called without an Authorization header
pub const MISSING_TOKEN_ERROR: &str = "Missing access token.";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<UpstreamClient>,
    pub login: Arc<LoginFlow>,
    pub gate: AdmissionGate,
    pub store: SessionStore,
}

/// Build the gateway router. The update routes accept POST alongside PATCH
/// for clients that cannot send PATCH; both forward as PATCH.
pub fn build_router(state: AppState) -> Router {
    let forwarded = Router::new()
        .route(
            "/conversations",
            get(get_conversations)
                .post(clear_conversations)
                .patch(clear_conversations),
        )
        .route("/conversation", post(create_conversation))
        .route(
            "/conversation/{id}",
            get(get_conversation)
                .post(update_conversation)
                .patch(update_conversation),
        )
        .route("/conversation/gen_title/{id}", post(generate_title))
        .route("/conversation/message_feedback", post(feedback_message))
        .route("/models", get(get_models))
        .route("/accounts/check", get(check_account))
        .layer(middleware::from_fn(require_authorization));

    Router::new()
        .merge(forwarded)
        .route("/auth/login", post(user_login))
        .route("/", get(dump_cookies))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

// =============================================================================
// Middleware
// =============================================================================

/// Reject forwarded requests that carry no access token. The token is never
/// validated here, the upstream is the judge.
async fn require_authorization(req: Request<Body>, next: Next) -> Response {
    if authorization(req.headers()).is_empty() {
        return ApiError::unauthorized(MISSING_TOKEN_ERROR).into_response();
    }
    next.run(req).await
}

/// Middleware to log all incoming HTTP requests
async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let query = uri.query().map(|q| format!("?{}", q)).unwrap_or_default();

    info!("🌐 HTTP {} {}{}", method, uri.path(), query);

    let response = next.run(req).await;

    info!("📤 Response status: {}", response.status());

    response
}

fn authorization(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /conversations
async fn get_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let offset = query.offset.unwrap_or_else(|| "0".to_string());
    let limit = query.limit.unwrap_or_else(|| "20".to_string());
    state
        .upstream
        .get(
            &format!("/conversations?offset={offset}&limit={limit}"),
            authorization(&headers),
            "Failed to get conversations.",
        )
        .await
}

/// POST /conversation, the streamed send route behind the admission gate
async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(permit) = state.gate.try_acquire() else {
        return Err(ApiError::too_many_requests(BUSY_MESSAGE));
    };

    let mut request: CreateConversationRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request(PARSE_JSON_ERROR))?;
    request.apply_defaults();

    state
        .upstream
        .send_conversation(authorization(&headers), &request, permit)
        .await
}

/// GET /conversation/{id}
async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state
        .upstream
        .get(
            &format!("/conversation/{id}"),
            authorization(&headers),
            "Failed to get conversation.",
        )
        .await
}

/// PATCH/POST /conversation/{id}, rename or hide a single conversation
async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut request: PatchConversationRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request(PARSE_JSON_ERROR))?;
    request.normalize();

    state
        .upstream
        .patch_json(
            &format!("/conversation/{id}"),
            authorization(&headers),
            &request,
            "Failed to update conversation.",
        )
        .await
}

/// PATCH/POST /conversations, hides everything; the inbound body is ignored
async fn clear_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state
        .upstream
        .patch_json(
            "/conversations",
            authorization(&headers),
            &PatchConversationRequest::hide_all(),
            "Failed to clear conversations.",
        )
        .await
}

/// POST /conversation/gen_title/{id}
async fn generate_title(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: GenerateTitleRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request(PARSE_JSON_ERROR))?;

    state
        .upstream
        .post_json(
            &format!("/conversation/gen_title/{id}"),
            authorization(&headers),
            &request,
            "Failed to generate title.",
        )
        .await
}

/// POST /conversation/message_feedback
async fn feedback_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: FeedbackMessageRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request(PARSE_JSON_ERROR))?;

    state
        .upstream
        .post_json(
            "/conversation/message_feedback",
            authorization(&headers),
            &request,
            "Failed to submit message feedback.",
        )
        .await
}

/// GET /models
async fn get_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state
        .upstream
        .get("/models", authorization(&headers), "Failed to get models.")
        .await
}

/// GET /accounts/check
async fn check_account(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state
        .upstream
        .get(
            "/accounts/check",
            authorization(&headers),
            "Check account failed.",
        )
        .await
}

/// POST /auth/login, runs the scripted credential login
async fn user_login(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: LoginRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request(PARSE_LOGIN_ERROR))?;
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request(PARSE_LOGIN_ERROR));
    }

    let outcome = state.login.login(&request.username, &request.password).await?;

    let mut response = Response::new(Body::from(outcome.body));
    if let Some(content_type) = outcome.content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

/// GET /, dumps the stored session cookies
async fn dump_cookies(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    let session = state.store.snapshot();
    Json(session.cookies().clone())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::LoginEndpoints;
    use axum::body::to_bytes;
    use axum::http::{Method, StatusCode, Uri, header::CONTENT_TYPE};
    use axum::routing::any;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn spawn_backend(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[derive(Clone)]
    struct Captured {
        method: Method,
        path: String,
        query: Option<String>,
        authorization: String,
        body: Bytes,
    }

    /// Backend that records whatever reaches it and answers 200
    async fn capture_backend() -> (String, Arc<Mutex<Option<Captured>>>) {
        let captured: Arc<Mutex<Option<Captured>>> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let app = Router::new().route(
            "/{*rest}",
            any(
                move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| async move {
                    *sink.lock() = Some(Captured {
                        method,
                        path: uri.path().to_string(),
                        query: uri.query().map(str::to_string),
                        authorization: authorization(&headers).to_string(),
                        body,
                    });
                    Json(serde_json::json!({"ok": true}))
                },
            ),
        );
        (spawn_backend(app).await, captured)
    }

    fn make_state(api_base: &str) -> AppState {
        let store = SessionStore::new();
        let upstream = UpstreamClient::new(api_base, store.clone(), None).unwrap();
        let login = LoginFlow::new(LoginEndpoints::default(), store.clone(), None).unwrap();
        AppState {
            upstream: Arc::new(upstream),
            login: Arc::new(login),
            gate: AdmissionGate::new(),
            store,
        }
    }

    fn api_request(method: Method, path: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, "token-abc")
            .header(CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_forwarded_routes_require_authorization() {
        let app = build_router(make_state("http://127.0.0.1:9"));

        for (method, path) in [
            (Method::GET, "/conversations"),
            (Method::POST, "/conversation"),
            (Method::GET, "/conversation/abc"),
            (Method::PATCH, "/conversation/abc"),
            (Method::POST, "/conversation/gen_title/abc"),
            (Method::POST, "/conversation/message_feedback"),
            (Method::GET, "/models"),
            (Method::GET, "/accounts/check"),
        ] {
            let request = Request::builder()
                .method(method.clone())
                .uri(path)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {path}");
            let json = response_json(response).await;
            assert_eq!(json["errorMessage"], MISSING_TOKEN_ERROR);
        }
    }

    #[tokio::test]
    async fn test_root_and_health_skip_authorization() {
        let state = make_state("http://127.0.0.1:9");
        state
            .store
            .merge_cookies([("session-token".to_string(), "sess-1".to_string())]);
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["session-token"], "sess-1");
    }

    #[tokio::test]
    async fn test_conversation_send_is_normalized_and_forwarded() {
        let (base, captured) = capture_backend().await;
        let app = build_router(make_state(&base));

        let body = r#"{
            "action": "next",
            "conversation_id": "",
            "messages": [{"id": "m-1", "content": {"content_type": "text", "parts": ["hi"]}}],
            "model": "text-davinci-002-render"
        }"#;
        let response = app
            .oneshot(api_request(Method::POST, "/conversation", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let captured = captured.lock().clone().unwrap();
        assert_eq!(captured.method, Method::POST);
        assert_eq!(captured.path, "/conversation");
        assert_eq!(captured.authorization, "Bearer token-abc");

        let json: serde_json::Value = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(json["messages"][0]["author"]["role"], "user");
        assert_eq!(json["variant_purpose"], "none");
        assert_eq!(json["history_and_training_disabled"], true);
        assert!(json.get("conversation_id").is_none());
    }

    #[tokio::test]
    async fn test_second_send_rejected_while_first_in_flight() {
        let app = Router::new().route(
            "/conversation",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Json(serde_json::json!({"ok": true}))
            }),
        );
        let base = spawn_backend(app).await;
        let app = build_router(make_state(&base));

        let send = |app: Router| async move {
            app.oneshot(api_request(Method::POST, "/conversation", r#"{"messages":[]}"#))
                .await
                .unwrap()
        };

        let (first, second) = tokio::join!(send(app.clone()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            send(app.clone()).await
        });

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = response_json(second).await;
        assert_eq!(json["errorMessage"], BUSY_MESSAGE);

        // the gate opens once the first reply has been drained
        let _ = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        let third = send(app).await;
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_update_conversation_forwards_post_as_patch() {
        let (base, captured) = capture_backend().await;
        let app = build_router(make_state(&base));

        let response = app
            .oneshot(api_request(
                Method::POST,
                "/conversation/conv-9",
                r#"{"title": "Renamed"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let captured = captured.lock().clone().unwrap();
        assert_eq!(captured.method, Method::PATCH);
        assert_eq!(captured.path, "/conversation/conv-9");

        let json: serde_json::Value = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(json["title"], "Renamed");
        assert_eq!(json["is_visible"], true);
    }

    #[tokio::test]
    async fn test_clear_conversations_sends_fixed_body() {
        let (base, captured) = capture_backend().await;
        let app = build_router(make_state(&base));

        let response = app
            .oneshot(api_request(
                Method::PATCH,
                "/conversations",
                r#"{"title": "ignored", "is_visible": true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let captured = captured.lock().clone().unwrap();
        assert_eq!(captured.method, Method::PATCH);
        assert_eq!(captured.path, "/conversations");
        assert_eq!(&captured.body[..], br#"{"is_visible":false}"#);
    }

    #[tokio::test]
    async fn test_conversation_listing_defaults_offset_and_limit() {
        let (base, captured) = capture_backend().await;
        let app = build_router(make_state(&base));

        let response = app
            .clone()
            .oneshot(api_request(Method::GET, "/conversations", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            captured.lock().clone().unwrap().query.as_deref(),
            Some("offset=0&limit=20")
        );

        let response = app
            .oneshot(api_request(
                Method::GET,
                "/conversations?offset=40&limit=5",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            captured.lock().clone().unwrap().query.as_deref(),
            Some("offset=40&limit=5")
        );
    }

    #[tokio::test]
    async fn test_title_and_feedback_bodies_forwarded() {
        let (base, captured) = capture_backend().await;
        let app = build_router(make_state(&base));

        let response = app
            .clone()
            .oneshot(api_request(
                Method::POST,
                "/conversation/gen_title/conv-1",
                r#"{"message_id": "m-7"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sent = captured.lock().clone().unwrap();
        assert_eq!(sent.path, "/conversation/gen_title/conv-1");
        let json: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(json["message_id"], "m-7");

        let response = app
            .oneshot(api_request(
                Method::POST,
                "/conversation/message_feedback",
                r#"{"message_id": "m-7", "conversation_id": "conv-1", "rating": "thumbsUp"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sent = captured.lock().clone().unwrap();
        assert_eq!(sent.path, "/conversation/message_feedback");
        let json: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(json["rating"], "thumbsUp");
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected_and_gate_released() {
        let (base, captured) = capture_backend().await;
        let app = build_router(make_state(&base));

        let response = app
            .clone()
            .oneshot(api_request(Method::POST, "/conversation", "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["errorMessage"], PARSE_JSON_ERROR);
        assert!(captured.lock().is_none());

        // the rejected request must not leave the gate closed
        let response = app
            .oneshot(api_request(Method::POST, "/conversation", r#"{"messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_body_must_be_complete() {
        let app = build_router(make_state("http://127.0.0.1:9"));

        for body in [
            "{",
            r#"{"username": "user@example.com", "password": ""}"#,
            r#"{"password": "secret"}"#,
        ] {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/auth/login")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let json = response_json(response).await;
            assert_eq!(json["errorMessage"], PARSE_LOGIN_ERROR);
        }
    }
}
