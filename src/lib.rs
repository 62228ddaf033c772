use std::{future::Future, sync::Arc};

use axum::{middleware, routing::get, Router};
use tracing::info;

pub mod client;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod session;
pub mod transport;

use session::router::SessionRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<SessionRouter>,
}

impl AppState {
    pub fn new(router: SessionRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(
            "/mcp",
            get(http::handlers::mcp_get)
                .post(http::handlers::mcp_post)
                .delete(http::handlers::mcp_delete),
        )
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

/// Serves the app until `signal` resolves. Live sessions are closed as soon
/// as the signal fires so open SSE streams end and graceful shutdown can
/// finish.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = Arc::clone(&state.router);
    let app = build_app(state);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            signal.await;
            let closed = router.close_all();
            info!(closed_sessions = closed, "sessions closed for shutdown");
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::errors::{SessionError, NO_VALID_SESSION_MESSAGE};
    use crate::mcp::rpc::{
        INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, SESSION_REQUIRED,
    };
    use crate::mcp::server::ProtocolHandler;
    use crate::session::header::MCP_SESSION_ID_HEADER;
    use crate::session::router::INVALID_SESSION_TEXT;
    use crate::transport::streamable_http::DEFAULT_SSE_KEEP_ALIVE;

    use super::*;

    const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18","clientInfo":{"name":"test-client","version":"1.0.0"},"capabilities":{}}}"#;

    fn app_with(router: SessionRouter) -> (Router, AppState) {
        let state = AppState::new(router);
        (build_app(state.clone()), state)
    }

    fn app() -> (Router, AppState) {
        app_with(SessionRouter::new(DEFAULT_SSE_KEEP_ALIVE))
    }

    fn post(body: impl Into<String>, session_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream");
        if let Some(id) = session_id {
            builder = builder.header(MCP_SESSION_ID_HEADER, id);
        }
        builder
            .body(Body::from(body.into()))
            .expect("request build")
    }

    fn without_body(method: &str, session_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/mcp")
            .method(method)
            .header(header::ACCEPT, "text/event-stream");
        if let Some(id) = session_id {
            builder = builder.header(MCP_SESSION_ID_HEADER, id);
        }
        builder.body(Body::empty()).expect("request build")
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone()
            .oneshot(request)
            .await
            .expect("request execution")
    }

    async fn body_bytes(response: Response) -> axum::body::Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("valid json response")
    }

    fn session_header(response: &Response) -> Option<String> {
        response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    async fn open_session(app: &Router) -> String {
        let response = send(app, post(INITIALIZE, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        session_header(&response).expect("session id header")
    }

    fn assert_no_valid_session(body: &Value) {
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], SESSION_REQUIRED);
        assert_eq!(body["error"]["message"], NO_VALID_SESSION_MESSAGE);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = app();
        let response = send(
            &app,
            Request::builder()
                .uri("/health")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn discovery_points_at_mcp_endpoint() {
        let (app, _) = app();
        let response = send(
            &app,
            Request::builder()
                .uri("/.well-known/mcp")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["mcp_endpoint"], "/mcp");
        assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn root_get_is_not_found() {
        let (app, _) = app();
        let response = send(
            &app,
            Request::builder()
                .uri("/")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejected_initialize_leaves_no_session() {
        let (app, state) = app();
        let response = send(
            &app,
            post(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"  ","clientInfo":{"name":"test-client","version":"1.0.0"},"capabilities":{}}}"#,
                None,
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(session_header(&response).is_none());
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["error"]["code"], INVALID_PARAMS);
        assert!(state.router.sessions().is_empty());

        let id = open_session(&app).await;
        assert_eq!(state.router.sessions().ids(), vec![id]);
    }

    #[tokio::test]
    async fn request_without_session_is_rejected_without_state_change() {
        let (app, state) = app();
        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#, None),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(session_header(&response).is_none());
        assert_no_valid_session(&body_json(response).await);
        assert!(state.router.sessions().is_empty());
    }

    #[tokio::test]
    async fn unparsable_body_without_session_is_rejected() {
        let (app, state) = app();
        let response = send(&app, post("{not json", None)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_no_valid_session(&body_json(response).await);
        assert!(state.router.sessions().is_empty());
    }

    #[tokio::test]
    async fn initialize_creates_session_and_returns_header() {
        let (app, state) = app();
        let response = send(&app, post(INITIALIZE, None)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let session_id = session_header(&response).expect("session id header");
        assert!(uuid::Uuid::parse_str(&session_id).is_ok());
        assert_eq!(state.router.sessions().ids(), vec![session_id]);

        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
        assert_eq!(body["result"]["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert!(body["result"]["capabilities"]["tools"].is_object());
        assert!(body["result"]["capabilities"]["resources"].is_object());
        assert!(body["result"]["capabilities"]["prompts"].is_object());
        assert!(body["result"]["capabilities"]["logging"].is_object());
    }

    #[tokio::test]
    async fn initialize_with_unknown_session_header_is_rejected() {
        let (app, state) = app();
        let response = send(&app, post(INITIALIZE, Some("not-a-live-session"))).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_no_valid_session(&body_json(response).await);
        assert!(state.router.sessions().is_empty());
    }

    #[tokio::test]
    async fn batched_initialize_without_session_is_rejected() {
        let (app, state) = app();
        let response = send(&app, post(format!("[{INITIALIZE}]"), None)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_no_valid_session(&body_json(response).await);
        assert!(state.router.sessions().is_empty());
    }

    #[tokio::test]
    async fn malformed_session_header_is_rejected() {
        let (app, state) = app();
        open_session(&app).await;

        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#, Some("bad id")),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_no_valid_session(&body_json(response).await);
        assert_eq!(state.router.sessions().len(), 1);
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let (app, state) = app();
        let session_id = open_session(&app).await;

        let response = send(
            &app,
            post(
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
                Some(&session_id),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(body_bytes(response).await.is_empty());

        let response = send(
            &app,
            post(
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"calculate","arguments":{"operation":"multiply","a":6,"b":7}}}"#,
                Some(&session_id),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session_header(&response).as_deref(), Some(session_id.as_str()));
        let body = body_json(response).await;
        assert_eq!(body["result"]["content"][0]["text"], "Result: 6 multiply 7 = 42");

        let response = send(&app, without_body("DELETE", Some(&session_id))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.router.sessions().is_empty());

        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#, Some(&session_id)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_no_valid_session(&body_json(response).await);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let (app, state) = app();
        let first = open_session(&app).await;
        let second = open_session(&app).await;
        assert_ne!(first, second);

        let response = send(&app, without_body("DELETE", Some(&first))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#, Some(&second)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.router.sessions().ids(), vec![second]);
    }

    #[tokio::test]
    async fn unknown_method_in_session_returns_method_not_found() {
        let (app, _) = app();
        let session_id = open_session(&app).await;

        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":4,"method":"unknown"}"#, Some(&session_id)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 4);
        assert_eq!(body["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_with_initialize_inside_session_is_rejected() {
        let (app, state) = app();
        let session_id = open_session(&app).await;

        let batch = format!(r#"[{INITIALIZE},{{"jsonrpc":"2.0","id":2,"method":"ping"}}]"#);
        let response = send(&app, post(batch, Some(&session_id))).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], INVALID_REQUEST);
        assert_eq!(state.router.sessions().ids(), vec![session_id]);
    }

    #[tokio::test]
    async fn get_and_delete_without_session_are_plain_text_errors() {
        let (app, state) = app();

        for method in ["GET", "DELETE"] {
            for session_id in [None, Some("unknown-session")] {
                let response = send(&app, without_body(method, session_id)).await;
                assert_eq!(response.status(), StatusCode::BAD_REQUEST);
                assert_eq!(body_bytes(response).await, INVALID_SESSION_TEXT);
            }
        }
        assert!(state.router.sessions().is_empty());
    }

    #[tokio::test]
    async fn sse_stream_delivers_notifications_and_ends_on_delete() {
        let (app, _) = app();
        let session_id = open_session(&app).await;

        let response = send(
            &app,
            post(
                r#"{"jsonrpc":"2.0","id":2,"method":"logging/setLevel","params":{"level":"info"}}"#,
                Some(&session_id),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let stream = send(&app, without_body("GET", Some(&session_id))).await;
        assert_eq!(stream.status(), StatusCode::OK);
        assert_eq!(
            stream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );

        let second = send(&app, without_body("GET", Some(&session_id))).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);

        send(
            &app,
            post(
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"get-weather","arguments":{"city":"Beijing"}}}"#,
                Some(&session_id),
            ),
        )
        .await;

        let response = send(&app, without_body("DELETE", Some(&session_id))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = tokio::time::timeout(Duration::from_secs(5), body_bytes(stream))
            .await
            .expect("stream ends after delete");
        let text = String::from_utf8(body.to_vec()).expect("utf8 sse body");
        assert!(text.contains("event: message"));
        assert!(text.contains("notifications/message"));
        assert!(text.contains("get-weather"));

        let response = send(&app, without_body("GET", Some(&session_id))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_bytes(response).await, INVALID_SESSION_TEXT);
    }

    #[tokio::test]
    async fn concurrent_initializations_get_distinct_sessions() {
        let (app, state) = app();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                let response = app
                    .oneshot(post(INITIALIZE, None))
                    .await
                    .expect("request execution");
                assert_eq!(response.status(), StatusCode::OK);
                session_header(&response).expect("session id header")
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.expect("task join"));
        }

        assert_eq!(ids.len(), 16);
        assert_eq!(state.router.sessions().len(), 16);
        for id in &ids {
            assert!(state.router.sessions().contains(id));
        }
    }

    #[tokio::test]
    async fn duplicate_generated_id_is_rejected_without_overwrite() {
        let (app, state) = app_with(
            SessionRouter::new(DEFAULT_SSE_KEEP_ALIVE)
                .with_session_id_generator(Arc::new(|| "same-id".to_string())),
        );
        let first = open_session(&app).await;
        let original = state.router.sessions().get(&first).expect("registered");

        let response = send(&app, post(INITIALIZE, None)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(session_header(&response).is_none());
        assert_eq!(body_json(response).await["error"]["code"], INTERNAL_ERROR);

        let current = state.router.sessions().get(&first).expect("still registered");
        assert!(Arc::ptr_eq(&original, &current));
        assert_eq!(state.router.sessions().len(), 1);

        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#, Some(&first)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn provisioning_failure_inserts_nothing() {
        let (app, state) = app_with(SessionRouter::new(DEFAULT_SSE_KEEP_ALIVE).with_handler_factory(
            Arc::new(|| -> Result<Arc<dyn ProtocolHandler>, SessionError> {
                Err(SessionError::Provisioning("handler unavailable".to_string()))
            }),
        ));

        let response = send(&app, post(INITIALIZE, None)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"]["code"], INTERNAL_ERROR);
        assert!(state.router.sessions().is_empty());
    }

    #[tokio::test]
    async fn close_all_ends_every_session() {
        let (app, state) = app();
        let first = open_session(&app).await;
        open_session(&app).await;

        assert_eq!(state.router.close_all(), 2);
        assert!(state.router.sessions().is_empty());

        let response = send(
            &app,
            post(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#, Some(&first)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
