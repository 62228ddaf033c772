//! Streamable HTTP transport for one MCP session
//!
//! A transport owns the session identifier, the bound protocol handler and
//! the close signal. The identifier is assigned while handling the
//! `initialize` request and is announced to the owner through the
//! initialization hook before it is returned to the client; closing fires
//! the close hook at most once.

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use axum::{
    http::{header::ACCEPT, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::headers::HeaderMapExt;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{SessionError, TransportError};
use crate::mcp::rpc::{
    is_json_rpc_error, json_rpc_error_without_id, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR, SESSION_NOT_FOUND,
    SESSION_REQUIRED,
};
use crate::mcp::server::{is_initialize_request, ProtocolHandler};
use crate::session::header::{is_valid_session_id, McpSessionId, SessionHeader};

pub const DEFAULT_SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub type SessionIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;
pub type SessionInitializedHook =
    Box<dyn FnOnce(&str, Arc<StreamableHttpTransport>) -> Result<(), SessionError> + Send>;
pub type SessionClosedHook = Box<dyn FnOnce(&str) + Send>;

pub fn uuid_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct TransportOptions {
    pub session_id_generator: SessionIdGenerator,
    pub on_session_initialized: Option<SessionInitializedHook>,
    pub on_session_closed: Option<SessionClosedHook>,
    pub sse_keep_alive: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            session_id_generator: Arc::new(uuid_session_id),
            on_session_initialized: None,
            on_session_closed: None,
            sse_keep_alive: DEFAULT_SSE_KEEP_ALIVE,
        }
    }
}

enum InitializeError {
    AlreadyInitialized,
    Session(SessionError),
}

pub struct StreamableHttpTransport {
    session_id: OnceLock<String>,
    handler: OnceLock<Arc<dyn ProtocolHandler>>,
    session_id_generator: SessionIdGenerator,
    on_session_initialized: Mutex<Option<SessionInitializedHook>>,
    on_session_closed: Mutex<Option<SessionClosedHook>>,
    registered: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    standalone_stream: AtomicBool,
    sse_keep_alive: Duration,
}

/// Releases the standalone SSE slot when the stream is dropped.
struct StandaloneStreamGuard(Arc<StreamableHttpTransport>);

impl Drop for StandaloneStreamGuard {
    fn drop(&mut self) {
        self.0.standalone_stream.store(false, Ordering::Release);
        debug!(
            session_id = self.0.session_id().unwrap_or("-"),
            "standalone sse stream ended"
        );
    }
}

impl StreamableHttpTransport {
    pub fn new(options: TransportOptions) -> Arc<Self> {
        Arc::new(Self {
            session_id: OnceLock::new(),
            handler: OnceLock::new(),
            session_id_generator: options.session_id_generator,
            on_session_initialized: Mutex::new(options.on_session_initialized),
            on_session_closed: Mutex::new(options.on_session_closed),
            registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            standalone_stream: AtomicBool::new(false),
            sse_keep_alive: options.sse_keep_alive,
        })
    }

    /// Binds the protocol handler. A transport serves exactly one handler.
    pub fn connect(&self, handler: Arc<dyn ProtocolHandler>) -> Result<(), TransportError> {
        self.handler
            .set(handler)
            .map_err(|_| TransportError::AlreadyConnected)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the transport has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Closes the transport. Only the first call has any effect; it ends
    /// open SSE streams and, for a registered session, fires the close hook.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();

        if !self.registered.load(Ordering::Acquire) {
            return;
        }

        let hook = self
            .on_session_closed
            .lock()
            .ok()
            .and_then(|mut hook| hook.take());
        if let (Some(id), Some(hook)) = (self.session_id.get(), hook) {
            hook(id);
            info!(session_id = %id, "session transport closed");
        }
    }

    pub async fn handle_post(self: &Arc<Self>, headers: &HeaderMap, body: &[u8]) -> Response {
        if !accepts(headers, "application/json", true) {
            return json_error(
                StatusCode::NOT_ACCEPTABLE,
                SESSION_REQUIRED,
                "Not Acceptable: Client must accept application/json",
            );
        }

        let Some(handler) = self.handler.get() else {
            warn!(error = %TransportError::NotConnected, "rejecting message");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR,
                "Internal error",
            );
        };

        let payload: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(_) => return json_error(StatusCode::BAD_REQUEST, PARSE_ERROR, "Parse error"),
        };

        let is_batch = payload.is_array();
        let messages = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };
        if messages.is_empty() {
            return json_error(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Invalid Request");
        }

        if messages.iter().any(is_initialize_request) {
            if messages.len() > 1 {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    INVALID_REQUEST,
                    "Invalid Request: Only one initialization request is allowed",
                );
            }

            let Some(message) = messages.into_iter().next() else {
                return json_error(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Invalid Request");
            };
            return self.handle_initialize(handler, message).await;
        } else if let Err(response) = self.validate_session(headers) {
            return response;
        }

        let mut responses = Vec::new();
        for message in messages {
            if let Some(response) = handler.handle_message(message).await {
                responses.push(response);
            }
        }

        let mut response = if responses.is_empty() {
            StatusCode::ACCEPTED.into_response()
        } else if is_batch {
            (StatusCode::OK, Json(Value::Array(responses))).into_response()
        } else {
            let single = responses.pop().unwrap_or(Value::Null);
            (StatusCode::OK, Json(single)).into_response()
        };

        self.attach_session_header(&mut response);
        response
    }

    /// Answers `initialize` before assigning an identifier. A rejected
    /// handshake closes the transport and is returned without a session header.
    async fn handle_initialize(
        self: &Arc<Self>,
        handler: &Arc<dyn ProtocolHandler>,
        message: Value,
    ) -> Response {
        if self.session_id.get().is_some() {
            return already_initialized();
        }

        let reply = match handler.handle_message(message).await {
            Some(reply) if !is_json_rpc_error(&reply) => reply,
            rejected => {
                warn!("initialize rejected by handler, closing transport");
                self.close();
                return match rejected {
                    Some(error) => (StatusCode::OK, Json(error)).into_response(),
                    None => json_error(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Invalid Request"),
                };
            }
        };

        match self.initialize_session() {
            Ok(id) => info!(session_id = %id, "session initialized"),
            Err(InitializeError::AlreadyInitialized) => return already_initialized(),
            Err(InitializeError::Session(err)) => return err.into_response(),
        }

        let mut response = (StatusCode::OK, Json(reply)).into_response();
        self.attach_session_header(&mut response);
        response
    }

    pub fn handle_get(self: &Arc<Self>, headers: &HeaderMap) -> Response {
        if !accepts(headers, "text/event-stream", false) {
            return json_error(
                StatusCode::NOT_ACCEPTABLE,
                SESSION_REQUIRED,
                "Not Acceptable: Client must accept text/event-stream",
            );
        }

        if let Err(response) = self.validate_session(headers) {
            return response;
        }

        let Some(handler) = self.handler.get() else {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR,
                "Internal error",
            );
        };

        if self
            .standalone_stream
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return json_error(
                StatusCode::CONFLICT,
                SESSION_REQUIRED,
                "Conflict: Only one SSE stream is allowed per session",
            );
        }

        let guard = StandaloneStreamGuard(Arc::clone(self));
        let shutdown = self.shutdown.clone();
        let mut notifications = handler.subscribe();

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                // Queued messages are delivered before the close is observed.
                let next = tokio::select! {
                    biased;
                    received = notifications.recv() => Some(received),
                    _ = shutdown.cancelled() => None,
                };

                match next {
                    Some(Ok(message)) => {
                        yield Ok::<Event, Infallible>(
                            Event::default().event("message").data(message.to_string()),
                        );
                    }
                    Some(Err(RecvError::Lagged(skipped))) => {
                        warn!(skipped, "sse client lagged, skipped messages");
                    }
                    Some(Err(RecvError::Closed)) | None => break,
                }
            }
        };

        debug!(session_id = self.session_id().unwrap_or("-"), "standalone sse stream opened");

        let mut response = Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(self.sse_keep_alive))
            .into_response();
        self.attach_session_header(&mut response);
        response
    }

    pub fn handle_delete(self: &Arc<Self>, headers: &HeaderMap) -> Response {
        if let Err(response) = self.validate_session(headers) {
            return response;
        }

        self.close();
        StatusCode::OK.into_response()
    }

    fn initialize_session(self: &Arc<Self>) -> Result<String, InitializeError> {
        if self.session_id.get().is_some() {
            return Err(InitializeError::AlreadyInitialized);
        }

        let id = (self.session_id_generator)();
        if !is_valid_session_id(&id) {
            return Err(InitializeError::Session(SessionError::Provisioning(
                "generated session id is not visible ascii".to_string(),
            )));
        }

        if self.session_id.set(id.clone()).is_err() {
            return Err(InitializeError::AlreadyInitialized);
        }

        let hook = self
            .on_session_initialized
            .lock()
            .ok()
            .and_then(|mut hook| hook.take());
        if let Some(hook) = hook {
            if let Err(err) = hook(&id, Arc::clone(self)) {
                // Never registered: close without firing the close hook.
                self.close();
                return Err(InitializeError::Session(err));
            }
        }

        self.registered.store(true, Ordering::Release);
        Ok(id)
    }

    fn validate_session(&self, headers: &HeaderMap) -> Result<(), Response> {
        let Some(session_id) = self.session_id.get() else {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                SESSION_REQUIRED,
                "Bad Request: Server not initialized",
            ));
        };

        if self.is_closed() {
            return Err(json_error(
                StatusCode::NOT_FOUND,
                SESSION_NOT_FOUND,
                "Session not found",
            ));
        }

        match SessionHeader::from_headers(headers) {
            SessionHeader::Present(id) if id.as_str() == session_id => Ok(()),
            SessionHeader::Present(_) => Err(json_error(
                StatusCode::NOT_FOUND,
                SESSION_NOT_FOUND,
                "Session not found",
            )),
            SessionHeader::Absent | SessionHeader::Malformed => Err(json_error(
                StatusCode::BAD_REQUEST,
                SESSION_REQUIRED,
                "Bad Request: Mcp-Session-Id header is required",
            )),
        }
    }

    fn attach_session_header(&self, response: &mut Response) {
        if let Some(id) = self.session_id.get().cloned().and_then(McpSessionId::new) {
            response.headers_mut().typed_insert(id);
        }
    }
}

fn json_error(status: StatusCode, code: i32, message: &str) -> Response {
    (status, Json(json_rpc_error_without_id(code, message))).into_response()
}

fn already_initialized() -> Response {
    json_error(
        StatusCode::BAD_REQUEST,
        INVALID_REQUEST,
        "Invalid Request: Server already initialized",
    )
}

/// Whether the `Accept` header admits `mime`. A missing header admits it
/// only when `allow_missing` is set.
pub fn accepts(headers: &HeaderMap, mime: &str, allow_missing: bool) -> bool {
    let values: Vec<&str> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        return allow_missing;
    }

    let wildcard = mime
        .split_once('/')
        .map(|(kind, _)| format!("{kind}/*"))
        .unwrap_or_default();

    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(|range| range.split(';').next().unwrap_or_default().trim())
        .any(|range| {
            range.eq_ignore_ascii_case(mime) || range == "*/*" || range.eq_ignore_ascii_case(&wildcard)
        })
}
