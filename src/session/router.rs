//! Routes `/mcp` requests to session transports
//!
//! A request carrying a known `mcp-session-id` resumes that session. A
//! request without one may only open a new session, and only when its body
//! is an `initialize` request. Everything else is rejected before any
//! transport or registry state is touched.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::SessionError;
use crate::mcp::server::{is_initialize_request, McpHandler, ProtocolHandler};
use crate::session::header::SessionHeader;
use crate::session::registry::SessionRegistry;
use crate::transport::streamable_http::{
    uuid_session_id, SessionIdGenerator, StreamableHttpTransport, TransportOptions,
};

pub const INVALID_SESSION_TEXT: &str = "Invalid or missing session ID";

pub type HandlerFactory =
    Arc<dyn Fn() -> Result<Arc<dyn ProtocolHandler>, SessionError> + Send + Sync>;

/// Outcome of classifying one inbound request.
pub enum Route {
    Resume(Arc<StreamableHttpTransport>),
    NewSession,
    Rejected,
}

pub struct SessionRouter {
    sessions: Arc<SessionRegistry<StreamableHttpTransport>>,
    session_id_generator: SessionIdGenerator,
    handler_factory: HandlerFactory,
    sse_keep_alive: Duration,
}

impl SessionRouter {
    pub fn new(sse_keep_alive: Duration) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            session_id_generator: Arc::new(uuid_session_id),
            handler_factory: Arc::new(|| -> Result<Arc<dyn ProtocolHandler>, SessionError> {
                Ok(Arc::new(McpHandler::new()))
            }),
            sse_keep_alive,
        }
    }

    pub fn with_session_id_generator(mut self, generator: SessionIdGenerator) -> Self {
        self.session_id_generator = generator;
        self
    }

    pub fn with_handler_factory(mut self, factory: HandlerFactory) -> Self {
        self.handler_factory = factory;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry<StreamableHttpTransport> {
        &self.sessions
    }

    /// Decides what to do with a request. `body` is only consulted when no
    /// session header was sent.
    pub fn classify(&self, header: &SessionHeader, body: Option<&Value>) -> Route {
        match header {
            SessionHeader::Present(id) => match self.sessions.get(id.as_str()) {
                Some(transport) => Route::Resume(transport),
                None => Route::Rejected,
            },
            SessionHeader::Absent if body.is_some_and(is_initialize_request) => Route::NewSession,
            SessionHeader::Absent | SessionHeader::Malformed => Route::Rejected,
        }
    }

    pub async fn handle_post(&self, headers: &HeaderMap, body: Bytes) -> Response {
        let header = SessionHeader::from_headers(headers);
        let payload = match header {
            SessionHeader::Absent => serde_json::from_slice::<Value>(&body).ok(),
            SessionHeader::Present(_) | SessionHeader::Malformed => None,
        };

        match self.classify(&header, payload.as_ref()) {
            Route::Resume(transport) => {
                debug!(session_id = header.id().unwrap_or("-"), "resuming session");
                transport.handle_post(headers, &body).await
            }
            Route::NewSession => match self.provision() {
                Ok(transport) => transport.handle_post(headers, &body).await,
                Err(err) => err.into_response(),
            },
            Route::Rejected => {
                warn!(
                    session_id = header.id().unwrap_or("-"),
                    malformed = matches!(header, SessionHeader::Malformed),
                    "rejecting request without a valid session"
                );
                SessionError::InvalidSession.into_response()
            }
        }
    }

    pub fn handle_get(&self, headers: &HeaderMap) -> Response {
        match self.existing(headers) {
            Some(transport) => transport.handle_get(headers),
            None => invalid_session_text(),
        }
    }

    pub fn handle_delete(&self, headers: &HeaderMap) -> Response {
        match self.existing(headers) {
            Some(transport) => transport.handle_delete(headers),
            None => invalid_session_text(),
        }
    }

    /// Closes every live session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let transports = self.sessions.drain();
        for transport in &transports {
            transport.close();
        }
        transports.len()
    }

    fn existing(&self, headers: &HeaderMap) -> Option<Arc<StreamableHttpTransport>> {
        match self.classify(&SessionHeader::from_headers(headers), None) {
            Route::Resume(transport) => Some(transport),
            Route::NewSession | Route::Rejected => None,
        }
    }

    /// Builds a transport whose hooks register and unregister it. Nothing is
    /// inserted until the transport has assigned its identifier.
    fn provision(&self) -> Result<Arc<StreamableHttpTransport>, SessionError> {
        let handler = (self.handler_factory)()?;

        let on_init_sessions: Weak<SessionRegistry<StreamableHttpTransport>> =
            Arc::downgrade(&self.sessions);
        let on_close_sessions = Weak::clone(&on_init_sessions);

        let transport = StreamableHttpTransport::new(TransportOptions {
            session_id_generator: Arc::clone(&self.session_id_generator),
            on_session_initialized: Some(Box::new(
                move |id: &str, transport: Arc<StreamableHttpTransport>| -> Result<(), SessionError> {
                    let sessions = on_init_sessions.upgrade().ok_or_else(|| {
                        SessionError::Provisioning("session registry is gone".to_string())
                    })?;
                    sessions.create(id, transport)?;
                    info!(session_id = %id, live_sessions = sessions.len(), "session registered");
                    Ok(())
                },
            )),
            on_session_closed: Some(Box::new(move |id: &str| {
                if let Some(sessions) = on_close_sessions.upgrade() {
                    if sessions.remove(id) {
                        info!(session_id = %id, live_sessions = sessions.len(), "session removed");
                    }
                }
            })),
            sse_keep_alive: self.sse_keep_alive,
        });

        transport.connect(handler)?;
        Ok(transport)
    }
}

fn invalid_session_text() -> Response {
    (StatusCode::BAD_REQUEST, INVALID_SESSION_TEXT).into_response()
}
