//! The Model Context Protocol handler bound to one session
//!
//! Provides JSON-RPC decoding, method routing, capability negotiation
//! (`initialize`) and the server-initiated notification channel used by
//! transports to push `notifications/message` log events.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    CallToolRequest, Implementation, InitializeRequest, InitializeResult, JsonrpcMessage,
    JsonrpcRequest, ListResourcesRequest, ListResourcesResult, ListToolsRequest, ListToolsResult,
    PingRequest, ReadResourceRequest, ServerCapabilities, ServerCapabilitiesPrompts,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{
    prompts::{build_prompts_list, handle_prompts_get},
    resources::{build_resource_templates_list, build_resources_list, handle_resources_read},
    tools::{build_tools_list, handle_tools_call, tool_name},
};
use crate::errors::AppError;
use crate::mcp::rpc::{
    app_error_to_json_rpc, is_json_rpc_error, json_rpc_error, json_rpc_notification,
    json_rpc_result, request_id_to_value, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND,
};

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

const NOTIFICATION_CAPACITY: usize = 64;
const LOGGING_DISABLED: u8 = u8::MAX;

/// Capability provider bound to a transport.
///
/// `handle_message` returns `None` for inputs that must not be answered
/// (notifications and responses).
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn handle_message(&self, message: Value) -> Option<Value>;

    /// Receiver for server-initiated messages.
    fn subscribe(&self) -> broadcast::Receiver<Value>;
}

/// Syslog-style severities accepted by `logging/setLevel`, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LoggingLevel {
    const ALL: [LoggingLevel; 8] = [
        Self::Debug,
        Self::Info,
        Self::Notice,
        Self::Warning,
        Self::Error,
        Self::Critical,
        Self::Alert,
        Self::Emergency,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == value.trim().to_ascii_lowercase())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }

    fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }
}

pub struct McpHandler {
    notifications: broadcast::Sender<Value>,
    log_level: AtomicU8,
    client_initialized: AtomicBool,
}

impl Default for McpHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl McpHandler {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            notifications,
            log_level: AtomicU8::new(LOGGING_DISABLED),
            client_initialized: AtomicBool::new(false),
        }
    }

    /// Whether the client has sent `notifications/initialized`.
    pub fn is_client_initialized(&self) -> bool {
        self.client_initialized.load(Ordering::Acquire)
    }

    pub fn log_level(&self) -> Option<LoggingLevel> {
        LoggingLevel::from_index(self.log_level.load(Ordering::Acquire))
    }

    /// Emits a `notifications/message` event when `level` passes the
    /// client-selected threshold. Returns the number of receivers reached.
    pub fn emit_log(&self, level: LoggingLevel, logger: &str, data: Value) -> usize {
        match self.log_level() {
            Some(threshold) if level >= threshold => self
                .notifications
                .send(json_rpc_notification(
                    "notifications/message",
                    json!({
                        "level": level.as_str(),
                        "logger": logger,
                        "data": data,
                    }),
                ))
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub async fn handle_json_rpc_value(&self, payload: Value) -> Option<Value> {
        if !payload.is_object() {
            return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
        }

        let request_id = payload.get("id").cloned();
        let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(_) => return Some(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request")),
        };

        match parsed {
            JsonrpcMessage::Request(request) => {
                if let Err(error_response) = validate_request_shape(&request) {
                    return Some(error_response);
                }

                let request_id = request_id_to_value(request.id);
                if request.method.trim().is_empty() {
                    return Some(json_rpc_error(
                        Some(request_id),
                        INVALID_REQUEST,
                        "Invalid Request",
                    ));
                }

                Some(
                    self.handle_json_rpc_request(
                        Some(request_id),
                        request.method,
                        request.params.map(Value::Object),
                    )
                    .await,
                )
            }
            JsonrpcMessage::Notification(notification) => {
                match notification.method.as_str() {
                    "notifications/initialized" => {
                        self.client_initialized.store(true, Ordering::Release);
                        debug!("client completed initialization");
                    }
                    other => debug!(method = %other, "ignoring client notification"),
                }
                None
            }
            JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => {
                debug!("ignoring client response without pending server request");
                None
            }
        }
    }

    pub async fn handle_json_rpc_request(
        &self,
        id: Option<Value>,
        method: String,
        params: Option<Value>,
    ) -> Value {
        let audit_params = redact_audit_params(params.as_ref());

        let response = match method.as_str() {
            "initialize" => match build_initialize_result(params.as_ref()) {
                Ok(result) => json_rpc_result(id, result),
                Err(err) => app_error_to_json_rpc(id, err),
            },
            "ping" => json_rpc_result(id, json!({})),
            "logging/setLevel" => {
                let level = params
                    .as_ref()
                    .and_then(|params| params.get("level"))
                    .and_then(Value::as_str)
                    .and_then(LoggingLevel::parse);
                match level {
                    Some(level) => {
                        self.log_level.store(level as u8, Ordering::Release);
                        json_rpc_result(id, json!({}))
                    }
                    None => app_error_to_json_rpc(
                        id,
                        AppError::bad_request("invalid_level", "level must be a syslog severity"),
                    ),
                }
            }
            "tools/list" => to_result(
                id,
                ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: build_tools_list(),
                },
            ),
            "tools/call" => {
                let name = tool_name(params.as_ref()).unwrap_or_default().to_string();
                let response = handle_tools_call(id, params);
                let is_error = is_json_rpc_error(&response)
                    || response["result"]["isError"].as_bool().unwrap_or(false);
                self.emit_log(
                    if is_error {
                        LoggingLevel::Warning
                    } else {
                        LoggingLevel::Info
                    },
                    "tools",
                    json!({ "tool": name, "isError": is_error }),
                );
                response
            }
            "resources/list" => to_result(
                id,
                ListResourcesResult {
                    meta: None,
                    next_cursor: None,
                    resources: build_resources_list(),
                },
            ),
            "resources/templates/list" => json_rpc_result(
                id,
                json!({ "resourceTemplates": build_resource_templates_list() }),
            ),
            "resources/read" => handle_resources_read(id, params),
            "prompts/list" => json_rpc_result(id, json!({ "prompts": build_prompts_list() })),
            "prompts/get" => handle_prompts_get(id, params),
            _ => json_rpc_error(id, METHOD_NOT_FOUND, "Method not found"),
        };

        info!(
            method = %method,
            params = %audit_params,
            outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
            "mcp action audited"
        );

        response
    }
}

#[async_trait]
impl ProtocolHandler for McpHandler {
    async fn handle_message(&self, message: Value) -> Option<Value> {
        self.handle_json_rpc_value(message).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }
}

fn to_result<T: serde::Serialize>(id: Option<Value>, result: T) -> Value {
    match serde_json::to_value(result) {
        Ok(result) => json_rpc_result(id, result),
        Err(_) => json_rpc_error(id, INTERNAL_ERROR, "Internal error"),
    }
}

/// Whether `payload` is a single, well-formed `initialize` request.
pub fn is_initialize_request(payload: &Value) -> bool {
    payload.is_object()
        && payload.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
        && payload.get("id").is_some_and(|id| id.is_string() || id.is_i64())
        && payload.get("method").and_then(Value::as_str) == Some("initialize")
        && serde_json::from_value::<InitializeRequest>(payload.clone()).is_ok()
}

pub fn validate_request_shape(request: &JsonrpcRequest) -> Result<(), Value> {
    let request_id = Some(request_id_to_value(request.id.clone()));
    let Ok(payload) = serde_json::to_value(request) else {
        return Err(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request"));
    };

    let valid = match request.method.as_str() {
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "resources/read" => serde_json::from_value::<ReadResourceRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "resources/list" => serde_json::from_value::<ListResourcesRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(json_rpc_error(request_id, INVALID_PARAMS, "Invalid params"))
    }
}

/// Picks the protocol version to answer with: the client's offer when it is
/// supported, otherwise the latest version this server speaks.
pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_protocol_version",
                "initialize params.protocolVersion is required",
            )
        })?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .into_iter()
        .find(|supported| *supported == offered_version)
        .unwrap_or(LATEST_PROTOCOL_VERSION))
}

fn build_initialize_result(params: Option<&Value>) -> Result<Value, AppError> {
    let protocol_version = negotiate_protocol_version(params)?;

    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            resources: Some(ServerCapabilitiesResources {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
            prompts: Some(ServerCapabilitiesPrompts {
                list_changed: Some(false),
            }),
            ..Default::default()
        },
        protocol_version: protocol_version.to_string(),
        instructions: None,
        meta: None,
    };

    let mut result = serde_json::to_value(initialize_result)
        .map_err(|err| AppError::internal(format!("initialize result serialization: {err}")))?;
    result["capabilities"]["logging"] = json!({});
    Ok(result)
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let item = if is_sensitive_key(key) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        redact_audit_value(item)
                    };
                    (key.clone(), item)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    ["token", "secret", "password", "credential", "api_key", "apikey", "authorization"]
        .iter()
        .any(|marker| normalized.contains(marker))
}
