//! Streamable HTTP client for the `/mcp` endpoint
//!
//! Opens a session with `initialize`, replays the returned `mcp-session-id`
//! on every later request and terminates the session with `DELETE`.
//! Responses may arrive as plain JSON or as a single SSE-framed message.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use anyhow::Context as _;
use reqwest::{header::CONTENT_TYPE, StatusCode};
use rust_mcp_sdk::schema::{CallToolResult, InitializeResult, ListResourcesResult, ListToolsResult};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use crate::mcp::server::LATEST_PROTOCOL_VERSION;
use crate::session::header::MCP_SESSION_ID_HEADER;

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

pub struct HttpMcpClient {
    http: reqwest::Client,
    endpoint: Url,
    session_id: Option<String>,
    protocol_version: String,
    next_id: AtomicI64,
}

impl HttpMcpClient {
    pub fn new(endpoint: Url) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            http,
            endpoint,
            session_id: None,
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            next_id: AtomicI64::new(1),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Runs the initialization handshake and keeps the assigned session id.
    pub async fn initialize(
        &mut self,
        client_name: &str,
        client_version: &str,
    ) -> anyhow::Result<InitializeResult> {
        if self.session_id.is_some() {
            anyhow::bail!("session already initialized");
        }

        let params = json!({
            "protocolVersion": self.protocol_version,
            "capabilities": {},
            "clientInfo": { "name": client_name, "version": client_version }
        });
        let (result, session_id) = self.send_request("initialize", Some(params)).await?;
        let session_id = session_id.context("server did not assign a session id")?;
        debug!(session_id = %session_id, "session opened");
        self.session_id = Some(session_id);

        let init: InitializeResult = decode(result)?;
        self.protocol_version = init.protocol_version.clone();

        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    pub async fn list_resources(&self) -> anyhow::Result<ListResourcesResult> {
        decode(self.request("resources/list", None).await?)
    }

    pub async fn list_resource_templates(&self) -> anyhow::Result<Value> {
        self.request("resources/templates/list", None).await
    }

    pub async fn read_resource(&self, uri: &str) -> anyhow::Result<Value> {
        self.request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    pub async fn list_tools(&self) -> anyhow::Result<ListToolsResult> {
        decode(self.request("tools/list", None).await?)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<CallToolResult> {
        let params = json!({ "name": name, "arguments": arguments });
        decode(self.request("tools/call", Some(params)).await?)
    }

    pub async fn list_prompts(&self) -> anyhow::Result<Value> {
        self.request("prompts/list", None).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Map<String, Value>) -> anyhow::Result<Value> {
        self.request(
            "prompts/get",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    pub async fn set_logging_level(&self, level: &str) -> anyhow::Result<()> {
        self.request("logging/setLevel", Some(json!({ "level": level })))
            .await
            .map(|_| ())
    }

    /// Terminates the session. A client without a session has nothing to close.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        let response = self
            .http
            .delete(self.endpoint.clone())
            .header(MCP_SESSION_ID_HEADER, &session_id)
            .send()
            .await
            .context("send session termination")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("session termination failed: {status} {body}");
        }

        debug!(session_id = %session_id, "session closed");
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> anyhow::Result<Value> {
        if self.session_id.is_none() {
            anyhow::bail!("mcp client not initialized");
        }
        let (result, _) = self.send_request(method, params).await?;
        Ok(result)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> anyhow::Result<()> {
        let mut message = json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }

        let response = self.post(&message).send().await.context("send notification")?;
        let status = response.status();
        if status == StatusCode::ACCEPTED || status.is_success() {
            return Ok(());
        }
        anyhow::bail!("notification {method} failed: {status}");
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> anyhow::Result<(Value, Option<String>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }

        let response = self
            .post(&message)
            .send()
            .await
            .with_context(|| format!("send {method} request"))?;

        let status = response.status();
        let session_id = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.context("read response body")?;
        debug!(method, status = status.as_u16(), content_type = %content_type, "mcp http response");

        if status == StatusCode::ACCEPTED {
            anyhow::bail!("server returned 202 accepted for {method}");
        }
        if !status.is_success() {
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            anyhow::bail!("mcp http status {status}: {detail}");
        }

        let payload = parse_response_body(&content_type, &body)?;
        Ok((extract_result(payload)?, session_id))
    }

    fn post(&self, message: &Value) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, ACCEPT_BOTH)
            .header("mcp-protocol-version", &self.protocol_version)
            .json(message);
        if let Some(session_id) = &self.session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }
}

/// Collects the `data:` payload of each blank-line delimited SSE event.
pub fn decode_sse_events(buf: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            if !data_lines.is_empty() {
                events.push(data_lines.join("\n"));
                data_lines.clear();
            }
            continue;
        }

        // Comments and unknown fields.
        if line.starts_with(':') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if !data_lines.is_empty() {
        events.push(data_lines.join("\n"));
    }

    events
}

pub fn parse_response_body(content_type: &str, body: &str) -> anyhow::Result<Value> {
    if content_type.starts_with("text/event-stream") {
        let events = decode_sse_events(body);
        let first = events.first().context("no sse events in response")?;
        return serde_json::from_str(first).context("parse sse data as json");
    }
    if content_type.starts_with("application/json") || content_type.is_empty() {
        return serde_json::from_str(body).context("parse application/json");
    }
    anyhow::bail!("unsupported content-type: {content_type}")
}

/// Unwraps a JSON-RPC response, turning error responses into errors.
pub fn extract_result(payload: Value) -> anyhow::Result<Value> {
    if payload["jsonrpc"] != "2.0" {
        anyhow::bail!("invalid jsonrpc version in response");
    }
    if let Some(error) = payload.get("error") {
        anyhow::bail!(
            "mcp json-rpc error {}: {}",
            error["code"],
            error["message"].as_str().unwrap_or("unknown error")
        );
    }
    payload
        .get("result")
        .cloned()
        .context("json-rpc response without result")
}

fn decode<T: DeserializeOwned>(value: Value) -> anyhow::Result<T> {
    serde_json::from_value(value).context("decode result")
}
