use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum_extra::headers::{self, Header, HeaderMapExt};

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

static MCP_SESSION_ID: HeaderName = HeaderName::from_static(MCP_SESSION_ID_HEADER);

/// Typed `mcp-session-id` header.
///
/// Values must be non-empty visible ASCII; anything else fails to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpSessionId(String);

impl McpSessionId {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        is_valid_session_id(&value).then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn is_valid_session_id(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| (0x21..=0x7e).contains(&byte))
}

impl Header for McpSessionId {
    fn name() -> &'static HeaderName {
        &MCP_SESSION_ID
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        if values.next().is_some() {
            return Err(headers::Error::invalid());
        }

        value
            .to_str()
            .ok()
            .and_then(McpSessionId::new)
            .ok_or_else(headers::Error::invalid)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Session header as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHeader {
    Absent,
    Present(McpSessionId),
    Malformed,
}

impl SessionHeader {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers.typed_try_get::<McpSessionId>() {
            Ok(Some(id)) => Self::Present(id),
            Ok(None) => Self::Absent,
            Err(_) => Self::Malformed,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Present(id) => Some(id.as_str()),
            Self::Absent | Self::Malformed => None,
        }
    }
}
