//! Transports carrying MCP messages between a peer and a protocol handler
//!
//! `streamable_http` serves one session over HTTP POST/GET/DELETE and `stdio`
//! serves a single handler over newline-delimited JSON.

pub mod stdio;
pub mod streamable_http;
