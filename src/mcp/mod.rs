//! Model Context Protocol (MCP) handling and JSON-RPC helpers
//!
//! Provides protocol-level validation, negotiation, formatting and routing of
//! MCP methods onto the capability payloads in `domain`.

pub mod rpc;
pub mod server;
