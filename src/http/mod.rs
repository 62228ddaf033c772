//! HTTP layer for the Model Context Protocol
//!
//! Provides the `/mcp` endpoint (POST, GET and DELETE) and the metadata endpoints.

pub mod handlers;
