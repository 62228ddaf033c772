//! Capability payloads served by the protocol handler
//!
//! Resources, tools and prompts are stateless functions over request
//! arguments; the protocol handler wires them into JSON-RPC methods.

pub mod prompts;
pub mod resources;
pub mod tools;
