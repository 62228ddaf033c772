//! Session identity, registry and request routing

pub mod header;
pub mod registry;
pub mod router;
