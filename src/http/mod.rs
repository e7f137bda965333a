//! HTTP surface of the bridge
//!
//! Routes the shared `/mcp` endpoint and the side channel to the transports,
//! plus the health and capability documents.

pub mod handlers;
