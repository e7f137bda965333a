//! Model Context Protocol (MCP) server handling and JSON-RPC implementations
//!
//! The envelope format is identical on both transports; only the carrier
//! differs, so everything here is transport-agnostic.

pub mod context;
pub mod rpc;
pub mod server;
