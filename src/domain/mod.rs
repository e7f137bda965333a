//! Tool handlers exposed over the MCP protocol
//!
//! Thin request/response glue onto upstream REST endpoints; list-style tools
//! hand a page-fetch closure to the paginated aggregator.

pub mod tools;
pub mod utils;
