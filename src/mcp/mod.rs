//! MCP (Model Context Protocol) client plumbing
//!
//! The gateway is an MCP *client* towards every backend server. This module
//! holds everything needed to talk to one backend, independent of how many
//! backends the aggregator manages.
//!
//! The implementation targets protocol revision **2025-11-25** and accepts
//! **2025-03-26** and **2024-11-05** servers.
//!
//! # Module Layout
//!
//! - `types`     -- MCP protocol types and JSON-RPC primitives
//! - `client`    -- Transport-agnostic async JSON-RPC 2.0 client
//! - `protocol`  -- Typed MCP lifecycle wrapper over `JsonRpcClient`
//! - `transport` -- `Transport` trait plus stdio, SSE and Streamable HTTP
//!   implementations

pub mod client;
pub mod protocol;
pub mod transport;
pub mod types;

pub use types::*;
