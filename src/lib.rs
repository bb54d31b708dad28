//! toolmesh - MCP tool gateway library
//!
//! This library aggregates many MCP (Model Context Protocol) tool servers
//! behind one namespaced tool catalog and one invocation surface.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `aggregator`: server registry, sessions, discovery, routing, health
//! - `mcp`: JSON-RPC wire types, client, protocol wrapper and transports
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: the operator binary
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use toolmesh::aggregator::models::{ServerRegistration, TransportKind};
//! use toolmesh::Aggregator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gateway = Aggregator::builder().build();
//!     gateway.start();
//!     gateway
//!         .register_server(ServerRegistration::new(
//!             "gh",
//!             TransportKind::Http,
//!             json!({ "url": "http://localhost:8080/mcp" }),
//!         ))
//!         .await?;
//!     let result = gateway.execute("gh.list_repos", None).await?;
//!     println!("{}", result.text());
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod mcp;

// Re-export commonly used types
pub use aggregator::{Aggregator, AggregatorBuilder, AggregatorSettings};
pub use config::Config;
pub use error::{AggregatorError, Result};

#[cfg(test)]
pub mod test_utils;
