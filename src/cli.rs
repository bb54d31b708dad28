//! Command-line interface definition for toolmesh
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the gateway and to inspect and call the
//! aggregated tools of the configured servers.

use clap::{Parser, Subcommand};

/// toolmesh - MCP tool gateway
///
/// Aggregates the tools of many MCP servers behind one namespaced catalog.
#[derive(Parser, Debug, Clone)]
#[command(name = "toolmesh")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Use a SQLite store at this path instead of the configured storage
    #[arg(long, env = "TOOLMESH_STORAGE_PATH")]
    pub storage_path: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for toolmesh
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the gateway until interrupted
    Serve {
        /// Disable the health monitor
        #[arg(long)]
        no_health: bool,
    },

    /// Validate the configuration and print a summary
    Check,

    /// Inspect configured servers
    Servers {
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Inspect the aggregated tool catalog
    Tools {
        #[command(subcommand)]
        command: ToolCommand,
    },

    /// Call a tool through the gateway
    Call {
        /// Namespaced (`server.tool`) or unique tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,

        /// Route to this server name
        #[arg(short, long)]
        server: Option<String>,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Server subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ServerCommand {
    /// Connect every configured server and show its status
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Tool subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ToolCommand {
    /// List discovered tools
    List {
        /// Only tools of this server name
        #[arg(short, long)]
        server: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            storage_path: None,
            command: Commands::Check,
        }
    }
}
