//! toolmesh - MCP tool gateway
//!
#![doc = "toolmesh - MCP tool gateway"]
#![doc = "Main entry point for the toolmesh binary."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use toolmesh::cli::{Cli, Commands, ServerCommand, ToolCommand};
use toolmesh::commands;
use toolmesh::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Serve { no_health } => {
            tracing::info!("Starting gateway");
            commands::run_serve(config, no_health).await?;
            Ok(())
        }
        Commands::Check => {
            commands::run_check(&config)?;
            Ok(())
        }
        Commands::Servers { command } => match command {
            ServerCommand::List { json } => {
                commands::servers::list_servers(&config, json).await?;
                Ok(())
            }
        },
        Commands::Tools { command } => match command {
            ToolCommand::List { server, json } => {
                commands::tools::list_tools(&config, server.as_deref(), json).await?;
                Ok(())
            }
        },
        Commands::Call {
            tool,
            args,
            server,
            json,
        } => {
            tracing::debug!("Calling tool: {}", tool);
            commands::call::call_tool(&config, &tool, args.as_deref(), server.as_deref(), json)
                .await?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// `RUST_LOG` wins; otherwise `--verbose` selects debug output. Logs go to
/// stderr so command output on stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "toolmesh=debug" } else { "toolmesh=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
