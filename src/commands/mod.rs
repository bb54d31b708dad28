//! Command handlers for the toolmesh binary
//!
//! Every handler builds an [`Aggregator`] from the loaded configuration,
//! brings up the configured servers, does its work and shuts the gateway
//! down again. `serve` keeps it running until interrupted.

pub mod call;
pub mod servers;
pub mod tools;

use colored::Colorize;

use crate::aggregator::models::{ExternalServer, ServerRegistration, ServerStatus};
use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::Result;

/// Build an aggregator from `config` without connecting anything.
pub fn build_aggregator(config: &Config) -> Result<Aggregator> {
    let store = config.storage.open()?;
    Ok(Aggregator::builder()
        .settings(config.settings())
        .store(store)
        .build())
}

/// Reconnect persisted servers, then register configured servers the store
/// does not know yet.
pub async fn bring_up(aggregator: &Aggregator, config: &Config) -> Result<Vec<ExternalServer>> {
    aggregator.restore().await?;
    for registration in &config.servers {
        if let Some(stored) = aggregator.get_server_by_name(&registration.name).await? {
            if differs_from_stored(&stored, registration) {
                tracing::warn!(
                    server = %registration.name,
                    "Configured server differs from the stored registration; keeping the stored one. Remove it to apply the new config"
                );
            } else {
                tracing::debug!(server = %registration.name, "Server already registered");
            }
            continue;
        }
        aggregator.register_server(registration.clone()).await?;
    }
    aggregator.list_servers(None).await
}

/// Whether the YAML entry no longer matches what the store holds.
fn differs_from_stored(stored: &ExternalServer, configured: &ServerRegistration) -> bool {
    stored.transport_kind != configured.transport_kind
        || stored.connection_config != configured.connection_config
        || stored.health_check_url != configured.health_check_url
        || stored.auto_connect != configured.auto_connect
}

/// Build, bring up, and return a ready gateway.
pub async fn open_gateway(config: &Config) -> Result<Aggregator> {
    let aggregator = build_aggregator(config)?;
    bring_up(&aggregator, config).await?;
    Ok(aggregator)
}

/// Run the gateway until Ctrl-C.
pub async fn run_serve(mut config: Config, no_health: bool) -> Result<()> {
    if no_health {
        config.health.enabled = false;
    }
    let aggregator = build_aggregator(&config)?;
    aggregator.start();
    let servers = bring_up(&aggregator, &config).await?;

    let state = aggregator.state().await?;
    println!(
        "{} {} servers ({} connected), {} tools",
        "toolmesh".bold(),
        state.total_servers,
        state.connected_servers,
        state.total_tools
    );
    for server in &servers {
        println!("  {:<24} {}", server.name, colored_status(server.status));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");
    aggregator.shutdown().await;
    Ok(())
}

/// Print a summary of a configuration that passed validation.
pub fn run_check(config: &Config) -> Result<()> {
    println!("{}", "Configuration is valid".green());
    println!("Storage:          {:?}", config.storage.backend);
    println!("Health interval:  {}s", config.health.interval_seconds);
    println!("Failure threshold: {}", config.health.failure_threshold);
    println!("Servers:          {}", config.servers.len());
    for server in &config.servers {
        println!(
            "  {:<24} {:<6} auto_connect={}",
            server.name, server.transport_kind, server.auto_connect
        );
    }
    Ok(())
}

/// Status label coloured for terminals.
pub fn colored_status(status: ServerStatus) -> String {
    match status {
        ServerStatus::Connected => status.as_str().green().to_string(),
        ServerStatus::Connecting => status.as_str().yellow().to_string(),
        ServerStatus::Disconnected => status.as_str().dimmed().to_string(),
        ServerStatus::Error => status.as_str().red().to_string(),
    }
}
