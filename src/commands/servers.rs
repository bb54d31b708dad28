//! `toolmesh servers` commands

use prettytable::{row, Table};

use crate::aggregator::models::ServerDiagnostics;
use crate::commands::{colored_status, open_gateway};
use crate::config::Config;
use crate::error::{AggregatorError, Result};

/// Bring up every configured server and print its diagnostics.
pub async fn list_servers(config: &Config, json: bool) -> Result<()> {
    let aggregator = open_gateway(config).await?;
    let diagnostics = aggregator.diagnostics().await?;
    aggregator.shutdown().await;

    if json {
        let out = serde_json::to_string_pretty(&diagnostics).map_err(AggregatorError::Serialization)?;
        println!("{}", out);
    } else if diagnostics.is_empty() {
        println!("No servers configured");
    } else {
        output_servers_table(&diagnostics);
    }
    Ok(())
}

fn output_servers_table(servers: &[ServerDiagnostics]) {
    let mut table = Table::new();
    table.add_row(row!["Name", "Status", "Tools", "Failures", "Last Error"]);
    for server in servers {
        table.add_row(row![
            server.name,
            colored_status(server.status),
            server.tool_count,
            server.consecutive_failures,
            server.last_error.as_deref().unwrap_or("-")
        ]);
    }
    println!();
    table.printstd();
    println!();
}
