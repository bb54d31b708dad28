//! `toolmesh tools` commands

use prettytable::{row, Table};

use crate::aggregator::models::AggregatedTool;
use crate::commands::open_gateway;
use crate::config::Config;
use crate::error::{AggregatorError, Result};

/// Print the aggregated catalog, optionally for one server name.
pub async fn list_tools(config: &Config, server: Option<&str>, json: bool) -> Result<()> {
    let aggregator = open_gateway(config).await?;
    let tools = match server {
        Some(name) => match aggregator.get_server_by_name(name).await? {
            Some(found) => aggregator.list_server_tools(&found.id).await,
            None => Err(AggregatorError::ServerNotFound(name.to_string()).into()),
        },
        None => aggregator.list_tools().await,
    };
    aggregator.shutdown().await;
    let tools = tools?;

    if json {
        let out = serde_json::to_string_pretty(&tools).map_err(AggregatorError::Serialization)?;
        println!("{}", out);
    } else if tools.is_empty() {
        println!("No tools discovered");
    } else {
        output_tools_table(&tools);
    }
    Ok(())
}

fn output_tools_table(tools: &[AggregatedTool]) {
    let mut table = Table::new();
    table.add_row(row!["Tool", "Server", "Classified", "Description"]);
    for tool in tools {
        table.add_row(row![
            tool.namespaced_name,
            tool.server_name,
            if tool.is_classified { "yes" } else { "no" },
            truncate(tool.description.as_deref().unwrap_or(""), 60)
        ]);
    }
    println!();
    table.printstd();
    println!();
}

fn truncate(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_chars {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
