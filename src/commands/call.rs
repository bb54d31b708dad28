//! `toolmesh call` command

use colored::Colorize;
use serde_json::Value;

use crate::aggregator::models::ToolCallResult;
use crate::commands::open_gateway;
use crate::config::Config;
use crate::error::{AggregatorError, Result};

/// Parse `--args`; anything but a JSON object is rejected.
pub fn parse_arguments(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AggregatorError::Validation(format!("--args is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(AggregatorError::Validation("--args must be a JSON object".to_string()).into());
    }
    Ok(Some(value))
}

/// Call `tool` through a freshly started gateway and print the result.
///
/// A backend-reported tool error is printed and turned into an error so the
/// process exits non-zero.
pub async fn call_tool(
    config: &Config,
    tool: &str,
    args: Option<&str>,
    server: Option<&str>,
    json: bool,
) -> Result<()> {
    let arguments = parse_arguments(args)?;
    let aggregator = open_gateway(config).await?;

    let outcome = match server {
        Some(name) => match aggregator.get_server_by_name(name).await? {
            Some(found) => aggregator.execute_on(tool, arguments, &found.id).await,
            None => Err(AggregatorError::ServerNotFound(name.to_string()).into()),
        },
        None => aggregator.execute(tool, arguments).await,
    };
    aggregator.shutdown().await;
    let result = outcome?;

    if json {
        let out = serde_json::to_string_pretty(&result).map_err(AggregatorError::Serialization)?;
        println!("{}", out);
    } else {
        print_result(&result);
    }

    if result.is_error {
        anyhow::bail!(
            "tool '{}' reported an error: {}",
            result.tool_name,
            result.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_result(result: &ToolCallResult) {
    let label = if result.is_error {
        "error".red()
    } else {
        "ok".green()
    };
    println!(
        "{} {} via {} ({} ms)",
        label, result.tool_name, result.server_name, result.metadata.latency_ms
    );
    let text = result.text();
    if !text.is_empty() {
        println!("{}", text);
    }
    if let Some(structured) = &result.structured_content {
        println!("{}", structured);
    }
}
