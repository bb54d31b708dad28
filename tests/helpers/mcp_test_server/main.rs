//! Stdio MCP backend used by the integration tests
//!
//! Reads newline-delimited JSON-RPC from stdin and answers on stdout.
//!
//! # Arguments
//!
//! - `--tools a,b,c` -- tool names to advertise (default `echo`)
//! - `--name NAME` -- `serverInfo.name` (default `mcp-test-server`)
//! - `--fail TOOL` -- this tool answers with `isError: true`
//!
//! Every advertised tool echoes `arguments.message` back as text, prefixed
//! with the server name, so tests can tell which backend answered.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

struct Options {
    name: String,
    tools: Vec<String>,
    failing: Option<String>,
}

fn parse_options() -> Options {
    let mut options = Options {
        name: "mcp-test-server".to_string(),
        tools: vec!["echo".to_string()],
        failing: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tools" => {
                if let Some(list) = args.next() {
                    options.tools = list
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                }
            }
            "--name" => {
                if let Some(name) = args.next() {
                    options.name = name;
                }
            }
            "--fail" => options.failing = args.next(),
            other => eprintln!("mcp_test_server: ignoring argument {other}"),
        }
    }
    options
}

fn main() {
    let options = parse_options();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(request) => match handle(&options, &request) {
                Some(response) => response,
                None => continue,
            },
            Err(_) => error_reply(&Value::Null, -32700, "Parse error"),
        };

        if writeln!(out, "{response}").is_err() || out.flush().is_err() {
            break;
        }
    }
}

/// Answer one message; notifications get no reply.
fn handle(options: &Options, request: &Value) -> Option<Value> {
    let method = request["method"].as_str().unwrap_or("");
    let id = request.get("id")?.clone();

    let reply = match method {
        "initialize" => ok_reply(
            &id,
            json!({
                "protocolVersion": "2025-11-25",
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": options.name, "version": "0.1.0" }
            }),
        ),
        "ping" => ok_reply(&id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("{name} from {}", options.name),
                        "inputSchema": {
                            "type": "object",
                            "properties": { "message": { "type": "string" } }
                        }
                    })
                })
                .collect();
            ok_reply(&id, json!({ "tools": tools }))
        }
        "tools/call" => call(options, &id, &request["params"]),
        other => error_reply(&id, -32601, &format!("Method not found: {other}")),
    };
    Some(reply)
}

fn call(options: &Options, id: &Value, params: &Value) -> Value {
    let tool = params["name"].as_str().unwrap_or("");
    if !options.tools.iter().any(|t| t == tool) {
        return error_reply(id, -32602, &format!("Unknown tool: {tool}"));
    }
    let message = params["arguments"]["message"].as_str().unwrap_or("");
    let is_error = options.failing.as_deref() == Some(tool);
    let text = if is_error {
        format!("{tool} failed")
    } else {
        format!("{}: {message}", options.name)
    };
    ok_reply(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error
        }),
    )
}

fn ok_reply(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_reply(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
