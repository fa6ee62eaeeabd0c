//! Stdio tool server exposing `current_time`.
//!
//! Reads one JSON-RPC frame per line on stdin and answers on stdout.
//! Logs go to stderr.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tiny_agent::protocol::{
    CallToolParams, CallToolResult, CapabilitySet, Frame, Implementation, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, McpToolDefinition, ServerCapabilities, INVALID_PARAMS,
    METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_LIST_TOOLS, METHOD_NOT_FOUND, METHOD_PING,
    PARSE_ERROR, PROTOCOL_VERSION,
};
use tiny_agent::telemetry::init_tracing;
use tiny_agent::toolkit::CurrentTimeTool;
use tiny_agent::{LoggingConfig, ToolRegistry};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "clock";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(&LoggingConfig::default())?;

    let mut tools = ToolRegistry::new();
    tools.register(CurrentTimeTool)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!(server = SERVER_NAME, "serving on stdio");

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match Frame::parse(&line) {
            Ok(Frame::Request(request)) => Some(handle(&tools, request).await),
            Ok(Frame::Notification(notification)) => {
                debug!(method = %notification.method, "notification");
                None
            }
            Ok(Frame::Response(_)) => None,
            Err(err) => {
                warn!(%err, "unparseable frame");
                Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, err.to_string()))
            }
        };

        if let Some(reply) = reply {
            let mut frame = serde_json::to_string(&reply)?;
            frame.push('\n');
            stdout.write_all(frame.as_bytes()).await.context("writing stdout")?;
            stdout.flush().await?;
        }
    }

    info!(server = SERVER_NAME, "stdin closed, exiting");
    Ok(())
}

async fn handle(tools: &ToolRegistry, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    match dispatch(tools, request).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err((code, message)) => JsonRpcResponse::failure(id, code, message),
    }
}

async fn dispatch(
    tools: &ToolRegistry,
    request: JsonRpcRequest,
) -> std::result::Result<Value, (i64, String)> {
    let encode = |value: serde_json::Result<Value>| value.map_err(|err| (INVALID_PARAMS, err.to_string()));

    match request.method.as_str() {
        METHOD_INITIALIZE => encode(serde_json::to_value(CapabilitySet {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: Some(json!({})),
                ..ServerCapabilities::default()
            },
            server_info: Implementation {
                name: SERVER_NAME.into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            },
        })),
        METHOD_PING => Ok(json!({})),
        METHOD_LIST_TOOLS => encode(serde_json::to_value(ListToolsResult {
            tools: tools
                .descriptors()
                .iter()
                .map(McpToolDefinition::from)
                .collect(),
            next_cursor: None,
        })),
        METHOD_CALL_TOOL => {
            let params: CallToolParams =
                serde_json::from_value(request.params.unwrap_or_default())
                    .map_err(|err| (INVALID_PARAMS, format!("invalid tools/call params: {err}")))?;
            let result = match tools.execute(&params.name, params.arguments).await {
                Ok(output) => CallToolResult::text(output),
                Err(err) => CallToolResult::error(err.to_string()),
            };
            encode(serde_json::to_value(result))
        }
        other => Err((METHOD_NOT_FOUND, format!("method `{other}` not found"))),
    }
}
