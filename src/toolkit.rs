use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{json, Map, Value};

use crate::error::{AgentError, Result};
use crate::tool::{Tool, ToolRegistry};

pub const DEFAULT_TIMEZONE: &str = "Asia/Tokyo";

/// Local tools available without any tool server.
pub fn basic_toolkit() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(CurrentTimeTool)?;
    registry.register(EchoTool)?;
    Ok(registry)
}

/// Current time in `timezone` (an IANA name) as ISO 8601 with offset.
pub fn current_time(timezone: &str) -> Result<String> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| AgentError::tool("current_time", format!("unknown timezone `{timezone}`")))?;
    Ok(Utc::now()
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Micros, false))
}

pub fn current_time_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "timezone": {"type": "string", "default": DEFAULT_TIMEZONE}
        }
    })
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current time in ISO 8601 format"
    }

    fn input_schema(&self) -> Value {
        current_time_schema()
    }

    async fn call(&self, input: Map<String, Value>) -> Result<Value> {
        let timezone = input
            .get("timezone")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TIMEZONE);
        Ok(Value::String(current_time(timezone)?))
    }
}

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the provided `text` field."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn call(&self, input: Map<String, Value>) -> Result<Value> {
        input
            .get("text")
            .cloned()
            .ok_or_else(|| AgentError::tool(self.name(), "missing `text`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn tokyo_time_has_fixed_offset() {
        let now = current_time("Asia/Tokyo").unwrap();
        assert!(now.ends_with("+09:00"), "{now}");
        assert!(DateTime::parse_from_rfc3339(&now).is_ok());
    }

    #[test]
    fn utc_is_rendered_as_an_offset() {
        assert!(current_time("UTC").unwrap().ends_with("+00:00"));
    }

    #[test]
    fn unknown_timezone_is_a_tool_error() {
        assert!(matches!(
            current_time("Mars/Olympus_Mons"),
            Err(AgentError::ToolInvocation { name, .. }) if name == "current_time"
        ));
    }

    #[tokio::test]
    async fn toolkit_defaults_to_tokyo() {
        let registry = basic_toolkit().unwrap();
        assert_eq!(registry.names(), vec!["current_time", "echo"]);

        let output = registry.execute("current_time", Map::new()).await.unwrap();
        assert!(output.ends_with("+09:00"));
    }

    #[tokio::test]
    async fn echo_requires_text() {
        let registry = basic_toolkit().unwrap();
        let mut args = Map::new();
        args.insert("text".into(), json!("ping"));

        assert_eq!(registry.execute("echo", args).await.unwrap(), "ping");
        assert!(registry.execute("echo", Map::new()).await.is_err());
    }
}
