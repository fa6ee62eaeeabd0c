use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::session::McpSession;

/// Returned by [`ToolRegistry::execute`] when a tool produced nothing.
pub const NO_RESULT: &str = "(no result)";

/// Name, description and input schema of a tool, as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// An in-process tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    /// `Value::Null` means the tool had nothing to return.
    async fn call(&self, input: Map<String, Value>) -> Result<Value>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(self.name(), self.description(), self.input_schema())
    }
}

/// Adapts an async closure into a [`Tool`].
pub struct FnTool<F> {
    descriptor: ToolDescriptor,
    func: F,
}

impl<F> FnTool<F> {
    pub fn new(descriptor: ToolDescriptor, func: F) -> Self {
        Self { descriptor, func }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn input_schema(&self) -> Value {
        self.descriptor.input_schema.clone()
    }

    async fn call(&self, input: Map<String, Value>) -> Result<Value> {
        (self.func)(input).await
    }
}

#[derive(Clone)]
enum ToolEntry {
    Local {
        descriptor: ToolDescriptor,
        tool: Arc<dyn Tool>,
    },
    Remote {
        descriptor: ToolDescriptor,
        session: Arc<McpSession>,
    },
}

impl ToolEntry {
    fn descriptor(&self) -> &ToolDescriptor {
        match self {
            ToolEntry::Local { descriptor, .. } | ToolEntry::Remote { descriptor, .. } => descriptor,
        }
    }
}

/// Single name → capability map over local and remote tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`Tool`] under its own descriptor.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        let descriptor = tool.descriptor();
        self.insert(ToolEntry::Local {
            descriptor,
            tool: Arc::new(tool),
        })
    }

    /// Register an async function as a local tool.
    pub fn register_local<F, Fut>(&mut self, descriptor: ToolDescriptor, func: F) -> Result<()>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let tool = FnTool::new(descriptor.clone(), func);
        self.insert(ToolEntry::Local {
            descriptor,
            tool: Arc::new(tool),
        })
    }

    /// Add every tool an initialized session advertises. Nothing is added if
    /// any advertised name collides. Returns the number of tools added.
    pub async fn register_remote(&mut self, session: Arc<McpSession>) -> Result<usize> {
        let tools = session.list_tools().await?;

        let mut seen = std::collections::HashSet::new();
        for descriptor in &tools {
            if self.by_name.contains_key(&descriptor.name) || !seen.insert(descriptor.name.as_str()) {
                return Err(AgentError::DuplicateName(descriptor.name.clone()));
            }
        }

        let count = tools.len();
        for descriptor in tools {
            self.insert(ToolEntry::Remote {
                descriptor,
                session: Arc::clone(&session),
            })?;
        }
        debug!(server = session.server_name(), count, "registered remote tools");
        Ok(count)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor().name.clone())
            .collect()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run a tool by name and normalise its output to a display string.
    pub async fn execute(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        let entry = self
            .by_name
            .get(name)
            .and_then(|&index| self.entries.get(index))
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;

        match entry {
            ToolEntry::Local { tool, .. } => {
                let value = tool.call(arguments).await.map_err(|err| match err {
                    AgentError::ToolInvocation { .. } => err,
                    other => AgentError::tool(name, other.to_string()),
                })?;
                render_value(value)
            }
            ToolEntry::Remote { session, .. } => {
                let result = session.call_tool(name, arguments).await?;
                let rendered = result.render();
                if rendered.is_empty() {
                    Ok(NO_RESULT.to_string())
                } else {
                    Ok(rendered)
                }
            }
        }
    }

    fn insert(&mut self, entry: ToolEntry) -> Result<()> {
        let name = entry.descriptor().name.clone();
        if self.by_name.contains_key(&name) {
            return Err(AgentError::DuplicateName(name));
        }
        self.by_name.insert(name, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}

fn render_value(value: Value) -> Result<String> {
    match value {
        Value::Null => Ok(NO_RESULT.to_string()),
        Value::String(text) => Ok(text),
        other => Ok(serde_json::to_string(&other)?),
    }
}
