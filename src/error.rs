use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to tool server: {0}")]
    Write(String),

    #[error("tool server closed its output stream")]
    Eof,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session is not initialized")]
    NotReady,

    #[error("request `{method}` timed out after {elapsed:?}")]
    Timeout { method: String, elapsed: Duration },

    #[error("session is closed")]
    SessionClosed,

    #[error("tool `{name}` invocation failed: {message}")]
    ToolInvocation { name: String, message: String },

    #[error("tool `{0}` not found")]
    UnknownTool(String),

    #[error("tool `{0}` is already registered")]
    DuplicateName(String),

    #[error("completion service error: {0}")]
    CompletionService(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    pub(crate) fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::ToolInvocation {
            name: name.into(),
            message: message.into(),
        }
    }
}
