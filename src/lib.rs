//! Building blocks for a small tool-calling agent.
//!
//! The crate provides:
//! - A language model abstraction (`LanguageModel`) with an Anthropic client.
//! - A tool registry over in-process tools and tools hosted by stdio
//!   subprocesses speaking JSON-RPC (`ToolRegistry`, `McpSession`).
//! - An `Agent` that loops between the model and tools, streaming what it does.

mod agent;
mod error;
mod llm;
mod memory;
mod message;
mod tool;

pub mod config;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod toolkit;
pub mod transport;

pub use agent::{Agent, AgentEvent};
pub use config::{AppConfig, LoggingConfig, ModelConfig, ServerConfig, SessionConfig};
pub use error::{AgentError, Result};
pub use llm::{AnthropicClient, LanguageModel, ModelCompletion, StubModel};
pub use memory::ConversationMemory;
pub use message::{ContentBlock, Message, Role};
pub use session::{McpSession, SessionOptions, SessionState};
pub use tool::{FnTool, Tool, ToolDescriptor, ToolRegistry, NO_RESULT};
pub use toolkit::basic_toolkit;
pub use transport::{ChannelPeer, ChannelTransport, StdioTransport, Transport};
