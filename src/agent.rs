use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::llm::LanguageModel;
use crate::memory::ConversationMemory;
use crate::message::{ContentBlock, Message};
use crate::tool::ToolRegistry;

/// What the orchestrator shows the user while a query runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A text block from the model.
    Text(String),
    /// The model asked for a tool; emitted before the tool runs.
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    /// The tool failed. The failure is also reported back to the model.
    ToolFailed { name: String, error: String },
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::Text(text) => f.write_str(text),
            AgentEvent::ToolCall {
                name, arguments, ..
            } => {
                let mut args = String::new();
                write_object(&mut args, arguments);
                write!(f, "Calling tool {name} with args {args}")
            }
            AgentEvent::ToolFailed { name, error } => write!(f, "Tool {name} failed: {error}"),
        }
    }
}

// Arguments print in the dict notation users of the tool servers expect,
// e.g. `{'timezone': 'Asia/Tokyo'}`.
fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => write_str(out, text),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    out.push('{');
    for (index, (key, value)) in map.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        write_str(out, key);
        out.push_str(": ");
        write_value(out, value);
    }
    out.push('}');
}

fn write_str(out: &mut String, text: &str) {
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('\'');
}

/// An agent that alternates between the language model and registered tools
/// until the model answers without asking for one.
pub struct Agent<M: LanguageModel> {
    model: Arc<M>,
    tools: ToolRegistry,
    memory: ConversationMemory,
    max_turns: Option<usize>,
}

impl<M: LanguageModel> Agent<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            model,
            tools: ToolRegistry::new(),
            memory: ConversationMemory::default(),
            max_turns: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: ConversationMemory) -> Self {
        self.memory = memory;
        self
    }

    /// Bound the number of model turns per query. Unbounded by default.
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns.max(1));
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Run one query. Nothing happens until the stream is polled; each poll
    /// advances the loop just far enough to produce the next event.
    ///
    /// The stream ends after the first turn without a tool call, or right
    /// after yielding an error.
    pub fn process_query(
        &mut self,
        query: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent>> + '_ {
        let run = QueryRun {
            agent: self,
            query: Some(query.into()),
            events: VecDeque::new(),
            blocks: VecDeque::new(),
            assistant: Vec::new(),
            results: Vec::new(),
            queued_call: None,
            turn_open: false,
            called_tools: false,
            turns: 0,
            finished: false,
        };
        stream::unfold(run, |mut run| async move {
            let event = run.advance().await?;
            Some((event, run))
        })
    }

    /// Drain [`Agent::process_query`] and return the text of the final turn.
    pub async fn respond(&mut self, query: impl Into<String>) -> Result<String> {
        {
            let events = self.process_query(query);
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                event?;
            }
        }
        Ok(self.memory.last().map(Message::text).unwrap_or_default())
    }
}

struct PendingCall {
    id: String,
    name: String,
    arguments: Map<String, Value>,
}

struct QueryRun<'a, M: LanguageModel> {
    agent: &'a mut Agent<M>,
    query: Option<String>,
    events: VecDeque<Result<AgentEvent>>,
    blocks: VecDeque<ContentBlock>,
    assistant: Vec<ContentBlock>,
    results: Vec<ContentBlock>,
    queued_call: Option<PendingCall>,
    turn_open: bool,
    called_tools: bool,
    turns: usize,
    finished: bool,
}

impl<M: LanguageModel> QueryRun<'_, M> {
    async fn advance(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if let Some(call) = self.queued_call.take() {
                self.run_tool(call).await;
                continue;
            }
            if let Some(block) = self.blocks.pop_front() {
                self.walk(block);
                continue;
            }
            if self.turn_open {
                self.close_turn();
                continue;
            }
            if self.finished {
                return None;
            }
            self.open_turn().await;
        }
    }

    async fn open_turn(&mut self) {
        if let Some(query) = self.query.take() {
            self.agent.memory.push(Message::user(query));
        }

        if let Some(limit) = self.agent.max_turns {
            if self.turns >= limit {
                warn!(limit, "turn limit reached before a final answer");
                self.fail(AgentError::Protocol(format!(
                    "no final answer after {limit} turns"
                )));
                return;
            }
        }
        self.turns += 1;

        let descriptors = self.agent.tools.descriptors();
        match self
            .agent
            .model
            .complete_chat(self.agent.memory.messages(), &descriptors)
            .await
        {
            Ok(completion) => {
                debug!(turn = self.turns, blocks = completion.content.len(), "model turn");
                self.called_tools = completion.has_tool_use();
                self.assistant = completion.content.clone();
                self.blocks = completion.content.into();
                self.turn_open = true;
            }
            Err(err) => self.fail(err),
        }
    }

    fn walk(&mut self, block: ContentBlock) {
        match block {
            ContentBlock::Text { text } => self.events.push_back(Ok(AgentEvent::Text(text))),
            ContentBlock::ToolUse { id, name, input } => {
                self.events.push_back(Ok(AgentEvent::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }));
                self.queued_call = Some(PendingCall {
                    id,
                    name,
                    arguments: input,
                });
            }
            ContentBlock::ToolResult { tool_use_id, .. } => {
                debug!(%tool_use_id, "ignoring tool result block in model output");
            }
        }
    }

    async fn run_tool(&mut self, call: PendingCall) {
        info!(tool = %call.name, "calling tool");
        match self.agent.tools.execute(&call.name, call.arguments).await {
            Ok(output) => self.results.push(ContentBlock::tool_result(call.id, output)),
            Err(err) => {
                let error = err.to_string();
                warn!(tool = %call.name, %error, "tool call failed");
                self.results
                    .push(ContentBlock::tool_error(call.id, format!("Error: {error}")));
                self.events.push_back(Ok(AgentEvent::ToolFailed {
                    name: call.name,
                    error,
                }));
            }
        }
    }

    fn close_turn(&mut self) {
        self.turn_open = false;
        let assistant = std::mem::take(&mut self.assistant);
        self.agent.memory.push(Message::assistant(assistant));

        if self.called_tools {
            let results = std::mem::take(&mut self.results);
            self.agent.memory.push(Message::tool_results(results));
        } else {
            debug!(turns = self.turns, "final answer");
            self.finished = true;
        }
    }

    fn fail(&mut self, err: AgentError) {
        self.events.push_back(Err(err));
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::{ModelCompletion, StubModel};
    use crate::message::Role;
    use crate::tool::ToolDescriptor;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn echo_registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools
            .register_local(
                ToolDescriptor::new("echo", "Echo text", json!({"type": "object"})),
                |input| async move { Ok(input.get("text").cloned().unwrap_or(Value::Null)) },
            )
            .unwrap();
        tools
    }

    async fn collect(agent: &mut Agent<StubModel>, query: &str) -> Vec<Result<AgentEvent>> {
        agent.process_query(query).collect().await
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let model = StubModel::new(vec![
            ModelCompletion::new(vec![ContentBlock::tool_use(
                "t1",
                "echo",
                args(json!({"text": "hi"})),
            )]),
            ModelCompletion::text("hi"),
        ]);
        let mut agent = Agent::new(model.clone()).with_tools(echo_registry());

        let events: Vec<AgentEvent> = collect(&mut agent, "Echo hi")
            .await
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to_string(), "Calling tool echo with args {'text': 'hi'}");
        assert_eq!(events[1], AgentEvent::Text("hi".into()));

        let history = agent.memory().messages();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::User);
        assert_eq!(history[2].content, vec![ContentBlock::tool_result("t1", "hi")]);

        // The second request saw the tool result.
        assert_eq!(model.requests()[1].len(), 3);
    }

    #[tokio::test]
    async fn plain_answer_takes_one_turn() {
        let model = StubModel::new(vec![ModelCompletion::text("Hello!")]);
        let mut agent = Agent::new(model.clone());

        assert_eq!(agent.respond("hi").await.unwrap(), "Hello!");
        assert_eq!(agent.memory().len(), 2);
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn continues_a_prior_conversation() {
        let mut earlier = ConversationMemory::default();
        earlier.push(Message::user("My name is Ada."));
        earlier.push(Message::assistant(vec![ContentBlock::text("Hi Ada.")]));

        let model = StubModel::new(vec![ModelCompletion::text("Your name is Ada.")]);
        let mut agent = Agent::new(model.clone()).with_memory(earlier);

        assert_eq!(agent.respond("What is my name?").await.unwrap(), "Your name is Ada.");
        assert_eq!(model.requests()[0].len(), 3);
        assert_eq!(agent.memory().len(), 4);
    }

    #[tokio::test]
    async fn every_tool_use_gets_a_matching_result() {
        let model = StubModel::new(vec![
            ModelCompletion::new(vec![
                ContentBlock::text("Checking both."),
                ContentBlock::tool_use("a", "echo", args(json!({"text": "one"}))),
                ContentBlock::tool_use("b", "missing", Map::new()),
                ContentBlock::tool_use("c", "echo", args(json!({"text": "three"}))),
            ]),
            ModelCompletion::text("done"),
        ]);
        let mut agent = Agent::new(model).with_tools(echo_registry());

        let events = collect(&mut agent, "go").await;
        assert!(events.iter().all(Result::is_ok));

        let history = agent.memory().messages();
        let used: Vec<&str> = history[1].tool_use_ids().collect();
        let answered: Vec<&str> = history[2].tool_result_ids().collect();
        assert_eq!(used, vec!["a", "b", "c"]);
        assert_eq!(used, answered);
    }

    #[tokio::test]
    async fn text_alongside_tool_use_is_not_terminal() {
        let model = StubModel::new(vec![
            ModelCompletion::new(vec![
                ContentBlock::text("Let me look that up."),
                ContentBlock::tool_use("t1", "echo", args(json!({"text": "x"}))),
            ]),
            ModelCompletion::text("It is x."),
        ]);
        let mut agent = Agent::new(model.clone()).with_tools(echo_registry());

        assert_eq!(agent.respond("?").await.unwrap(), "It is x.");
        assert_eq!(model.requests().len(), 2);
    }

    #[tokio::test]
    async fn tool_failures_are_reported_to_the_model() {
        let mut tools = ToolRegistry::new();
        tools
            .register_local(ToolDescriptor::new("boom", "", json!({})), |_| async {
                Err(AgentError::Protocol("disk on fire".into()))
            })
            .unwrap();
        let model = StubModel::new(vec![
            ModelCompletion::new(vec![ContentBlock::tool_use("t1", "boom", Map::new())]),
            ModelCompletion::text("Sorry, that failed."),
        ]);
        let mut agent = Agent::new(model).with_tools(tools);

        let events: Vec<AgentEvent> = collect(&mut agent, "try")
            .await
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert!(matches!(&events[1], AgentEvent::ToolFailed { name, .. } if name == "boom"));

        match &agent.memory().messages()[2].content[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                assert!(*is_error);
                assert!(content.starts_with("Error: "));
                assert!(content.contains("disk on fire"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_errors_end_the_stream() {
        let model = StubModel::new(Vec::new());
        let mut agent = Agent::new(model);

        let events = collect(&mut agent, "hello").await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(AgentError::CompletionService(_))));
        assert_eq!(agent.memory().len(), 1);
    }

    #[tokio::test]
    async fn turn_limit_stops_a_looping_model() {
        let looping = || {
            ModelCompletion::new(vec![ContentBlock::tool_use(
                "t",
                "echo",
                args(json!({"text": "again"})),
            )])
        };
        let model = StubModel::new(vec![looping(), looping(), looping()]);
        let mut agent = Agent::new(model.clone())
            .with_tools(echo_registry())
            .with_max_turns(2);

        let err = agent.respond("loop").await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
        assert_eq!(model.requests().len(), 2);
    }

    #[test]
    fn renders_arguments_like_a_dict_in_model_order() {
        let event = AgentEvent::ToolCall {
            id: "t".into(),
            name: "search".into(),
            arguments: args(json!({"q": "it's", "limit": 3, "exact": false, "tags": ["a", null]})),
        };
        assert_eq!(
            event.to_string(),
            "Calling tool search with args {'q': 'it\\'s', 'limit': 3, 'exact': False, 'tags': ['a', None]}"
        );
    }
}
