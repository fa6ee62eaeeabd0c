//! Runs the agent loop offline: a scripted model asks the local `echo` tool
//! to repeat a phrase, then answers with the tool's output.

use futures::StreamExt;
use serde_json::{json, Map};
use tiny_agent::{basic_toolkit, Agent, AgentEvent, ContentBlock, ModelCompletion, StubModel};

#[tokio::main]
async fn main() -> tiny_agent::Result<()> {
    let mut arguments = Map::new();
    arguments.insert("text".into(), json!("hello from the cookbook"));

    let model = StubModel::new(vec![
        ModelCompletion::new(vec![
            ContentBlock::text("I'll ask the echo tool."),
            ContentBlock::tool_use("toolu_1", "echo", arguments),
        ]),
        ModelCompletion::text("The tool said: hello from the cookbook"),
    ]);
    let mut agent = Agent::new(model).with_tools(basic_toolkit()?);

    {
        let events = agent.process_query("Please echo a greeting.");
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event? {
                AgentEvent::Text(text) => println!("assistant: {text}"),
                other => println!("  {other}"),
            }
        }
    }

    println!("history has {} messages", agent.memory().len());
    Ok(())
}
