//! Orchestrator and session behaviour against an in-memory tool server that
//! answers only what the test scripts.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tiny_agent::{
    Agent, AgentError, AgentEvent, ChannelPeer, ChannelTransport, ContentBlock, McpSession,
    ModelCompletion, SessionOptions, StubModel, ToolRegistry,
};

/// Serves `fast` immediately and leaves every `slow` call unanswered.
async fn serve(mut peer: ChannelPeer) {
    while let Some(frame) = peer.next_frame().await {
        let Some(id) = frame.get("id").cloned() else {
            continue;
        };
        let result = match frame["method"].as_str() {
            Some("initialize") => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted"}
            }),
            Some("tools/list") => json!({
                "tools": [
                    {"name": "fast", "inputSchema": {"type": "object"}},
                    {"name": "slow", "description": "Never answers", "inputSchema": {"type": "object"}}
                ]
            }),
            Some("tools/call") if frame["params"]["name"] == "fast" => json!({
                "content": [{"type": "text", "text": "fast done"}]
            }),
            _ => continue,
        };
        peer.push(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }
}

async fn scripted_session(timeout: Duration) -> Arc<McpSession> {
    let (transport, peer) = ChannelTransport::pair();
    tokio::spawn(serve(peer));
    let session = McpSession::start(
        Arc::new(transport),
        SessionOptions::default().with_request_timeout(timeout),
    );
    session.initialize().await.unwrap();
    Arc::new(session)
}

fn no_args() -> Map<String, Value> {
    Map::new()
}

#[tokio::test]
async fn timed_out_tool_is_reported_to_the_model() {
    let session = scripted_session(Duration::from_millis(100)).await;
    let mut tools = ToolRegistry::new();
    tools.register_remote(Arc::clone(&session)).await.unwrap();
    assert_eq!(tools.descriptors()[0].description, "Remote tool: fast");

    let model = StubModel::new(vec![
        ModelCompletion::new(vec![
            ContentBlock::tool_use("a", "slow", no_args()),
            ContentBlock::tool_use("b", "fast", no_args()),
        ]),
        ModelCompletion::text("One tool was too slow."),
    ]);
    let mut agent = Agent::new(model.clone()).with_tools(tools);

    let events: Vec<AgentEvent> = agent
        .process_query("run both")
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert!(matches!(&events[1], AgentEvent::ToolFailed { name, error }
        if name == "slow" && error.contains("timed out")));
    assert_eq!(events.last(), Some(&AgentEvent::Text("One tool was too slow.".into())));

    let results = &agent.memory().messages()[2].content;
    assert_eq!(results.len(), 2);
    assert!(matches!(&results[0], ContentBlock::ToolResult { tool_use_id, is_error: true, .. }
        if tool_use_id == "a"));
    assert_eq!(results[1], ContentBlock::tool_result("b", "fast done"));

    // The timed-out request no longer occupies the pending map.
    assert_eq!(session.pending_requests().await, 0);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_are_isolated() {
    let session = scripted_session(Duration::from_millis(200)).await;

    let (slow, fast) = tokio::join!(
        session.call_tool("slow", no_args()),
        session.call_tool("fast", no_args()),
    );

    assert!(matches!(slow, Err(AgentError::Timeout { ref method, .. }) if method == "tools/call"));
    assert_eq!(fast.unwrap().render(), "fast done");
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_interrupts_waiting_calls() {
    let session = scripted_session(Duration::from_secs(30)).await;

    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call_tool("slow", no_args()).await })
    };
    while session.pending_requests().await == 0 {
        tokio::task::yield_now().await;
    }
    session.shutdown().await.unwrap();

    assert!(matches!(waiter.await.unwrap(), Err(AgentError::SessionClosed)));
}
