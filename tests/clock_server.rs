use std::sync::Arc;

use chrono::DateTime;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tiny_agent::{
    Agent, AgentError, AgentEvent, ContentBlock, McpSession, ModelCompletion, ServerConfig,
    SessionConfig, SessionOptions, SessionState, StubModel, ToolRegistry,
};

fn clock_server() -> ServerConfig {
    ServerConfig::new("clock", env!("CARGO_BIN_EXE_clock-server"))
}

async fn ready_session() -> Arc<McpSession> {
    let server = clock_server();
    let session = McpSession::spawn_stdio(
        &server,
        SessionOptions::from_config(&server, &SessionConfig::default()),
    )
    .unwrap();
    session.initialize().await.unwrap();
    Arc::new(session)
}

fn tokyo() -> Map<String, Value> {
    json!({"timezone": "Asia/Tokyo"}).as_object().cloned().unwrap()
}

#[tokio::test]
async fn handshake_and_listing() {
    let session = ready_session().await;

    assert_eq!(session.state().await, SessionState::Ready);
    let capabilities = session.capabilities().await.unwrap();
    assert_eq!(capabilities.server_info.name, "clock");

    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "current_time");
    assert_eq!(tools[0].input_schema["type"], "object");

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn calls_current_time_over_stdio() {
    let session = ready_session().await;

    let result = session.call_tool("current_time", tokyo()).await.unwrap();
    assert!(!result.is_error);
    assert!(result.render().ends_with("+09:00"), "{}", result.render());

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_failures_surface_as_tool_errors() {
    let session = ready_session().await;

    let mut bad = Map::new();
    bad.insert("timezone".into(), json!("Nowhere/Special"));
    assert!(matches!(
        session.call_tool("current_time", bad).await,
        Err(AgentError::ToolInvocation { .. })
    ));
    assert!(matches!(
        session.call_tool("no_such_tool", Map::new()).await,
        Err(AgentError::ToolInvocation { .. })
    ));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_rejects_further_calls() {
    let session = ready_session().await;
    session.shutdown().await.unwrap();
    session.shutdown().await.unwrap();

    assert_eq!(session.state().await, SessionState::Closed);
    assert!(matches!(
        session.call_tool("current_time", tokyo()).await,
        Err(AgentError::SessionClosed)
    ));
}

#[tokio::test]
async fn registry_dispatches_to_the_server() {
    let session = ready_session().await;
    let mut registry = ToolRegistry::new();
    assert_eq!(registry.register_remote(Arc::clone(&session)).await.unwrap(), 1);

    let output = registry.execute("current_time", tokyo()).await.unwrap();
    assert!(output.ends_with("+09:00"));

    // Registering the same server twice would shadow its tools.
    assert!(matches!(
        registry.register_remote(Arc::clone(&session)).await,
        Err(AgentError::DuplicateName(name)) if name == "current_time"
    ));
    assert_eq!(registry.len(), 1);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn answers_what_time_it_is_in_tokyo() {
    let session = ready_session().await;
    let mut registry = ToolRegistry::new();
    registry.register_remote(Arc::clone(&session)).await.unwrap();

    let model = StubModel::new(vec![
        ModelCompletion::new(vec![ContentBlock::tool_use("toolu_1", "current_time", tokyo())]),
        ModelCompletion::text("It is evening in Tokyo."),
    ]);
    let mut agent = Agent::new(model).with_tools(registry);

    let events: Vec<AgentEvent> = agent
        .process_query("What time is it in Tokyo?")
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(events.len(), 2);
    match &events[0] {
        AgentEvent::ToolCall { name, arguments, .. } => {
            assert_eq!(name, "current_time");
            assert_eq!(arguments, &tokyo());
            assert_eq!(
                events[0].to_string(),
                "Calling tool current_time with args {'timezone': 'Asia/Tokyo'}"
            );
        }
        other => panic!("expected a tool call first, got {other:?}"),
    }
    assert_eq!(events[1], AgentEvent::Text("It is evening in Tokyo.".into()));

    let history = agent.memory().messages();
    assert_eq!(history.len(), 4);
    match &history[2].content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, "toolu_1");
            assert!(!is_error);
            let stamp = DateTime::parse_from_rfc3339(content).unwrap();
            assert_eq!(stamp.offset().local_minus_utc(), 9 * 3600);
        }
        other => panic!("unexpected block: {other:?}"),
    }

    session.shutdown().await.unwrap();
}
