//! Interactive entrypoint for tiny-agent.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use futures::StreamExt;
use tiny_agent::telemetry::init_tracing;
use tiny_agent::{
    basic_toolkit, Agent, AgentEvent, AnthropicClient, AppConfig, McpSession, ServerConfig,
    SessionOptions, ToolRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Command-line arguments for tiny-agent
#[derive(Parser, Debug)]
#[command(name = "tiny-agent")]
#[command(author, version, about = "A small agent that answers queries with the help of tools")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Model identifier sent with every completion request
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    /// Upper bound on tokens per completion
    #[arg(long, value_name = "N")]
    max_tokens: Option<u32>,

    /// Tool server command line, e.g. "uv run servers/clock.py" (can be repeated)
    #[arg(long, value_name = "COMMAND")]
    server: Vec<String>,

    /// Do not launch the bundled clock server
    #[arg(long)]
    no_default_server: bool,

    /// Verbosity level (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::from_env_or_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::from_env(),
    };
    apply_cli(&mut config, &cli)?;
    init_tracing(&config.logging)?;

    if config.model.provider != "anthropic" {
        bail!("unsupported provider `{}`", config.model.provider);
    }
    let model = Arc::new(AnthropicClient::from_config(&config.model)?);
    info!(model = model.model(), "starting tiny-agent");

    let (tools, sessions) = connect_servers(&config).await?;
    let mut agent = Agent::new(model).with_tools(tools);
    info!(tools = ?agent.tools().names(), "agent ready");

    let result = run_interactive_session(&mut agent).await;

    for session in &sessions {
        if let Err(err) = session.shutdown().await {
            warn!(server = session.server_name(), %err, "tool server shutdown failed");
        }
    }
    result
}

fn apply_cli(config: &mut AppConfig, cli: &Cli) -> Result<()> {
    if let Some(model) = &cli.model {
        config.model.model = model.clone();
    }
    if let Some(max_tokens) = cli.max_tokens {
        config.model.max_tokens = max_tokens;
    }
    match cli.verbose {
        0 => {}
        1 => config.logging.level = "info".into(),
        2 => config.logging.level = "debug".into(),
        _ => config.logging.level = "trace".into(),
    }

    for (index, line) in cli.server.iter().enumerate() {
        let server = ServerConfig::from_command_line(format!("server-{}", index + 1), line)?;
        config.servers.push(server);
    }
    if config.servers.is_empty() && !cli.no_default_server {
        if let Some(clock) = bundled_clock_server() {
            config.servers.push(clock);
        }
    }
    Ok(())
}

/// The `clock-server` binary built next to this one, if present.
fn bundled_clock_server() -> Option<ServerConfig> {
    let exe = std::env::current_exe().ok()?;
    let path = exe.with_file_name(format!("clock-server{}", std::env::consts::EXE_SUFFIX));
    if !path.exists() {
        warn!(path = %path.display(), "bundled clock server not found");
        return None;
    }
    Some(ServerConfig::new("clock", path.to_string_lossy()))
}

async fn connect_servers(config: &AppConfig) -> Result<(ToolRegistry, Vec<Arc<McpSession>>)> {
    let mut tools = ToolRegistry::new();
    let mut sessions = Vec::new();

    for server in &config.servers {
        let options = SessionOptions::from_config(server, &config.session);
        let session = Arc::new(
            McpSession::spawn_stdio(server, options)
                .with_context(|| format!("starting tool server `{}`", server.name))?,
        );
        sessions.push(Arc::clone(&session));

        session
            .initialize()
            .await
            .with_context(|| format!("initializing tool server `{}`", server.name))?;
        let count = tools
            .register_remote(session)
            .await
            .with_context(|| format!("registering tools from `{}`", server.name))?;
        info!(server = %server.name, count, "tool server connected");
    }

    if sessions.is_empty() {
        info!("no tool servers configured, using the built-in toolkit");
        tools = basic_toolkit()?;
    }
    Ok((tools, sessions))
}

async fn run_interactive_session(agent: &mut Agent<AnthropicClient>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", "Query:".green().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("quit") {
            break;
        }

        println!();
        let events = agent.process_query(query);
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(AgentEvent::Text(text)) => println!("{text}"),
                Ok(event @ AgentEvent::ToolCall { .. }) => println!("{}", event.to_string().cyan()),
                Ok(event @ AgentEvent::ToolFailed { .. }) => println!("{}", event.to_string().yellow()),
                Err(err) => {
                    println!("{}", format!("Error: {err}").red());
                    break;
                }
            }
        }
        println!();
    }
    Ok(())
}
