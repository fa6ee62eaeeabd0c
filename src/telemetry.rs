use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AgentError, Result};

/// Environment variable holding an `EnvFilter` directive string.
pub const LOG_ENV: &str = "TINY_AGENT_LOG";

/// `TINY_AGENT_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Output goes to stderr so it never mixes
/// with the prompt, or with protocol frames when running as a tool server.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let json = config.json;
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .with(env_filter(config))
        .try_init()
        .map_err(|err| AgentError::Config(format!("failed to install tracing subscriber: {err}")))
}
