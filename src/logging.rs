use std::io::IsTerminal;

use crate::config::LoggingConfig;
use crate::error::{KernelError, Result};

fn use_ansi(style: &str) -> Result<bool> {
    match style.to_lowercase().as_str() {
        "auto" => Ok(std::io::stdout().is_terminal()),
        "always" => Ok(true),
        "never" => Ok(false),
        other => Err(KernelError::Config(format!(
            "logging.style must be auto, always or never, got '{}'",
            other
        ))),
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `logging.level`.
/// Calling it again after a subscriber is installed is a no-op.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let ansi = use_ansi(&config.style)?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .map_err(|e| KernelError::Config(format!("invalid log level '{}': {}", config.level, e)))?;

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}
