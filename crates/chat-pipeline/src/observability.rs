//! Tracing setup for pipeline services.
//!
//! The engine itself only emits `tracing` events and spans; this module is
//! the optional convenience for binaries that want a subscriber wired up
//! with sensible defaults. Library users with their own subscriber should
//! skip it.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Where log output goes.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// Standard output.
    #[default]
    Console,
    /// Append-free file logging (the file is created/truncated).
    File(String),
}

/// Configuration for [`init`].
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Maximum level captured for this crate's targets. The `RUST_LOG`
    /// environment variable still applies on top.
    pub level: Level,
    pub target: LogTarget,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            target: LogTarget::default(),
        }
    }
}

impl ObservabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }
}

/// Installs the global tracing subscriber.
///
/// Call once at startup. Returns an error if a subscriber is already set or
/// the log file cannot be created.
pub fn init(config: ObservabilityConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("chat_pipeline={}", config.level).parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    match config.target {
        LogTarget::Console => {
            registry.with(fmt::layer().with_writer(std::io::stdout)).try_init()?;
        }
        LogTarget::File(path) => {
            let file = std::fs::File::create(path)?;
            registry.with(fmt::layer().with_ansi(false).with_writer(file)).try_init()?;
        }
    }
    Ok(())
}
