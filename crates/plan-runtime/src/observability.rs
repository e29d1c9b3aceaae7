//! # Observability
//!
//! Initializes tracing for hosts that embed the executor.
//!
//! The executor emits a `plan_run` span per run, a `level` span per execution level
//! and a `plan_step` span per dispatched step (fields `step_id` and `action`), so a
//! subscriber with span events enabled shows exactly which steps overlapped.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Configuration for initializing the observability system.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// The maximum log level to capture.
    pub level: Level,
    /// The target for the logs.
    pub target: LogTarget,
    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            target: LogTarget::default(),
            json: false,
        }
    }
}

/// Defines the output target for logs.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// Log to the console (stdout).
    #[default]
    Console,
    /// Log to a file.
    File(String),
}

/// Builds the filter: `RUST_LOG` first, then a directive for this crate at the
/// configured level.
fn build_filter(level: Level) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    Ok(EnvFilter::from_default_env().add_directive(format!("plan_runtime={}", level).parse()?))
}

/// Initializes the global tracing subscriber.
///
/// Call once at startup. Returns an error if a global subscriber is already set or
/// the log file cannot be created.
pub fn init(config: ObservabilityConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = build_filter(config.level)?;
    let subscriber = tracing_subscriber::registry().with(filter);

    match (config.target, config.json) {
        (LogTarget::Console, false) => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stdout))
                .try_init()?;
        }
        (LogTarget::Console, true) => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stdout))
                .try_init()?;
        }
        (LogTarget::File(path), json) => {
            let file = std::fs::File::create(path)?;
            if json {
                subscriber
                    .with(fmt::layer().json().with_writer(file))
                    .try_init()?;
            } else {
                subscriber
                    .with(fmt::layer().with_ansi(false).with_writer(file))
                    .try_init()?;
            }
        }
    };

    Ok(())
}
