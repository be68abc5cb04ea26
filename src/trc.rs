//! Tracing initialization.

use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::app_config::{LogConfig, LogTarget};

/// Env var overriding the configured level filter.
const LOG_ENV: &str = "PAGES_LOG";

type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the global subscriber per the `[log]` section. The FUSE debug
/// flag widens the default filter to `debug` so per-request traces are
/// visible without touching the environment.
pub fn init(log: &LogConfig, fuse_debug: bool) -> Result<(), InitError> {
    let default_directive = if fuse_debug {
        "debug".to_owned()
    } else {
        log.level.clone()
    };
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(&default_directive));

    let writer = match &log.target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(log.should_use_color())
        .with_writer(writer)
        .try_init()?;
    Ok(())
}
