//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global subscriber (standard or JSON output)
//! - Keep a handle so the level can change on config reload
//! - Parse level and format strings from configuration
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - The level lives in a `reload::Layer` so reload never rebuilds the subscriber
//! - `RUST_LOG`, when set, further restricts output per target

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log level {0:?}")]
    InvalidLevel(String),

    #[error("unknown log format {0:?}, expected \"standard\" or \"json\"")]
    InvalidFormat(String),

    #[error("failed to install log subscriber: {0}")]
    Install(String),

    #[error("failed to update log level: {0}")]
    Reload(String),
}

/// Output encoding of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Standard,
    Json,
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "" | "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" | "err" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        other => LevelFilter::from_str(other).map_err(|_| LoggingError::InvalidLevel(level.to_string())),
    }
}

pub fn parse_format(format: &str) -> Result<LogFormat, LoggingError> {
    match format.trim().to_ascii_lowercase().as_str() {
        "" | "standard" => Ok(LogFormat::Standard),
        "json" => Ok(LogFormat::Json),
        _ => Err(LoggingError::InvalidFormat(format.to_string())),
    }
}

/// Handle to the active log level.
#[derive(Clone)]
pub struct LogHandle {
    reload: Option<reload::Handle<LevelFilter, Registry>>,
    current: Arc<Mutex<LevelFilter>>,
}

impl LogHandle {
    /// A handle that tracks the level without a global subscriber behind it.
    pub fn detached(level: LevelFilter) -> Self {
        Self {
            reload: None,
            current: Arc::new(Mutex::new(level)),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.current
            .lock()
            .map(|guard| *guard)
            .unwrap_or(LevelFilter::INFO)
    }

    /// Change the level. Nothing changes if the string is not a level.
    pub fn set_level(&self, level: &str) -> Result<(), LoggingError> {
        let filter = parse_level(level)?;
        if let Some(handle) = &self.reload {
            handle
                .reload(filter)
                .map_err(|e| LoggingError::Reload(e.to_string()))?;
        }
        if let Ok(mut current) = self.current.lock() {
            *current = filter;
        }
        Ok(())
    }
}

/// Install the global subscriber.
pub fn init(level: &str, format: &str) -> Result<LogHandle, LoggingError> {
    let filter = parse_level(level)?;
    let format = parse_format(format)?;

    let (level_layer, handle) = reload::Layer::new(filter);
    let env_filter = EnvFilter::try_from_default_env().ok();
    let registry = tracing_subscriber::registry().with(level_layer).with(env_filter);

    let installed = match format {
        LogFormat::Standard => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(LogHandle {
        reload: Some(handle),
        current: Arc::new(Mutex::new(filter)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_aliases() {
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("warning").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("err").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("").unwrap(), LevelFilter::INFO);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("json").unwrap(), LogFormat::Json);
        assert_eq!(parse_format("standard").unwrap(), LogFormat::Standard);
        assert!(parse_format("xml").is_err());
    }

    #[test]
    fn test_detached_handle_keeps_level_on_bad_input() {
        let handle = LogHandle::detached(LevelFilter::WARN);
        assert!(handle.set_level("verbose").is_err());
        assert_eq!(handle.level(), LevelFilter::WARN);

        handle.set_level("debug").unwrap();
        assert_eq!(handle.level(), LevelFilter::DEBUG);
    }
}
