//! Logging Configuration

use crate::util::errors::{StewardError, StewardResult};
use std::path::PathBuf;
use std::thread;

pub const LOG_LEVEL_ENV: &str = "STEWARD_LOG_LEVEL";

fn get_thread_id() -> u64 {
    let thread_id = thread::current().id();
    let id_str = format!("{:?}", thread_id);
    id_str
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse()
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: log::LevelFilter,
    pub is_debug: bool,
    /// Also append to this file when set
    pub log_file: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(is_debug: bool) -> Self {
        Self {
            level: resolve_default_level(is_debug, std::env::var(LOG_LEVEL_ENV).ok()),
            is_debug,
            log_file: None,
        }
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

fn resolve_default_level(is_debug: bool, env_value: Option<String>) -> log::LevelFilter {
    let fallback = if is_debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    match env_value {
        Some(val) => parse_log_level(&val).unwrap_or_else(|| {
            eprintln!(
                "Warning: Invalid {} '{}', falling back to default",
                LOG_LEVEL_ENV, val
            );
            fallback
        }),
        None => fallback,
    }
}

pub fn parse_log_level(value: &str) -> Option<log::LevelFilter> {
    match value.trim().to_lowercase().as_str() {
        "trace" => Some(log::LevelFilter::Trace),
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warn" => Some(log::LevelFilter::Warn),
        "error" => Some(log::LevelFilter::Error),
        "off" => Some(log::LevelFilter::Off),
        _ => None,
    }
}

pub fn level_to_str(level: log::LevelFilter) -> &'static str {
    match level {
        log::LevelFilter::Trace => "trace",
        log::LevelFilter::Debug => "debug",
        log::LevelFilter::Info => "info",
        log::LevelFilter::Warn => "warn",
        log::LevelFilter::Error => "error",
        log::LevelFilter::Off => "off",
    }
}

fn format_log_plain(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "[{}][tid:{}][{}][{}] {}",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
        get_thread_id(),
        record.level(),
        record.target(),
        message
    ))
}

/// Installs the global logger. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> StewardResult<()> {
    let mut dispatch = fern::Dispatch::new()
        .level(config.level)
        .format(format_log_plain);

    if config.is_debug {
        dispatch = dispatch.chain(std::io::stdout());
    } else {
        dispatch = dispatch.chain(std::io::stderr());
    }

    if let Some(path) = &config.log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch
        .apply()
        .map_err(|e| StewardError::config(format!("Failed to install logger: {}", e)))?;
    log::info!(
        "Logging initialized: level={}, log_file={:?}",
        level_to_str(config.level),
        config.log_file
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_log_level(" DEBUG "), Some(log::LevelFilter::Debug));
        assert_eq!(parse_log_level("off"), Some(log::LevelFilter::Off));
        assert_eq!(parse_log_level("verbose"), None);
        assert_eq!(level_to_str(log::LevelFilter::Warn), "warn");
    }

    #[test]
    fn env_value_overrides_default() {
        assert_eq!(
            resolve_default_level(false, Some("trace".to_string())),
            log::LevelFilter::Trace
        );
        assert_eq!(
            resolve_default_level(true, Some("bogus".to_string())),
            log::LevelFilter::Debug
        );
        assert_eq!(resolve_default_level(false, None), log::LevelFilter::Info);
    }
}
