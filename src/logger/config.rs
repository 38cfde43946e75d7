/// Logger configuration, derived from command-line flags at startup
use super::levels::LogLevel;
use super::tags::LogTag;
use crate::arguments::{get_arg_value, get_cmd_args, has_arg};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Messages above this level are suppressed
    pub min_level: LogLevel,

    /// Tags with debug output enabled (`--debug-<key>`)
    pub debug_tags: HashSet<String>,

    /// Tags with verbose output enabled (`--verbose-<key>`)
    pub verbose_tags: HashSet<String>,

    /// If non-empty, only these tags are shown (errors always pass)
    pub enabled_tags: HashSet<String>,

    /// Mirror console output into the log file
    pub file_logging: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            debug_tags: HashSet::new(),
            verbose_tags: HashSet::new(),
            enabled_tags: HashSet::new(),
            file_logging: true,
        }
    }
}

static LOGGER_CONFIG: Lazy<RwLock<LoggerConfig>> =
    Lazy::new(|| RwLock::new(LoggerConfig::default()));

pub fn get_logger_config() -> LoggerConfig {
    match LOGGER_CONFIG.read() {
        Ok(cfg) => cfg.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub fn set_logger_config(config: LoggerConfig) {
    if let Ok(mut cfg) = LOGGER_CONFIG.write() {
        *cfg = config;
    }
}

pub fn update_logger_config<F: FnOnce(&mut LoggerConfig)>(f: F) {
    if let Ok(mut cfg) = LOGGER_CONFIG.write() {
        f(&mut cfg);
    }
}

/// Build the logger configuration from the process arguments
pub fn init_from_args() {
    let args = get_cmd_args();
    let mut config = LoggerConfig::default();

    if has_arg("--verbose") || has_arg("-v") {
        config.min_level = LogLevel::Verbose;
    } else if has_arg("--quiet") || has_arg("-q") {
        config.min_level = LogLevel::Warning;
    } else if let Some(level) = get_arg_value("--log-level").and_then(|v| LogLevel::parse(&v)) {
        config.min_level = level;
    }

    for arg in &args {
        if let Some(key) = arg.strip_prefix("--debug-") {
            if LogTag::from_debug_key(key).is_some() {
                config.debug_tags.insert(key.to_string());
            }
        } else if let Some(key) = arg.strip_prefix("--verbose-") {
            if LogTag::from_debug_key(key).is_some() {
                config.verbose_tags.insert(key.to_string());
            }
        }
    }

    // Debug output for a tag implies the Debug threshold
    if !config.debug_tags.is_empty() && config.min_level < LogLevel::Debug {
        config.min_level = LogLevel::Debug;
    }

    if let Some(tags) = get_arg_value("--log-tags") {
        config.enabled_tags = tags
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
    }

    config.file_logging = !has_arg("--no-log-file");

    set_logger_config(config);
}

pub fn is_debug_enabled_for_tag(tag: &LogTag) -> bool {
    let config = get_logger_config();
    config.debug_tags.contains(&tag.to_debug_key())
}

pub fn is_verbose_enabled_for_tag(tag: &LogTag) -> bool {
    let config = get_logger_config();
    config.verbose_tags.contains(&tag.to_debug_key())
}
