//! Structured logging for gatewaylink
//!
//! ```rust,ignore
//! use gatewaylink::logger::{self, LogTag};
//!
//! logger::error(LogTag::Connection, "Socket closed unexpectedly");
//! logger::info(LogTag::Manager, "Gateway gw-1 authenticated");
//! logger::debug(LogTag::Commands, "Sent ping #4"); // only with --debug-commands
//! logger::verbose(LogTag::Topics, "Raw frame: ..."); // only with --verbose
//! ```
//!
//! Call `logger::init()` once at startup; it reads `--debug-<module>`,
//! `--verbose`, `--quiet` and `--log-level` from the command line and opens
//! the log file. Without `init()` messages still reach the console using the
//! default Info threshold.

mod config;
mod core;
mod file;
mod format;
mod levels;
mod tags;

pub use config::{
    get_logger_config, init_from_args, set_logger_config, update_logger_config, LoggerConfig,
};
pub use file::log_file_path;
pub use levels::LogLevel;
pub use tags::LogTag;

/// Initialize the logger from command-line flags and open the log file
pub fn init() {
    config::init_from_args();
    file::init_file_logging();
}

/// Always shown
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Only shown when `--debug-<tag>` is present
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Only shown with `--verbose` or `--verbose-<tag>`
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}

/// Flush pending file writes (call during shutdown)
pub fn flush() {
    file::flush_file_logging();
}
