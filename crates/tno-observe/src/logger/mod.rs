mod config;
mod error;
mod format;
mod log;

pub use config::{ENV_LOG, ENV_LOG_FORMAT, LoggerConfig};
pub use error::LoggerError;
pub use format::LoggerFormat;

/// Install the global `tracing` subscriber described by `cfg`.
///
/// Fails with [`LoggerError::AlreadyInitialized`] if a global subscriber is already set.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    match cfg.format {
        LoggerFormat::Text => log::text(cfg),
        LoggerFormat::Json => log::json(cfg),
        LoggerFormat::Journald => log::journald(cfg),
    }
}
