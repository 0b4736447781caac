use std::io::IsTerminal;

use serde::Deserialize;

use crate::logger::{error::LoggerError, format::LoggerFormat};

pub const ENV_LOG: &str = "TNO_LOG";
pub const ENV_LOG_FORMAT: &str = "TNO_LOG_FORMAT";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directive, e.g. `info` or `tno_sync=debug,info`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let use_color = cfg!(test) || std::io::stdout().is_terminal();
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color,
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `TNO_LOG` (filter) and `TNO_LOG_FORMAT` when set.
    pub fn from_env() -> Result<Self, LoggerError> {
        let mut cfg = Self::default();
        if let Ok(level) = std::env::var(ENV_LOG) {
            cfg.level = level;
        }
        if let Ok(format) = std::env::var(ENV_LOG_FORMAT) {
            cfg.format = format.parse()?;
        }
        Ok(cfg)
    }
}
