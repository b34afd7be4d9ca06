use std::{path::Path, time::Duration};

use crate::cli::Args;

pub const DEFAULT_PORT: u16 = 4003;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_subscriptions() -> usize {
    32
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_log_tail() -> String {
    "100".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_cors_origin() -> String {
    "*".to_string()
}

/// Process configuration. Passed explicitly into the router state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound on active subscriptions held by a single connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// Capacity of the per-connection outbound event queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Passed to the engine as the `tail` parameter of the logs request.
    #[serde(default = "default_log_tail")]
    pub log_tail: String,
    /// Largest inbound WebSocket message accepted, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            max_subscriptions: default_max_subscriptions(),
            outbound_buffer: default_outbound_buffer(),
            log_tail: default_log_tail(),
            max_message_size: default_max_message_size(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            cors_origin: default_cors_origin(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl RelayConfig {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    /// Reads the config file. A missing file yields the defaults.
    fn try_init_from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::try_init_from_string(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Command line flags and environment variables win over the file.
    fn apply_args(mut self, args: &Args) -> Self {
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(log_level) = &args.log_level {
            self.log_level = log_level.clone();
        }
        if let Some(max_subscriptions) = args.max_subscriptions {
            self.max_subscriptions = max_subscriptions;
        }
        if let Some(outbound_buffer) = args.outbound_buffer {
            self.outbound_buffer = outbound_buffer;
        }
        if let Some(log_tail) = &args.log_tail {
            self.log_tail = log_tail.clone();
        }
        if let Some(cors_origin) = &args.cors_origin {
            self.cors_origin = cors_origin.clone();
        }
        self
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.max_subscriptions == 0 {
            return Err(ConfigError::Invalid(
                "max_subscriptions must be greater than zero".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn try_init(args: &Args) -> Result<Self, ConfigError> {
        Self::try_init_from_file(&args.config)?
            .apply_args(args)
            .validate()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
