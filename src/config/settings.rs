//! Server settings
//!
//! Loads listener and protocol settings from a TOML file. Every key is
//! optional; missing keys fall back to the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::{EchoReply, HandlerSettings, Mode, ServerConfig, DEFAULT_MAX_MESSAGE_SIZE};

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Errors that can occur while loading settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Protocol variant served on every connection
    pub mode: Mode,
    /// Echo variant reply style
    pub reply: EchoReply,
    /// Seconds between heartbeats
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait for "HSK_DONE"
    pub handshake_timeout_secs: u64,
    /// Seconds to wait for each "PONG"
    pub pong_timeout_secs: u64,
    /// Seconds an echo connection may stay silent
    pub idle_timeout_secs: u64,
    /// Seconds to wait for the HTTP upgrade request
    pub upgrade_timeout_secs: u64,
    /// Seconds open connections get to close after shutdown
    pub shutdown_grace_secs: u64,
    /// Largest accepted message in bytes
    pub max_message_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            mode: Mode::Echo,
            reply: EchoReply::Echo,
            heartbeat_interval_secs: 5,
            handshake_timeout_secs: 10,
            pong_timeout_secs: 10,
            idle_timeout_secs: 300,
            upgrade_timeout_secs: 10,
            shutdown_grace_secs: 5,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Settings {
    /// Load and validate settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind address is empty".to_string()));
        }

        let durations = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("pong_timeout_secs", self.pong_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("upgrade_timeout_secs", self.upgrade_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Listener configuration derived from these settings
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.bind.clone(), self.port)
            .with_max_message_size(self.max_message_size)
            .with_upgrade_timeout(Duration::from_secs(self.upgrade_timeout_secs))
            .with_shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
    }

    /// Handler settings derived from these settings
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            mode: self.mode,
            reply: self.reply,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}
