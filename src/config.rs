use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub groups: GroupsConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory for server state (the stateful token file lives here)
    pub data_dir: String,
    /// Directory containing per-group description files
    pub groups_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            groups_dir: "./groups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    /// How long an empty group survives before it is torn down, so a
    /// reconnecting client does not force a description re-read.
    pub empty_grace_seconds: u64,
    /// Chat history entries retained when the group does not set its own size
    pub default_chat_history: usize,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            empty_grace_seconds: 60,
            default_chat_history: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expired tokens are kept for this many days so recent revocations
    /// remain visible to administrators.
    pub token_grace_days: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_grace_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn: Option<TurnConfig>,
    /// Upper bound on ICE candidate gathering during negotiation
    pub ice_gather_timeout_seconds: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
            ice_gather_timeout_seconds: 10,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub protocol: String,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GALENE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Path of the stateful token file
    #[must_use]
    pub fn token_file(&self) -> PathBuf {
        Path::new(&self.server.data_dir).join("tokens.jsonl")
    }

    /// Directory containing group description files
    #[must_use]
    pub fn groups_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.groups_dir)
    }
}
