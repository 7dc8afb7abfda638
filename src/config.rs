use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_ENV: &str = "ZFSSEND_CONFIG";

/// Top-level configuration. Every field defaults to the fixed production value,
/// so an absent or empty config file behaves exactly like no config at all.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct SendConfig {
    pub child: ChildConfig,
    pub relay: RelayConfig,
}

/// How the producer process is started.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChildConfig {
    pub command: String,
    /// Prepended to the pass-through arguments.
    pub leading_args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub inactivity_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl SendConfig {
    /// Load from the file named by `ZFSSEND_CONFIG`, or fall back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: SendConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.child.command.trim().is_empty() {
            return Err(ConfigError::Invalid("child.command must not be empty".into()));
        }
        if self.relay.chunk_size == 0 {
            return Err(ConfigError::Invalid("relay.chunk_size must be > 0".into()));
        }
        if self.relay.inactivity_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.inactivity_timeout_ms must be > 0".into(),
            ));
        }
        if self.relay.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.probe_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl RelayConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// --- Default implementations ---

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: "zfs".to_string(),
            leading_args: vec!["send".to_string()],
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 20,
            inactivity_timeout_ms: 5 * 60 * 1000,
            probe_timeout_ms: 1000,
        }
    }
}
