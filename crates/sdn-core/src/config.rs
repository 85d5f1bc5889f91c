//! Configuration system for sdncore.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SDNCORE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sdncore/config.toml
//!   3. ~/.config/sdncore/config.toml

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::{Identity, ParseIdentityError};
use crate::policy::AuthorizationPolicy;
use crate::wire::DEFAULT_CONTROLLER_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub network: NetworkConfig,
    pub policy: PolicyConfig,
    pub session: SessionConfig,
    pub switching: SwitchingConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the OpenFlow listener binds to.
    pub listen_addr: IpAddr,
    /// TCP port for switch connections. 0 = OS-assigned.
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Datapath identities allowed to join, e.g. "aa:bb:cc:dd:ee:01".
    pub datapaths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a new connection has to announce its identity.
    pub handshake_timeout_secs: u64,
    /// Silence on an active session before an echo probe is sent.
    pub echo_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchingConfig {
    pub table_id: u8,
    pub priority: u16,
    /// Idle timeout of the installed rule. 0 = permanent.
    pub idle_timeout_secs: u16,
    /// Hard timeout of the installed rule. 0 = permanent.
    pub hard_timeout_secs: u16,
    pub cookie: u64,
    /// Delete existing flows before installing the switching rule.
    pub flush_existing: bool,
    /// How long to wait for the barrier reply acknowledging the push.
    pub ack_timeout_secs: u64,
    /// Retry a failed push once before giving up.
    pub retry: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit log. Unset = tracing output only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_CONTROLLER_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            echo_interval_secs: 15,
        }
    }
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            table_id: 0,
            priority: 0,
            idle_timeout_secs: 0,
            hard_timeout_secs: 0,
            cookie: 0,
            flush_existing: true,
            ack_timeout_secs: 5,
            retry: true,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn echo_interval(&self) -> Duration {
        Duration::from_secs(self.echo_interval_secs)
    }
}

impl PolicyConfig {
    /// Parse every configured identity. One bad entry fails the whole policy.
    pub fn identities(&self) -> Result<Vec<Identity>, ConfigError> {
        self.datapaths
            .iter()
            .map(|s| s.parse().map_err(ConfigError::InvalidIdentity))
            .collect()
    }

    pub fn build(&self) -> Result<AuthorizationPolicy, ConfigError> {
        Ok(AuthorizationPolicy::new(self.identities()?))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("sdncore")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error(transparent)]
    InvalidIdentity(ParseIdentityError),
    #[error("invalid {key}: {reason}")]
    InvalidValue { key: &'static str, reason: &'static str },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ControllerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file, or return defaults if it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every connection fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "session.handshake_timeout_secs",
                reason: "must be at least 1",
            });
        }
        if self.switching.ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "switching.ack_timeout_secs",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SDNCORE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ControllerConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SDNCORE_* overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SDNCORE_NETWORK__LISTEN_ADDR") {
            match v.parse() {
                Ok(addr) => self.network.listen_addr = addr,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid SDNCORE_NETWORK__LISTEN_ADDR"),
            }
        }
        if let Some(v) = lookup("SDNCORE_NETWORK__PORT") {
            match v.parse() {
                Ok(p) => self.network.port = p,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid SDNCORE_NETWORK__PORT"),
            }
        }
        if let Some(v) = lookup("SDNCORE_POLICY__DATAPATHS") {
            self.policy.datapaths = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("SDNCORE_SESSION__HANDSHAKE_TIMEOUT_SECS") {
            match v.parse() {
                Ok(secs) => self.session.handshake_timeout_secs = secs,
                Err(_) => tracing::warn!(
                    value = %v,
                    "ignoring invalid SDNCORE_SESSION__HANDSHAKE_TIMEOUT_SECS"
                ),
            }
        }
    }
}
