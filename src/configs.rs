use anyhow::{Context, Result};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default environment variable carrying the current root key passphrase.
pub const PASSPHRASE_ENV_VAR: &str = "ARMADA_ROOT_CA_PASSPHRASE";
/// Default environment variable carrying the previous root key passphrase
/// during a rolling rotation.
pub const PASSPHRASE_ENV_VAR_PREV: &str = "ARMADA_ROOT_CA_PASSPHRASE_PREV";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub passphrase_vars: PassphraseVarNames,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/armada")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// Address this dispatcher reports to agents as a manager peer.
    #[serde(default = "default_dispatcher_addr")]
    pub addr: String,
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    #[serde(default = "default_heartbeat_epsilon_ms")]
    pub heartbeat_epsilon_ms: u64,
    #[serde(default = "default_grace_multiplier")]
    pub grace_period_multiplier: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            addr: default_dispatcher_addr(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            heartbeat_epsilon_ms: default_heartbeat_epsilon_ms(),
            grace_period_multiplier: default_grace_multiplier(),
        }
    }
}

impl DispatcherConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn heartbeat_epsilon(&self) -> Duration {
        Duration::from_millis(self.heartbeat_epsilon_ms)
    }
}

fn default_dispatcher_addr() -> String {
    "127.0.0.1:4242".to_string()
}

fn default_heartbeat_period_ms() -> u64 {
    5_000
}

fn default_heartbeat_epsilon_ms() -> u64 {
    500
}

fn default_grace_multiplier() -> u32 {
    3
}

/// Names of the environment variables holding the root key passphrases.
#[derive(Debug, Deserialize, Clone)]
pub struct PassphraseVarNames {
    #[serde(default = "default_passphrase_var")]
    pub current: String,
    #[serde(default = "default_passphrase_var_prev")]
    pub previous: String,
}

impl Default for PassphraseVarNames {
    fn default() -> Self {
        Self {
            current: default_passphrase_var(),
            previous: default_passphrase_var_prev(),
        }
    }
}

fn default_passphrase_var() -> String {
    PASSPHRASE_ENV_VAR.to_string()
}

fn default_passphrase_var_prev() -> String {
    PASSPHRASE_ENV_VAR_PREV.to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}

/// Both passphrase slots, captured eagerly so that rotation does not race
/// configuration reloads. Empty variables count as absent.
#[derive(Clone)]
pub struct PassphraseSlots {
    current: Option<Secret<String>>,
    previous: Option<Secret<String>>,
}

impl PassphraseSlots {
    pub fn from_env(names: &PassphraseVarNames) -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(Secret::new)
        };
        Self {
            current: read(&names.current),
            previous: read(&names.previous),
        }
    }

    pub fn none() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    pub fn new(current: Option<String>, previous: Option<String>) -> Self {
        Self {
            current: current.filter(|v| !v.is_empty()).map(Secret::new),
            previous: previous.filter(|v| !v.is_empty()).map(Secret::new),
        }
    }

    pub fn current(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|s| s.expose_secret().as_bytes())
    }

    pub fn previous(&self) -> Option<&[u8]> {
        self.previous.as_ref().map(|s| s.expose_secret().as_bytes())
    }
}

impl std::fmt::Debug for PassphraseSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseSlots")
            .field("current", &self.current.is_some())
            .field("previous", &self.previous.is_some())
            .finish()
    }
}

/// One certificate/key pair location on disk.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Standard on-disk layout rooted at the configured base directory:
/// `ca/cert.pem`, `ca/key.pem`, `node/cert.pem`, `node/key.pem`.
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub root_ca: CertPaths,
    pub node: CertPaths,
}

impl CertificatePaths {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        let base = base_dir.as_ref();
        Self {
            root_ca: CertPaths {
                cert: base.join("ca").join("cert.pem"),
                key: base.join("ca").join("key.pem"),
            },
            node: CertPaths {
                cert: base.join("node").join("cert.pem"),
                key: base.join("node").join("key.pem"),
            },
        }
    }
}
