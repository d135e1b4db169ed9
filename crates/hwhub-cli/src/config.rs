//! Configuration – reads/writes `~/.hwhub/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use hwhub_backends::{MountTableConfig, PowerSupplyConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Device backends the binary knows how to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-memory devices loaded from [`Config::fixture`].
    Fake,
    PowerSupply,
    Mtab,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Fake => write!(f, "fake"),
            BackendKind::PowerSupply => write!(f, "power_supply"),
            BackendKind::Mtab => write!(f, "mtab"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSupplySection {
    #[serde(default = "default_power_supply_root")]
    pub root: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtabSection {
    #[serde(default = "default_fstab")]
    pub fstab: PathBuf,

    #[serde(default = "default_mtab")]
    pub mtab: PathBuf,

    /// Periodic rescan on top of file watching; `0` disables it.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

/// Persisted configuration stored in `~/.hwhub/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Backends registered at start-up, in registration order.
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendKind>,

    /// TOML device fixture for the `fake` backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<PathBuf>,

    /// Upper bound on each backend's start-up.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    #[serde(default)]
    pub power_supply: PowerSupplySection,

    #[serde(default)]
    pub mtab: MtabSection,
}

fn default_backends() -> Vec<BackendKind> {
    vec![BackendKind::PowerSupply, BackendKind::Mtab]
}
fn default_start_timeout_ms() -> u64 {
    5_000
}
fn default_power_supply_root() -> PathBuf {
    PathBuf::from("/sys/class/power_supply")
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_io_timeout_ms() -> u64 {
    1_000
}
fn default_fstab() -> PathBuf {
    PathBuf::from("/etc/fstab")
}
fn default_mtab() -> PathBuf {
    PathBuf::from("/etc/mtab")
}
fn default_rescan_interval_ms() -> u64 {
    10_000
}

impl Default for PowerSupplySection {
    fn default() -> Self {
        Self {
            root: default_power_supply_root(),
            poll_interval_ms: default_poll_interval_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Default for MtabSection {
    fn default() -> Self {
        Self {
            fstab: default_fstab(),
            mtab: default_mtab(),
            rescan_interval_ms: default_rescan_interval_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            fixture: None,
            start_timeout_ms: default_start_timeout_ms(),
            power_supply: PowerSupplySection::default(),
            mtab: MtabSection::default(),
        }
    }
}

impl Config {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn power_supply_config(&self) -> PowerSupplyConfig {
        PowerSupplyConfig {
            root: self.power_supply.root.clone(),
            poll_interval: Duration::from_millis(self.power_supply.poll_interval_ms),
            io_timeout: Duration::from_millis(self.power_supply.io_timeout_ms),
        }
    }

    pub fn mount_table_config(&self) -> MountTableConfig {
        MountTableConfig {
            fstab: self.mtab.fstab.clone(),
            mtab: self.mtab.mtab.clone(),
            rescan_interval: (self.mtab.rescan_interval_ms > 0)
                .then(|| Duration::from_millis(self.mtab.rescan_interval_ms)),
            io_timeout: Duration::from_millis(self.mtab.io_timeout_ms),
        }
    }
}

/// Return the path to `~/.hwhub/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".hwhub").join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `HWHUB_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HWHUB_FIXTURE` | `fixture` (also enables the `fake` backend) |
/// | `HWHUB_POWER_SUPPLY_ROOT` | `power_supply.root` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("HWHUB_FIXTURE") {
        cfg.fixture = Some(PathBuf::from(v));
        if !cfg.backends.contains(&BackendKind::Fake) {
            cfg.backends.push(BackendKind::Fake);
        }
    }
    if let Ok(v) = std::env::var("HWHUB_POWER_SUPPLY_ROOT") {
        cfg.power_supply.root = PathBuf::from(v);
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_error)?;
    Ok(())
}
