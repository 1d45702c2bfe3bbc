//! Daemon Configuration
//!
//! Configuration management for the Pairlink daemon.

use anyhow::{bail, Context, Result};
use pairlink_protocol::discovery::BROADCAST_ADDR;
use pairlink_protocol::{DeviceInfo, DeviceType, EngineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Pairing configuration
    #[serde(default)]
    pub pairing: PairingSettings,

    /// Storage paths
    pub paths: PathConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    pub device_type: String,

    /// Device ID (generated on first run)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery port
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// TCP connection port range start
    #[serde(default = "default_connection_port_start")]
    pub connection_port_start: u16,

    /// TCP connection port range end
    #[serde(default = "default_connection_port_end")]
    pub connection_port_end: u16,

    /// Discovery broadcast interval in seconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,

    /// How long after start identity broadcasts are sent, in seconds
    #[serde(default = "default_announcement_window")]
    pub announcement_window_secs: u64,

    /// Repeated sightings within this many seconds are reported once
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
}

/// How incoming pairing requests are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    /// Ask on the terminal
    Prompt,
    /// Accept every request
    Accept,
    /// Reject every request
    Reject,
}

/// Pairing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Seconds a pairing request may stay unanswered
    #[serde(default = "default_pairing_timeout")]
    pub timeout_secs: u64,

    /// Approval policy for incoming requests
    #[serde(default = "default_policy")]
    pub policy: ApprovalPolicy,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (trust records)
    pub data_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_discovery_port() -> u16 {
    1716
}

fn default_connection_port_start() -> u16 {
    1739
}

fn default_connection_port_end() -> u16 {
    1764
}

fn default_broadcast_interval() -> u64 {
    2
}

fn default_announcement_window() -> u64 {
    30
}

fn default_dedup_window() -> u64 {
    5
}

fn default_pairing_timeout() -> u64 {
    30
}

fn default_policy() -> ApprovalPolicy {
    ApprovalPolicy::Prompt
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            connection_port_start: default_connection_port_start(),
            connection_port_end: default_connection_port_end(),
            broadcast_interval_secs: default_broadcast_interval(),
            announcement_window_secs: default_announcement_window(),
            dedup_window_secs: default_dedup_window(),
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout(),
            policy: default_policy(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("pairlink")
}

/// Default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir();

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("pairlink");

        let cert_dir = config_dir.join("certs");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: "desktop".to_string(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            pairing: PairingSettings::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
                cert_dir,
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, creating a default file if it does
    /// not exist. A missing device id is generated and written back.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", path))?
        } else {
            Config::default()
        };

        let generated = config.device.device_id.is_none();
        if generated {
            config.device.device_id = Some(DeviceInfo::generate_device_id());
        }
        config.validate()?;

        if generated || !path.exists() {
            config.save(path)?;
        }
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {:?}", path))?;

        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.device.name.trim().is_empty() {
            bail!("device.name must not be empty");
        }
        if DeviceType::parse(&self.device.device_type).is_none() {
            bail!(
                "device.device_type '{}' is not one of desktop, laptop, phone, tablet, tv",
                self.device.device_type
            );
        }
        if self.network.connection_port_start > self.network.connection_port_end {
            bail!(
                "network.connection_port_start ({}) is greater than connection_port_end ({})",
                self.network.connection_port_start,
                self.network.connection_port_end
            );
        }
        if self.network.broadcast_interval_secs == 0 {
            bail!("network.broadcast_interval_secs must be at least 1");
        }
        if self.pairing.timeout_secs == 0 {
            bail!("pairing.timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    /// Directory holding one file per trust record
    pub fn trust_dir(&self) -> PathBuf {
        self.paths.data_dir.join("trust")
    }

    /// Identity of this device, with the connection port filled in at start
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let device_id = self
            .device
            .device_id
            .as_deref()
            .context("device.device_id is not set")?;
        let device_type = DeviceType::parse(&self.device.device_type)
            .with_context(|| format!("Unknown device type '{}'", self.device.device_type))?;

        Ok(DeviceInfo::with_id(
            device_id,
            &self.device.name,
            device_type,
            self.network.connection_port_start,
        ))
    }

    /// Engine configuration for these settings
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();

        config.discovery.port = self.network.discovery_port;
        config.discovery.broadcast_targets = vec![SocketAddr::new(
            BROADCAST_ADDR.into(),
            self.network.discovery_port,
        )];
        config.discovery.broadcast_interval =
            Duration::from_secs(self.network.broadcast_interval_secs);
        config.discovery.announcement_window =
            Duration::from_secs(self.network.announcement_window_secs);
        config.discovery.dedup_window = Duration::from_secs(self.network.dedup_window_secs);

        config.connection.port_range = (
            self.network.connection_port_start,
            self.network.connection_port_end,
        );
        config.pairing.timeout = Duration::from_secs(self.pairing.timeout_secs);

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.discovery_port, 1716);
        assert_eq!(config.network.connection_port_start, 1739);
        assert_eq!(config.pairing.policy, ApprovalPolicy::Prompt);
        assert_eq!(config.logging.level, "info");
        assert!(config.device.device_id.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.network.discovery_port, config.network.discovery_port);
        assert_eq!(parsed.pairing.policy, config.pairing.policy);
    }

    #[test]
    fn test_load_creates_file_with_stable_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pairlink").join(CONFIG_FILE_NAME);

        let first = Config::load(&path).unwrap();
        assert!(path.exists());
        let id = first.device.device_id.clone().unwrap();
        assert_eq!(id.len(), 36);

        let second = Config::load(&path).unwrap();
        assert_eq!(second.device.device_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
[device]
name = "workstation"
device_type = "laptop"
device_id = "1000"

[pairing]
policy = "accept"

[paths]
config_dir = "/tmp/pairlink"
data_dir = "/tmp/pairlink/data"
cert_dir = "/tmp/pairlink/certs"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.device.device_id.as_deref(), Some("1000"));
        assert_eq!(config.pairing.policy, ApprovalPolicy::Accept);
        assert_eq!(config.pairing.timeout_secs, 30);
        assert_eq!(config.network.dedup_window_secs, 5);

        let info = config.device_info().unwrap();
        assert_eq!(info.device_type, DeviceType::Laptop);
        assert_eq!(info.device_name, "workstation");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.device.device_type = "toaster".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.connection_port_start = 1800;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pairing.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_mapping() {
        let mut config = Config::default();
        config.network.connection_port_start = 1750;
        config.pairing.timeout_secs = 12;

        let engine = config.engine_config();
        assert_eq!(engine.connection.port_range, (1750, 1764));
        assert_eq!(engine.pairing.timeout, Duration::from_secs(12));
        assert_eq!(engine.discovery.port, 1716);
        assert_eq!(engine.discovery.broadcast_targets.len(), 1);
    }
}
