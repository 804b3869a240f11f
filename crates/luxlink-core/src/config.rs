/*!
 * Configuration management for LuxLink.
 *
 * This module provides the discovery configuration surface consumed from the
 * host, with loading from file and environment sources and startup
 * validation. Invalid configuration is surfaced immediately as
 * [`Error::Config`]; it is never retried.
 */
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Minimum allowed scan interval in seconds
pub const MIN_SCAN_INTERVAL_SECS: u64 = 60;

/// Core configuration for LuxLink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Device session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Language/locale hint, carried for the host layer; core logic ignores it
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Manually configured device addresses
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Subnets to scan, as CIDR blocks ("192.168.2.0/24") or explicit
    /// ranges ("192.168.2.10-192.168.2.40")
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Interval between discovery cycles in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Whether the startup cycle includes subnet scans (broadcast and manual
    /// addresses always participate)
    #[serde(default)]
    pub scan_subnets_on_startup: bool,

    /// UDP port for the discovery broadcast probe
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,

    /// Collection window for broadcast replies in milliseconds
    #[serde(default = "default_broadcast_window")]
    pub broadcast_window_ms: u64,

    /// Per-address TCP probe timeout for subnet scans in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Maximum concurrent TCP probes during a subnet scan
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
}

/// Device session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// TCP port devices listen on
    #[serde(default = "default_device_port")]
    pub port: u16,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-attempt response read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Number of read attempts before an exchange fails
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    /// Whether `control` awaits a correlated acknowledgment frame.
    /// When false (the default), a flushed write counts as success.
    #[serde(default)]
    pub control_await_ack: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or a full env-filter)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            addresses: Vec::new(),
            subnets: Vec::new(),
            scan_interval_secs: default_scan_interval(),
            scan_subnets_on_startup: false,
            broadcast_port: default_broadcast_port(),
            broadcast_window_ms: default_broadcast_window(),
            probe_timeout_ms: default_probe_timeout(),
            probe_concurrency: default_probe_concurrency(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: default_device_port(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            read_attempts: default_read_attempts(),
            control_await_ack: false,
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

fn default_lang() -> String {
    "en".to_string()
}

fn default_scan_interval() -> u64 {
    300
}

fn default_broadcast_port() -> u16 {
    6095
}

fn default_broadcast_window() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_probe_concurrency() -> usize {
    64
}

fn default_device_port() -> u16 {
    5555
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    5
}

fn default_read_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.discovery.scan_interval_secs < MIN_SCAN_INTERVAL_SECS {
            return Err(Error::config(format!(
                "scan_interval_secs {} is below the minimum of {}",
                self.discovery.scan_interval_secs, MIN_SCAN_INTERVAL_SECS
            )));
        }

        for address in &self.discovery.addresses {
            IpAddr::from_str(address).map_err(|e| {
                Error::config(format!("invalid device address '{}': {}", address, e))
            })?;
        }

        for subnet in &self.discovery.subnets {
            SubnetSpec::from_str(subnet)?;
        }

        if self.session.read_attempts == 0 {
            return Err(Error::config("read_attempts must be at least 1"));
        }

        if self.discovery.probe_concurrency == 0 {
            return Err(Error::config("probe_concurrency must be at least 1"));
        }

        Ok(())
    }

    /// Parse the manually configured addresses.
    ///
    /// Call after [`Config::validate`]; entries that fail to parse here are
    /// skipped.
    pub fn manual_addresses(&self) -> Vec<IpAddr> {
        self.discovery
            .addresses
            .iter()
            .filter_map(|a| IpAddr::from_str(a).ok())
            .collect()
    }

    /// Parse the configured subnet specifications.
    ///
    /// Call after [`Config::validate`]; entries that fail to parse here are
    /// skipped.
    pub fn subnet_specs(&self) -> Vec<SubnetSpec> {
        self.discovery
            .subnets
            .iter()
            .filter_map(|s| SubnetSpec::from_str(s).ok())
            .collect()
    }
}

/// A subnet to scan: a CIDR block or an explicit inclusive address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetSpec {
    /// CIDR block; scans host addresses only (network/broadcast excluded)
    Cidr(Ipv4Net),
    /// Inclusive range of addresses
    Range(Ipv4Addr, Ipv4Addr),
}

impl SubnetSpec {
    /// Enumerate the host addresses covered by this spec.
    ///
    /// A `/32` or `/31` block and a degenerate range both yield an empty or
    /// minimal set without error.
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        match self {
            // Host addresses only; /31 and /32 have none
            SubnetSpec::Cidr(net) if net.prefix_len() >= 31 => Vec::new(),
            SubnetSpec::Cidr(net) => net.hosts().collect(),
            SubnetSpec::Range(start, end) => {
                let (start, end) = (u32::from(*start), u32::from(*end));
                (start..=end).map(Ipv4Addr::from).collect()
            }
        }
    }
}

impl FromStr for SubnetSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            let start = Ipv4Addr::from_str(start.trim())
                .map_err(|e| Error::config(format!("invalid range start in '{}': {}", s, e)))?;
            let end = Ipv4Addr::from_str(end.trim())
                .map_err(|e| Error::config(format!("invalid range end in '{}': {}", s, e)))?;
            if u32::from(start) > u32::from(end) {
                return Err(Error::config(format!(
                    "range start exceeds range end in '{}'",
                    s
                )));
            }
            Ok(SubnetSpec::Range(start, end))
        } else {
            let net = Ipv4Net::from_str(s)
                .map_err(|e| Error::config(format!("invalid subnet '{}': {}", s, e)))?;
            Ok(SubnetSpec::Cidr(net))
        }
    }
}

impl std::fmt::Display for SubnetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnetSpec::Cidr(net) => write!(f, "{}", net),
            SubnetSpec::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file
                );
            }
        }

        if let Some(prefix) = self.environment_prefix {
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
