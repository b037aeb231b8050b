use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::addressing::{DEFAULT_POOL, Ipv4Block, MAX_PREFIX};
use crate::health::HealthPolicy;
use crate::naming::{check_interface_name, interface_name};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "LOBBY_CONFIG";
/// Environment variable overriding `vpn.config_dir`.
pub const WG_CONFIG_DIR_ENV: &str = "LOBBY_WG_CONFIG_DIR";

const MAX_TERMINATE_GRACE_SECS: u64 = 60;
const MIN_BLOCK_PREFIX: u8 = 16;

/// Top-level lobby configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LobbyConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub vpn: VpnConfig,
}

/// Process supervisor timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Reconcile sweep interval (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Resource sampling interval (seconds).
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
    /// Wait between SIGTERM and SIGKILL (seconds).
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
    /// Samples kept per process for trend detection.
    #[serde(default = "default_health_window")]
    pub health_window: usize,
}

/// Overlay network allocation and tunnel control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Private range carved into per-session blocks.
    #[serde(default = "default_address_pool")]
    pub address_pool: Ipv4Block,
    /// Prefix length of each per-session block.
    #[serde(default = "default_block_prefix")]
    pub block_prefix: u8,
    /// Listen port of slot 0; slot N listens on `base_port + N`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// DNS server written into client configs. Empty disables the line.
    #[serde(default = "default_dns")]
    pub dns: String,
    /// Where server-side interface files are written.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: String,
    /// Upper bound on a single tunnel up/down call (seconds).
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,
    /// How long an inactive network is kept before cleanup (seconds).
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// PersistentKeepalive for clients; 0 disables it.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_metrics_interval() -> u64 {
    10
}
fn default_terminate_grace() -> u64 {
    5
}
fn default_health_window() -> usize {
    6
}
fn default_address_pool() -> Ipv4Block {
    DEFAULT_POOL
}
fn default_block_prefix() -> u8 {
    24
}
fn default_base_port() -> u16 {
    51820
}
fn default_dns() -> String {
    "1.1.1.1".to_string()
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("/var/lib/lobby/wireguard")
}
fn default_interface_prefix() -> String {
    "lobby".to_string()
}
fn default_activation_timeout() -> u64 {
    15
}
fn default_retention() -> u64 {
    3600
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_keepalive() -> u16 {
    25
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            metrics_interval_secs: default_metrics_interval(),
            terminate_grace_secs: default_terminate_grace(),
            health_window: default_health_window(),
        }
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            address_pool: default_address_pool(),
            block_prefix: default_block_prefix(),
            base_port: default_base_port(),
            dns: default_dns(),
            config_dir: default_config_dir(),
            interface_prefix: default_interface_prefix(),
            activation_timeout_secs: default_activation_timeout(),
            retention_secs: default_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl VpnConfig {
    /// Number of sessions the pool can hold at once.
    pub fn slot_count(&self) -> u32 {
        self.address_pool.slot_count(self.block_prefix)
    }

    pub fn dns(&self) -> Option<&str> {
        let dns = self.dns.trim();
        if dns.is_empty() { None } else { Some(dns) }
    }
}

impl LobbyConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lobby config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse lobby config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective config: explicit path, else `LOBBY_CONFIG`,
    /// else defaults. `LOBBY_WG_CONFIG_DIR` is applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(WG_CONFIG_DIR_ENV)
            && !dir.is_empty()
        {
            config.vpn.config_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sup = &self.supervisor;
        if sup.poll_interval_secs == 0 || sup.metrics_interval_secs == 0 {
            bail!("supervisor poll and metrics intervals must be greater than zero");
        }
        if sup.terminate_grace_secs > MAX_TERMINATE_GRACE_SECS {
            bail!(
                "supervisor.terminate_grace_secs ({}) must not exceed {}",
                sup.terminate_grace_secs,
                MAX_TERMINATE_GRACE_SECS
            );
        }
        if sup.health_window < 2 {
            bail!("supervisor.health_window must be at least 2");
        }

        self.health.validate()?;

        let vpn = &self.vpn;
        if !(MIN_BLOCK_PREFIX..=MAX_PREFIX).contains(&vpn.block_prefix) {
            bail!(
                "vpn.block_prefix ({}) must be between {} and {}",
                vpn.block_prefix,
                MIN_BLOCK_PREFIX,
                MAX_PREFIX
            );
        }
        if vpn.block_prefix < vpn.address_pool.prefix() {
            bail!(
                "vpn.block_prefix /{} is larger than the address pool {}",
                vpn.block_prefix,
                vpn.address_pool
            );
        }
        if vpn.cleanup_interval_secs == 0 || vpn.activation_timeout_secs == 0 {
            bail!("vpn cleanup and activation intervals must be greater than zero");
        }
        let last_slot = vpn.slot_count().saturating_sub(1);
        if u32::from(vpn.base_port) + last_slot > u32::from(u16::MAX) {
            bail!(
                "vpn.base_port {} leaves no room for {} slots",
                vpn.base_port,
                vpn.slot_count()
            );
        }
        if vpn.interface_prefix.is_empty() {
            bail!("vpn.interface_prefix must not be empty");
        }
        check_interface_name(&interface_name(&vpn.interface_prefix, last_slot))
            .context("vpn.interface_prefix leaves no room for slot numbers")?;
        Ok(())
    }

    /// Render the effective config back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize lobby config")
    }
}
