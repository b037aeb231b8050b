use std::fmt::Display;

use serde::Serialize;
use tabled::Tabled;

use lobby_core::metrics::{ProcessMetricsSample, SessionHealthSummary};
use lobby_core::process::GameProcess;
use lobby_core::vpn::{PeerConfig, VpnSession};

fn or_dash<T: Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn yes_no(value: &bool) -> String {
    if *value { "yes" } else { "no" }.to_string()
}

fn mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

/// Display row for a supervised game process.
#[derive(Debug, Serialize, Tabled)]
pub struct GameRow {
    #[tabled(rename = "SESSION")]
    pub session_id: String,
    #[tabled(rename = "USER")]
    pub user_id: String,
    #[tabled(rename = "GAME")]
    pub game_id: String,
    #[tabled(rename = "PID")]
    pub pid: u32,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "EXIT", display_with = "or_dash")]
    pub exit_code: Option<i32>,
    #[tabled(rename = "STARTED")]
    pub started: String,
}

impl From<&GameProcess> for GameRow {
    fn from(p: &GameProcess) -> Self {
        Self {
            session_id: p.session_id.clone(),
            user_id: p.user_id.clone(),
            game_id: p.game_id.clone(),
            pid: p.process_id,
            status: p.status().to_string(),
            exit_code: p.exit_code(),
            started: p.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Display row for one resource sample.
#[derive(Debug, Serialize, Tabled)]
pub struct MetricsRow {
    #[tabled(rename = "PID")]
    pub pid: u32,
    #[tabled(rename = "CPU")]
    pub cpu: String,
    #[tabled(rename = "MEM")]
    pub memory: String,
    #[tabled(rename = "HEALTH")]
    pub health: u8,
    #[tabled(rename = "BUCKET")]
    pub bucket: String,
}

impl From<&ProcessMetricsSample> for MetricsRow {
    fn from(s: &ProcessMetricsSample) -> Self {
        Self {
            pid: s.process_id,
            cpu: format!("{:.1}%", s.cpu_usage_percent),
            memory: mib(s.memory_usage_bytes),
            health: s.health_score,
            bucket: s.bucket().to_string(),
        }
    }
}

/// Display row for a session's health rollup.
#[derive(Debug, Serialize, Tabled)]
pub struct SummaryRow {
    #[tabled(rename = "SESSION")]
    pub session_id: String,
    #[tabled(rename = "TOTAL")]
    pub total: usize,
    #[tabled(rename = "RUNNING")]
    pub running: usize,
    #[tabled(rename = "EXITED")]
    pub exited: usize,
    #[tabled(rename = "CRASHED")]
    pub crashed: usize,
    #[tabled(rename = "TERMINATED")]
    pub terminated: usize,
    #[tabled(rename = "AVG", display_with = "or_dash")]
    pub average_health: Option<String>,
    #[tabled(rename = "MIN", display_with = "or_dash")]
    pub min_health: Option<u8>,
}

impl From<&SessionHealthSummary> for SummaryRow {
    fn from(s: &SessionHealthSummary) -> Self {
        Self {
            session_id: s.session_id.clone(),
            total: s.total,
            running: s.launching + s.running,
            exited: s.exited,
            crashed: s.crashed,
            terminated: s.terminated,
            average_health: s.average_health.map(|a| format!("{:.0}", a)),
            min_health: s.min_health,
        }
    }
}

/// Display row for an overlay network.
#[derive(Debug, Serialize, Tabled)]
pub struct NetworkRow {
    #[tabled(rename = "NETWORK")]
    pub network_id: String,
    #[tabled(rename = "CIDR")]
    pub cidr: String,
    #[tabled(rename = "SERVER")]
    pub server: String,
    #[tabled(rename = "PORT")]
    pub port: u16,
    #[tabled(rename = "IFACE")]
    pub interface: String,
    #[tabled(rename = "ACTIVE", display_with = "yes_no")]
    pub active: bool,
    #[tabled(rename = "PEERS")]
    pub peers: usize,
}

impl From<&VpnSession> for NetworkRow {
    fn from(s: &VpnSession) -> Self {
        Self {
            network_id: s.network_id.clone(),
            cidr: s.network_cidr.to_string(),
            server: s.server_address.to_string(),
            port: s.server_port,
            interface: s.interface.clone(),
            active: s.is_active,
            peers: s.peers.len(),
        }
    }
}

/// Display row for one participant. Public material only.
#[derive(Debug, Serialize, Tabled)]
pub struct PeerRow {
    #[tabled(rename = "USER")]
    pub user_id: String,
    #[tabled(rename = "ADDRESS")]
    pub ip_address: String,
    #[tabled(rename = "PUBLIC KEY")]
    pub public_key: String,
}

impl From<&PeerConfig> for PeerRow {
    fn from(p: &PeerConfig) -> Self {
        Self {
            user_id: p.user_id.clone(),
            ip_address: p.ip_address.to_string(),
            public_key: p.public_key.clone(),
        }
    }
}
