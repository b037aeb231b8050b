use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifetime counters shared by the supervisor, the VPN manager and the
/// sweeps. Constructed once and handed to each component as an `Arc`.
#[derive(Debug, Default)]
pub struct Counters {
    // ── Process supervisor ──────────────────────────────────────────
    pub launches: AtomicU64,
    pub launch_failures: AtomicU64,
    pub exits: AtomicU64,
    pub crashes: AtomicU64,
    pub terminations: AtomicU64,
    pub reconcile_runs: AtomicU64,
    pub metrics_samples: AtomicU64,

    // ── VPN manager ─────────────────────────────────────────────────
    pub vpn_networks_created: AtomicU64,
    pub vpn_activations: AtomicU64,
    pub vpn_activation_failures: AtomicU64,
    pub vpn_deactivations: AtomicU64,
    pub vpn_networks_cleaned: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Collect a snapshot of all counters for serialization.
    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            launches: load(&self.launches),
            launch_failures: load(&self.launch_failures),
            exits: load(&self.exits),
            crashes: load(&self.crashes),
            terminations: load(&self.terminations),
            reconcile_runs: load(&self.reconcile_runs),
            metrics_samples: load(&self.metrics_samples),
            vpn_networks_created: load(&self.vpn_networks_created),
            vpn_activations: load(&self.vpn_activations),
            vpn_activation_failures: load(&self.vpn_activation_failures),
            vpn_deactivations: load(&self.vpn_deactivations),
            vpn_networks_cleaned: load(&self.vpn_networks_cleaned),
        }
    }

    /// Format counters in Prometheus exposition format.
    pub fn prometheus_exposition(&self) -> String {
        let s = self.snapshot();
        let rows: [(&str, u64, &str); 12] = [
            ("lobby_launches_total", s.launches, "Game processes spawned"),
            (
                "lobby_launch_failures_total",
                s.launch_failures,
                "Launch requests that failed to spawn",
            ),
            ("lobby_exits_total", s.exits, "Processes that exited cleanly"),
            (
                "lobby_crashes_total",
                s.crashes,
                "Processes that exited abnormally",
            ),
            (
                "lobby_terminations_total",
                s.terminations,
                "Processes terminated on request",
            ),
            (
                "lobby_reconcile_runs_total",
                s.reconcile_runs,
                "Process status reconciliation sweeps",
            ),
            (
                "lobby_metrics_samples_total",
                s.metrics_samples,
                "Resource samples recorded",
            ),
            (
                "lobby_vpn_networks_created_total",
                s.vpn_networks_created,
                "Overlay networks provisioned",
            ),
            (
                "lobby_vpn_activations_total",
                s.vpn_activations,
                "Tunnel interfaces brought up",
            ),
            (
                "lobby_vpn_activation_failures_total",
                s.vpn_activation_failures,
                "Tunnel activations that failed or timed out",
            ),
            (
                "lobby_vpn_deactivations_total",
                s.vpn_deactivations,
                "Tunnel interfaces brought down",
            ),
            (
                "lobby_vpn_networks_cleaned_total",
                s.vpn_networks_cleaned,
                "Overlay networks removed by cleanup",
            ),
        ];

        let mut out = String::with_capacity(1536);
        for (name, value, help) in rows {
            write_metric(&mut out, name, value, help);
        }
        out
    }
}

fn write_metric(out: &mut String, name: &str, value: u64, help: &str) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Serializable snapshot of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub launches: u64,
    pub launch_failures: u64,
    pub exits: u64,
    pub crashes: u64,
    pub terminations: u64,
    pub reconcile_runs: u64,
    pub metrics_samples: u64,
    pub vpn_networks_created: u64,
    pub vpn_activations: u64,
    pub vpn_activation_failures: u64,
    pub vpn_deactivations: u64,
    pub vpn_networks_cleaned: u64,
}
