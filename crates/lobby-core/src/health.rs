//! Rolling health score for a supervised game process.
//!
//! A score starts at 100 and loses points for sustained high CPU, memory
//! growth relative to the process's first sample, and a memory series that
//! keeps climbing without a plateau. A process that has stayed anomaly-free
//! long enough earns a small recovery bonus. Weights are policy, not
//! contract: the guarantees are that more resource use never scores higher
//! and that an anomaly-free process scores at least [`HEALTHY_THRESHOLD`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scores at or above this are "healthy".
pub const HEALTHY_THRESHOLD: u8 = 80;
/// Scores at or above this (and below healthy) are "warning".
pub const WARNING_THRESHOLD: u8 = 60;

const MAX_SCORE: i32 = 100;
const SUSTAINED_CPU_SAMPLES: u32 = 3;

/// UI bucketing of a health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBucket {
    Healthy,
    Warning,
    Critical,
}

impl HealthBucket {
    pub fn from_score(score: u8) -> Self {
        if score >= HEALTHY_THRESHOLD {
            Self::Healthy
        } else if score >= WARNING_THRESHOLD {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for HealthBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Tunable weights for health scoring. Loaded from the `[health]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// CPU percentage considered "high".
    pub cpu_high_water_pct: f32,
    /// CPU percentage considered critical on a single sample.
    pub cpu_critical_pct: f32,
    /// Memory / baseline ratio that starts costing points.
    pub memory_growth_warn_ratio: f64,
    /// Memory / baseline ratio that costs the most.
    pub memory_growth_critical_ratio: f64,
    /// Anomaly-free age after which the recovery bonus applies.
    pub recovery_after_secs: u64,
    pub cpu_high_penalty: u8,
    pub cpu_sustained_penalty: u8,
    pub cpu_critical_penalty: u8,
    pub memory_warn_penalty: u8,
    pub memory_critical_penalty: u8,
    pub memory_trend_penalty: u8,
    pub recovery_bonus: u8,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            cpu_high_water_pct: 85.0,
            cpu_critical_pct: 95.0,
            memory_growth_warn_ratio: 1.5,
            memory_growth_critical_ratio: 2.5,
            recovery_after_secs: 600,
            cpu_high_penalty: 10,
            cpu_sustained_penalty: 20,
            cpu_critical_penalty: 30,
            memory_warn_penalty: 10,
            memory_critical_penalty: 25,
            memory_trend_penalty: 15,
            recovery_bonus: 5,
        }
    }
}

impl HealthPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.cpu_high_water_pct > 0.0 && self.cpu_high_water_pct <= self.cpu_critical_pct) {
            anyhow::bail!(
                "health.cpu_high_water_pct ({}) must be > 0 and <= cpu_critical_pct ({})",
                self.cpu_high_water_pct,
                self.cpu_critical_pct
            );
        }
        if !(self.memory_growth_warn_ratio > 1.0
            && self.memory_growth_warn_ratio <= self.memory_growth_critical_ratio)
        {
            anyhow::bail!(
                "health.memory_growth_warn_ratio ({}) must be > 1 and <= memory_growth_critical_ratio ({})",
                self.memory_growth_warn_ratio,
                self.memory_growth_critical_ratio
            );
        }
        if self.cpu_high_penalty > self.cpu_sustained_penalty
            || self.cpu_sustained_penalty > self.cpu_critical_penalty
            || self.memory_warn_penalty > self.memory_critical_penalty
        {
            anyhow::bail!("health penalties must not decrease as severity increases");
        }
        Ok(())
    }
}

/// A single resource reading, before scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceReading {
    pub cpu_usage_percent: f32,
    pub memory_usage_bytes: u64,
}

/// Per-process scoring history.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    window: usize,
    baseline_memory: Option<u64>,
    recent_memory: VecDeque<u64>,
    cpu_streak: u32,
    anomaly_seen: bool,
    first_sampled_at: Option<DateTime<Utc>>,
}

impl HealthTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            baseline_memory: None,
            recent_memory: VecDeque::new(),
            cpu_streak: 0,
            anomaly_seen: false,
            first_sampled_at: None,
        }
    }

    /// Score a reading against the current history without recording it.
    pub fn score(&self, policy: &HealthPolicy, reading: &ResourceReading, now: DateTime<Utc>) -> u8 {
        let penalty = self.penalty(policy, reading);
        let bonus = if self.earns_recovery_bonus(policy, now) {
            i32::from(policy.recovery_bonus)
        } else {
            0
        };
        (MAX_SCORE - penalty + bonus).clamp(0, MAX_SCORE) as u8
    }

    /// Score a reading and fold it into the history.
    pub fn observe(
        &mut self,
        policy: &HealthPolicy,
        reading: &ResourceReading,
        now: DateTime<Utc>,
    ) -> u8 {
        let score = self.score(policy, reading, now);
        let penalty = self.penalty(policy, reading);

        self.cpu_streak = if reading.cpu_usage_percent >= policy.cpu_high_water_pct {
            self.cpu_streak + 1
        } else {
            0
        };
        if self.baseline_memory.is_none() {
            self.baseline_memory = Some(reading.memory_usage_bytes);
        }
        self.recent_memory.push_back(reading.memory_usage_bytes);
        while self.recent_memory.len() > self.window {
            self.recent_memory.pop_front();
        }
        if penalty > 0 {
            self.anomaly_seen = true;
        }
        self.first_sampled_at.get_or_insert(now);

        score
    }

    fn penalty(&self, policy: &HealthPolicy, reading: &ResourceReading) -> i32 {
        let cpu = reading.cpu_usage_percent;
        let mut penalty = 0i32;

        if cpu >= policy.cpu_critical_pct {
            penalty += i32::from(policy.cpu_critical_penalty);
        } else if cpu >= policy.cpu_high_water_pct {
            if self.cpu_streak + 1 >= SUSTAINED_CPU_SAMPLES {
                penalty += i32::from(policy.cpu_sustained_penalty);
            } else {
                penalty += i32::from(policy.cpu_high_penalty);
            }
        }

        let memory = reading.memory_usage_bytes;
        let baseline = self.baseline_memory.unwrap_or(memory).max(1);
        let ratio = memory as f64 / baseline as f64;
        if ratio >= policy.memory_growth_critical_ratio {
            penalty += i32::from(policy.memory_critical_penalty);
        } else if ratio >= policy.memory_growth_warn_ratio {
            penalty += i32::from(policy.memory_warn_penalty);
        }

        if self.memory_climbing_into(memory) {
            penalty += i32::from(policy.memory_trend_penalty);
        }

        penalty
    }

    /// True when the retained window is strictly increasing and `next`
    /// continues the climb.
    fn memory_climbing_into(&self, next: u64) -> bool {
        if self.recent_memory.len() + 1 < self.window {
            return false;
        }
        let strictly_increasing = self
            .recent_memory
            .iter()
            .zip(self.recent_memory.iter().skip(1))
            .all(|(a, b)| b > a);
        match self.recent_memory.back() {
            Some(last) => strictly_increasing && next > *last,
            None => false,
        }
    }

    fn earns_recovery_bonus(&self, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        if self.anomaly_seen {
            return false;
        }
        match self.first_sampled_at {
            Some(first) => (now - first).num_seconds() >= policy.recovery_after_secs as i64,
            None => false,
        }
    }
}
