use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::HealthBucket;
use crate::process::{GameProcess, ProcessStatus};

/// Point-in-time resource reading for a supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetricsSample {
    pub process_id: u32,
    pub cpu_usage_percent: f32,
    pub memory_usage_bytes: u64,
    pub sampled_at: DateTime<Utc>,
    /// 0-100, derived by the health policy.
    pub health_score: u8,
}

impl ProcessMetricsSample {
    pub fn bucket(&self) -> HealthBucket {
        HealthBucket::from_score(self.health_score)
    }
}

/// Aggregate view of every process tracked for one game session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionHealthSummary {
    pub session_id: String,
    pub total: usize,
    pub launching: usize,
    pub running: usize,
    pub exited: usize,
    pub crashed: usize,
    pub terminated: usize,
    /// Mean health over live processes that have been sampled.
    pub average_health: Option<f32>,
    pub min_health: Option<u8>,
    /// Bucket of the worst live process, if any has been sampled.
    pub bucket: Option<HealthBucket>,
}

impl SessionHealthSummary {
    /// Build a summary from `(process, latest sample)` pairs.
    ///
    /// Only non-terminal processes contribute to the health figures; a
    /// crashed process shows up in `crashed` instead.
    pub fn from_processes<'a, I>(session_id: &str, items: I) -> Self
    where
        I: IntoIterator<Item = (&'a GameProcess, Option<&'a ProcessMetricsSample>)>,
    {
        let mut summary = Self {
            session_id: session_id.to_string(),
            ..Self::default()
        };
        let mut scores = Vec::new();

        for (process, sample) in items {
            summary.total += 1;
            match process.status() {
                ProcessStatus::Launching => summary.launching += 1,
                ProcessStatus::Running => summary.running += 1,
                ProcessStatus::Exited => summary.exited += 1,
                ProcessStatus::Crashed => summary.crashed += 1,
                ProcessStatus::Terminated => summary.terminated += 1,
            }
            if !process.is_terminal()
                && let Some(sample) = sample
            {
                scores.push(sample.health_score);
            }
        }

        if !scores.is_empty() {
            let sum: u32 = scores.iter().map(|s| u32::from(*s)).sum();
            summary.average_health = Some(sum as f32 / scores.len() as f32);
            summary.min_health = scores.iter().min().copied();
            summary.bucket = summary.min_health.map(HealthBucket::from_score);
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExitOutcome, ProcessState};
    use std::path::PathBuf;

    fn process(pid: u32, state: ProcessState) -> GameProcess {
        GameProcess {
            process_id: pid,
            session_id: "s1".to_string(),
            user_id: format!("u{}", pid),
            game_id: "aoe2".to_string(),
            executable_path: PathBuf::from("/bin/true"),
            launch_arguments: Vec::new(),
            working_directory: PathBuf::from("/bin"),
            state,
            start_time: Utc::now(),
            last_health_check: None,
        }
    }

    fn sample(pid: u32, score: u8) -> ProcessMetricsSample {
        ProcessMetricsSample {
            process_id: pid,
            cpu_usage_percent: 10.0,
            memory_usage_bytes: 1 << 20,
            sampled_at: Utc::now(),
            health_score: score,
        }
    }

    #[test]
    fn test_summary_counts_and_health() {
        let running_a = process(
            1,
            ProcessState::Running {
                confirmed_at: Utc::now(),
            },
        );
        let running_b = process(
            2,
            ProcessState::Running {
                confirmed_at: Utc::now(),
            },
        );
        let mut crashed = process(3, ProcessState::Launching);
        crashed
            .record_exit(ExitOutcome::Code(1), Utc::now())
            .unwrap();

        let s1 = sample(1, 100);
        let s2 = sample(2, 70);
        let s3 = sample(3, 10);

        let summary = SessionHealthSummary::from_processes(
            "s1",
            vec![
                (&running_a, Some(&s1)),
                (&running_b, Some(&s2)),
                (&crashed, Some(&s3)),
            ],
        );
        assert_eq!(summary.total, 3);
        assert_eq!(summary.running, 2);
        assert_eq!(summary.crashed, 1);
        assert_eq!(summary.average_health, Some(85.0));
        assert_eq!(summary.min_health, Some(70));
        assert_eq!(summary.bucket, Some(HealthBucket::Warning));
    }

    #[test]
    fn test_summary_empty_session() {
        let summary = SessionHealthSummary::from_processes("ghost", Vec::new());
        assert_eq!(summary.session_id, "ghost");
        assert_eq!(summary.total, 0);
        assert!(summary.average_health.is_none());
        assert!(summary.bucket.is_none());
    }

    #[test]
    fn test_sample_bucket() {
        assert_eq!(sample(1, 95).bucket(), HealthBucket::Healthy);
        assert_eq!(sample(1, 61).bucket(), HealthBucket::Warning);
        assert_eq!(sample(1, 12).bucket(), HealthBucket::Critical);
    }
}
