use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use lobby_core::config::SupervisorConfig;
use lobby_core::error::{LaunchFailure, LobbyError, LobbyResult};
use lobby_core::health::{HealthPolicy, HealthTracker};
use lobby_core::metrics::{ProcessMetricsSample, SessionHealthSummary};
use lobby_core::process::{ExitOutcome, GameProcess, GameSpec, ProcessState};

use super::os;
use super::sampler::{self, CpuMark};
use crate::metrics::Counters;

/// Bound on the wait after SIGKILL; the kernel reaps almost immediately.
const KILL_WAIT: Duration = Duration::from_secs(2);
/// Poll step when waiting on a PID we have no child handle for.
const PID_POLL: Duration = Duration::from_millis(100);

type PairKey = (String, String);

/// Owns every game process launched on this host.
///
/// One record is kept per (session, user) pair: a relaunch supersedes the
/// previous terminal record. The table lock is only held to copy entries out
/// or commit transitions, never across a spawn, a `/proc` read, or a wait.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    policy: HealthPolicy,
    counters: Arc<Counters>,
    table: Arc<Mutex<ProcessTable>>,
}

#[derive(Default)]
struct ProcessTable {
    entries: HashMap<PairKey, Entry>,
    /// Pairs with a spawn in flight.
    pending: HashSet<PairKey>,
}

struct Entry {
    record: GameProcess,
    game: GameSpec,
    child: Option<Arc<Mutex<Child>>>,
    health: HealthTracker,
    cpu_mark: Option<CpuMark>,
    latest: Option<ProcessMetricsSample>,
}

/// Holds a pair's pending mark from the pre-spawn check until the record is
/// committed. Dropped before `disarm`, it clears the mark and kills whatever
/// was spawned, so a cancelled launch neither blocks the pair nor leaves an
/// untracked game running.
struct PendingLaunch {
    table: Arc<Mutex<ProcessTable>>,
    key: Option<PairKey>,
    pid: Option<u32>,
}

impl PendingLaunch {
    fn disarm(&mut self) {
        self.key = None;
        self.pid = None;
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        if let Some(pid) = self.pid {
            warn!(pid, "Launch abandoned before it was recorded, killing process group");
            if let Err(e) = os::signal_group(pid, libc::SIGKILL) {
                warn!(pid, error = %e, "Could not kill abandoned launch");
            }
        }
        match self.table.try_lock() {
            Ok(mut table) => {
                table.pending.remove(&key);
            }
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    let table = Arc::clone(&self.table);
                    rt.spawn(async move {
                        table.lock().await.pending.remove(&key);
                    });
                }
                Err(_) => warn!(session_id = %key.0, user_id = %key.1, "Pending launch mark left behind"),
            },
        }
    }
}

enum Liveness {
    Alive,
    Gone(ExitOutcome),
    /// The child handle is busy (a terminate is waiting on it).
    Busy,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, policy: HealthPolicy, counters: Arc<Counters>) -> Self {
        Self {
            config,
            policy,
            counters,
            table: Arc::new(Mutex::new(ProcessTable::default())),
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn `game` for (session, user). The returned record is `launching`;
    /// the next reconcile confirms it.
    #[instrument(skip_all, fields(session_id = %session_id, user_id = %user_id, game_id = %game.game_id))]
    pub async fn launch(
        &self,
        session_id: &str,
        user_id: &str,
        game: &GameSpec,
        launch_arguments: Vec<String>,
    ) -> LobbyResult<GameProcess> {
        let key = (session_id.to_string(), user_id.to_string());
        {
            let mut table = self.table.lock().await;
            let busy = table
                .entries
                .get(&key)
                .is_some_and(|e| !e.record.is_terminal());
            if busy || !table.pending.insert(key.clone()) {
                return Err(LobbyError::Launch(LaunchFailure::AlreadyRunning));
            }
        }

        let mut pending = PendingLaunch {
            table: Arc::clone(&self.table),
            key: Some(key.clone()),
            pid: None,
        };

        let working_directory = game.effective_working_directory();
        let spawned = os::spawn_detached(&game.executable_path, &launch_arguments, &working_directory);
        if let Ok((_, pid)) = &spawned {
            pending.pid = Some(*pid);
        }

        // No await between here and the commit below.
        let mut table = self.table.lock().await;
        table.pending.remove(&key);
        pending.disarm();
        let (child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(failure) => {
                Counters::bump(&self.counters.launch_failures);
                warn!(reason = %failure, "Launch failed");
                return Err(LobbyError::Launch(failure));
            }
        };

        let record = GameProcess {
            process_id: pid,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            game_id: game.game_id.clone(),
            executable_path: game.executable_path.clone(),
            launch_arguments,
            working_directory,
            state: ProcessState::Launching,
            start_time: Utc::now(),
            last_health_check: None,
        };
        table.entries.insert(
            key,
            Entry {
                record: record.clone(),
                game: game.clone(),
                child: Some(Arc::new(Mutex::new(child))),
                health: HealthTracker::new(self.config.health_window),
                cpu_mark: None,
                latest: None,
            },
        );
        Counters::bump(&self.counters.launches);
        info!(pid, "Game process launched");
        Ok(record)
    }

    /// Reconcile every non-terminal record against the OS and return all
    /// tracked records. The only path besides `terminate_game` that moves a
    /// process into a terminal state.
    pub async fn update_all_process_statuses(&self) -> Vec<GameProcess> {
        let targets: Vec<(PairKey, u32, Option<Arc<Mutex<Child>>>)> = {
            let table = self.table.lock().await;
            table
                .entries
                .iter()
                .filter(|(_, e)| !e.record.is_terminal())
                .map(|(k, e)| (k.clone(), e.record.process_id, e.child.clone()))
                .collect()
        };

        let mut observed = Vec::with_capacity(targets.len());
        for (key, pid, child) in targets {
            observed.push((key, pid, probe(pid, child.as_ref())));
        }

        let mut table = self.table.lock().await;
        let now = Utc::now();
        for (key, pid, liveness) in observed {
            let Some(entry) = table.entries.get_mut(&key) else {
                continue;
            };
            if entry.record.process_id != pid || entry.record.is_terminal() {
                continue;
            }
            let result = match liveness {
                Liveness::Busy => Ok(()),
                Liveness::Alive => {
                    if matches!(entry.record.state, ProcessState::Launching) {
                        entry.record.confirm_running(now)
                    } else {
                        Ok(())
                    }
                }
                Liveness::Gone(outcome) => {
                    let res = entry.record.record_exit(outcome, now);
                    if res.is_ok() {
                        entry.child = None;
                        if entry.record.exit_code() == Some(0) {
                            Counters::bump(&self.counters.exits);
                        } else {
                            Counters::bump(&self.counters.crashes);
                        }
                        info!(
                            session_id = %key.0,
                            user_id = %key.1,
                            pid,
                            status = %entry.record.status(),
                            exit_code = ?entry.record.exit_code(),
                            "Game process ended"
                        );
                    }
                    res
                }
            };
            if let Err(e) = result {
                warn!(session_id = %key.0, user_id = %key.1, pid, error = %e, "Reconcile skipped entry");
            }
        }
        Counters::bump(&self.counters.reconcile_runs);
        collect_sorted(table.entries.values().map(|e| &e.record))
    }

    /// Terminate whatever runs for (session, user) and launch the same game
    /// with the same arguments again.
    #[instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
    pub async fn restart_game(&self, session_id: &str, user_id: &str) -> LobbyResult<GameProcess> {
        let (game, args) = {
            let table = self.table.lock().await;
            let entry = table
                .entries
                .get(&(session_id.to_string(), user_id.to_string()))
                .ok_or_else(|| {
                    LobbyError::not_found("game process", format!("{}/{}", session_id, user_id))
                })?;
            (entry.game.clone(), entry.record.launch_arguments.clone())
        };

        let stopped = self.terminate_game(session_id, user_id).await;
        debug!(stopped, "Previous process handled, relaunching");
        self.launch(session_id, user_id, &game, args).await
    }

    /// SIGTERM the process group, wait up to the grace period, then SIGKILL.
    ///
    /// Returns `false` if nothing was running. The record is marked
    /// `terminated` before the wait starts; the exit code is attached once
    /// the process has been reaped.
    #[instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
    pub async fn terminate_game(&self, session_id: &str, user_id: &str) -> bool {
        let key = (session_id.to_string(), user_id.to_string());
        let (pid, child) = {
            let table = self.table.lock().await;
            match table.entries.get(&key) {
                Some(e) if !e.record.is_terminal() => (e.record.process_id, e.child.clone()),
                _ => return false,
            }
        };

        let liveness = probe(pid, child.as_ref());

        {
            let mut table = self.table.lock().await;
            let Some(entry) = table.entries.get_mut(&key) else {
                return false;
            };
            if entry.record.process_id != pid || entry.record.is_terminal() {
                return false;
            }
            let now = Utc::now();
            if let Liveness::Gone(outcome) = liveness {
                // Already dead: record what the sweep would have seen.
                if entry.record.record_exit(outcome, now).is_ok() {
                    entry.child = None;
                }
                return false;
            }
            if let Err(e) = entry.record.mark_terminated(now) {
                warn!(pid, error = %e, "Could not mark process terminated");
                return false;
            }
            Counters::bump(&self.counters.terminations);
        }
        info!(pid, "Terminating game process");

        let grace = Duration::from_secs(self.config.terminate_grace_secs);
        let outcome = stop_process(pid, child, grace).await;

        let mut table = self.table.lock().await;
        if let Some(entry) = table.entries.get_mut(&key)
            && entry.record.process_id == pid
        {
            entry.record.set_terminated_exit_code(outcome.and_then(ExitOutcome::code));
            entry.child = None;
        }
        true
    }

    /// All records for a user, reconciled first.
    pub async fn get_all_user_games(&self, user_id: &str) -> Vec<GameProcess> {
        self.update_all_process_statuses()
            .await
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect()
    }

    /// Status counts and health figures for one session, reconciled first.
    pub async fn get_session_health_summary(&self, session_id: &str) -> SessionHealthSummary {
        self.update_all_process_statuses().await;
        let table = self.table.lock().await;
        SessionHealthSummary::from_processes(
            session_id,
            table
                .entries
                .values()
                .filter(|e| e.record.session_id == session_id)
                .map(|e| (&e.record, e.latest.as_ref())),
        )
    }

    /// Latest sample for a tracked PID; `None` until the first sample lands.
    pub async fn get_process_metrics(
        &self,
        process_id: u32,
    ) -> LobbyResult<Option<ProcessMetricsSample>> {
        let table = self.table.lock().await;
        table
            .entries
            .values()
            .find(|e| e.record.process_id == process_id)
            .map(|e| e.latest.clone())
            .ok_or_else(|| LobbyError::not_found("process", process_id.to_string()))
    }

    /// Latest sample of every tracked process, ordered by PID.
    pub async fn get_all_metrics(&self) -> Vec<ProcessMetricsSample> {
        let table = self.table.lock().await;
        let mut samples: Vec<_> = table
            .entries
            .values()
            .filter_map(|e| e.latest.clone())
            .collect();
        samples.sort_by_key(|s| s.process_id);
        samples
    }

    pub async fn get_process(&self, session_id: &str, user_id: &str) -> Option<GameProcess> {
        let table = self.table.lock().await;
        table
            .entries
            .get(&(session_id.to_string(), user_id.to_string()))
            .map(|e| e.record.clone())
    }

    /// All tracked records without reconciling.
    pub async fn list_processes(&self) -> Vec<GameProcess> {
        let table = self.table.lock().await;
        collect_sorted(table.entries.values().map(|e| &e.record))
    }

    /// Read `/proc` for every live process and fold the readings into each
    /// process's health history. Returns the number of samples recorded.
    pub async fn sample_metrics(&self) -> usize {
        let targets: Vec<(PairKey, u32, Option<CpuMark>)> = {
            let table = self.table.lock().await;
            table
                .entries
                .iter()
                .filter(|(_, e)| !e.record.is_terminal())
                .map(|(k, e)| (k.clone(), e.record.process_id, e.cpu_mark))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let readings = match tokio::task::spawn_blocking(move || {
            targets
                .into_iter()
                .map(|(key, pid, prev)| (key, pid, sampler::sample(pid, prev)))
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(readings) => readings,
            Err(e) => {
                warn!(error = %e, "Metrics sampling task failed");
                return 0;
            }
        };

        let mut table = self.table.lock().await;
        let now = Utc::now();
        let mut recorded = 0;
        for (key, pid, reading) in readings {
            let (reading, mark) = match reading {
                Ok(r) => r,
                Err(e) => {
                    let reason = format!("{:#}", e);
                    debug!(pid, error = %reason, "No sample");
                    continue;
                }
            };
            let Some(entry) = table.entries.get_mut(&key) else {
                continue;
            };
            if entry.record.process_id != pid || entry.record.is_terminal() {
                continue;
            }
            let health_score = entry.health.observe(&self.policy, &reading, now);
            entry.cpu_mark = Some(mark);
            entry.record.last_health_check = Some(now);
            entry.latest = Some(ProcessMetricsSample {
                process_id: pid,
                cpu_usage_percent: reading.cpu_usage_percent,
                memory_usage_bytes: reading.memory_usage_bytes,
                sampled_at: now,
                health_score,
            });
            recorded += 1;
        }
        self.counters
            .metrics_samples
            .fetch_add(recorded as u64, std::sync::atomic::Ordering::Relaxed);
        recorded
    }
}

fn collect_sorted<'a>(records: impl Iterator<Item = &'a GameProcess>) -> Vec<GameProcess> {
    let mut out: Vec<GameProcess> = records.cloned().collect();
    out.sort_by(|a, b| {
        (&a.session_id, &a.user_id, a.start_time).cmp(&(&b.session_id, &b.user_id, b.start_time))
    });
    out
}

/// Non-blocking liveness check: the child handle first, `kill(pid, 0)` as
/// the fallback.
fn probe(pid: u32, child: Option<&Arc<Mutex<Child>>>) -> Liveness {
    let Some(child) = child else {
        return pid_liveness(pid);
    };
    let Ok(mut guard) = child.try_lock() else {
        return Liveness::Busy;
    };
    match guard.try_wait() {
        Ok(Some(status)) => Liveness::Gone(os::exit_outcome(status)),
        Ok(None) => Liveness::Alive,
        Err(e) => {
            debug!(pid, error = %e, "try_wait failed, falling back to kill(0)");
            pid_liveness(pid)
        }
    }
}

fn pid_liveness(pid: u32) -> Liveness {
    if os::is_pid_alive(pid) {
        Liveness::Alive
    } else {
        Liveness::Gone(ExitOutcome::Vanished)
    }
}

/// Graceful stop of a process group. Returns the reaped outcome when one
/// could be observed.
async fn stop_process(
    pid: u32,
    child: Option<Arc<Mutex<Child>>>,
    grace: Duration,
) -> Option<ExitOutcome> {
    match os::signal_group(pid, libc::SIGTERM) {
        Ok(true) => {}
        Ok(false) => debug!(pid, "Process group already gone"),
        Err(e) => warn!(pid, error = %e, "SIGTERM failed"),
    }

    if let Some(outcome) = wait_for_exit(pid, child.as_ref(), grace).await {
        return Some(outcome);
    }

    warn!(pid, grace_secs = grace.as_secs(), "Grace period elapsed, sending SIGKILL");
    if let Err(e) = os::signal_group(pid, libc::SIGKILL) {
        warn!(pid, error = %e, "SIGKILL failed");
    }
    wait_for_exit(pid, child.as_ref(), KILL_WAIT).await
}

async fn wait_for_exit(
    pid: u32,
    child: Option<&Arc<Mutex<Child>>>,
    limit: Duration,
) -> Option<ExitOutcome> {
    match child {
        Some(child) => {
            let mut guard = child.lock().await;
            match tokio::time::timeout(limit, guard.wait()).await {
                Ok(Ok(status)) => Some(os::exit_outcome(status)),
                Ok(Err(e)) => {
                    warn!(pid, error = %e, "wait failed");
                    None
                }
                Err(_) => None,
            }
        }
        None => {
            let deadline = tokio::time::Instant::now() + limit;
            while tokio::time::Instant::now() < deadline {
                if !os::is_pid_alive(pid) {
                    return Some(ExitOutcome::Vanished);
                }
                tokio::time::sleep(PID_POLL).await;
            }
            None
        }
    }
}
