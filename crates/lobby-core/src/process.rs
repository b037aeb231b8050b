use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flat view of a game process's lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Launching,
    Running,
    Exited,
    Crashed,
    Terminated,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Crashed | Self::Terminated)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launching => write!(f, "launching"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Crashed => write!(f, "crashed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Validate that a status transition is allowed.
///
/// `launching -> running -> {exited | crashed | terminated}`, plus
/// `launching -> terminated`. Nothing leaves a terminal state.
pub fn validate_transition(from: ProcessStatus, to: ProcessStatus) -> Result<()> {
    let valid = matches!(
        (from, to),
        // OS confirmed the process is alive
        (ProcessStatus::Launching, ProcessStatus::Running)
        // Cancel before confirmation
        | (ProcessStatus::Launching, ProcessStatus::Terminated)
        | (ProcessStatus::Running, ProcessStatus::Exited)
        | (ProcessStatus::Running, ProcessStatus::Crashed)
        | (ProcessStatus::Running, ProcessStatus::Terminated)
    );

    if valid {
        Ok(())
    } else {
        bail!("Invalid process transition: {} -> {}", from, to)
    }
}

/// Lifecycle state with the data each status carries.
///
/// Exit codes only exist on terminal variants, so a record can never claim
/// an exit code while still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessState {
    Launching,
    Running {
        confirmed_at: DateTime<Utc>,
    },
    Exited {
        exit_code: i32,
        ended_at: DateTime<Utc>,
    },
    Crashed {
        /// `None` when the process vanished without an observable status.
        exit_code: Option<i32>,
        ended_at: DateTime<Utc>,
    },
    Terminated {
        /// Filled in once the terminated process has been reaped.
        exit_code: Option<i32>,
        ended_at: DateTime<Utc>,
    },
}

impl ProcessState {
    pub fn status(&self) -> ProcessStatus {
        match self {
            Self::Launching => ProcessStatus::Launching,
            Self::Running { .. } => ProcessStatus::Running,
            Self::Exited { .. } => ProcessStatus::Exited,
            Self::Crashed { .. } => ProcessStatus::Crashed,
            Self::Terminated { .. } => ProcessStatus::Terminated,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Launching | Self::Running { .. } => None,
            Self::Exited { exit_code, .. } => Some(*exit_code),
            Self::Crashed { exit_code, .. } | Self::Terminated { exit_code, .. } => *exit_code,
        }
    }
}

/// How an OS process finished, as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
    /// Gone from the process table with no status available.
    Vanished,
}

impl ExitOutcome {
    /// Shell-style numeric code: signals map to `128 + signal`.
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Code(c) => Some(c),
            Self::Signal(s) => Some(128 + s),
            Self::Vanished => None,
        }
    }
}

/// What the caller asks the supervisor to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSpec {
    pub game_id: String,
    #[serde(default)]
    pub name: String,
    pub executable_path: PathBuf,
    /// Defaults to the executable's parent directory.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl GameSpec {
    pub fn new(game_id: impl Into<String>, executable_path: impl Into<PathBuf>) -> Self {
        Self {
            game_id: game_id.into(),
            name: String::new(),
            executable_path: executable_path.into(),
            working_directory: None,
        }
    }

    pub fn effective_working_directory(&self) -> PathBuf {
        self.working_directory
            .clone()
            .or_else(|| {
                self.executable_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// One supervised OS process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProcess {
    pub process_id: u32,
    pub session_id: String,
    pub user_id: String,
    pub game_id: String,
    pub executable_path: PathBuf,
    pub launch_arguments: Vec<String>,
    pub working_directory: PathBuf,
    #[serde(flatten)]
    pub state: ProcessState,
    pub start_time: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl GameProcess {
    pub fn status(&self) -> ProcessStatus {
        self.state.status()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.exit_code()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// The OS confirmed the process is alive.
    pub fn confirm_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        validate_transition(self.status(), ProcessStatus::Running)?;
        self.state = ProcessState::Running { confirmed_at: now };
        Ok(())
    }

    /// Record an observed exit. A process that finished before it was ever
    /// confirmed passes through `running` first.
    pub fn record_exit(&mut self, outcome: ExitOutcome, now: DateTime<Utc>) -> Result<()> {
        if self.status() == ProcessStatus::Launching {
            self.confirm_running(now)?;
        }
        let next = match outcome {
            ExitOutcome::Code(0) => ProcessState::Exited {
                exit_code: 0,
                ended_at: now,
            },
            other => ProcessState::Crashed {
                exit_code: other.code(),
                ended_at: now,
            },
        };
        validate_transition(self.status(), next.status())?;
        self.state = next;
        Ok(())
    }

    /// Explicit termination requested by the caller.
    pub fn mark_terminated(&mut self, now: DateTime<Utc>) -> Result<()> {
        validate_transition(self.status(), ProcessStatus::Terminated)?;
        self.state = ProcessState::Terminated {
            exit_code: None,
            ended_at: now,
        };
        Ok(())
    }

    /// Attach the reaped exit code to a terminated record.
    pub fn set_terminated_exit_code(&mut self, code: Option<i32>) {
        if let ProcessState::Terminated { exit_code, .. } = &mut self.state
            && exit_code.is_none()
        {
            *exit_code = code;
        }
    }
}
