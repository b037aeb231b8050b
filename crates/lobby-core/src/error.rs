use std::fmt;

use thiserror::Error;

/// Result alias for operations exposed to the orchestration layer.
pub type LobbyResult<T> = std::result::Result<T, LobbyError>;

/// Typed failures surfaced by the process supervisor and the VPN manager.
///
/// Display output is deliberately stable and minimal: it never carries raw
/// OS error text or filesystem paths. The detailed cause is logged at the
/// point of failure instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LobbyError {
    #[error("launch failed: {0}")]
    Launch(LaunchFailure),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("capacity exceeded: {0}")]
    Capacity(CapacityFailure),

    #[error("tunnel activation failed: {0}")]
    Activation(ActivationFailure),

    #[error("only the session host may {action}")]
    Authorization { action: String },

    #[error("invalid {kind} ID")]
    InvalidId { kind: &'static str },
}

impl LobbyError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Conventional HTTP status for this error. Advisory: the caller owns
    /// the final mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Launch(LaunchFailure::AlreadyRunning) => 409,
            Self::Launch(_) => 500,
            Self::NotFound { .. } => 404,
            Self::Capacity(_) => 409,
            Self::Activation(_) => 500,
            Self::Authorization { .. } => 403,
            Self::InvalidId { .. } => 400,
        }
    }
}

/// Why a launch request could not produce a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    ExecutableMissing,
    NotExecutable,
    SpawnRefused,
    AlreadyRunning,
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutableMissing => write!(f, "game executable not found"),
            Self::NotExecutable => write!(f, "game executable is not runnable"),
            Self::SpawnRefused => write!(f, "the host refused to start the game process"),
            Self::AlreadyRunning => write!(f, "a game process is already active for this player"),
        }
    }
}

/// Why an overlay network could not be provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityFailure {
    TooManyParticipants { requested: usize, capacity: usize },
    PoolExhausted { networks: usize },
}

impl fmt::Display for CapacityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyParticipants {
                requested,
                capacity,
            } => write!(
                f,
                "{} participants requested, at most {} supported per network",
                requested, capacity
            ),
            Self::PoolExhausted { networks } => write!(
                f,
                "overlay address pool exhausted ({} networks in use)",
                networks
            ),
        }
    }
}

/// Why a tunnel interface could not change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFailure {
    ToolUnavailable,
    Rejected,
    TimedOut,
    ConfigWrite,
    Busy,
}

impl fmt::Display for ActivationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolUnavailable => write!(f, "tunnel tooling is not installed"),
            Self::Rejected => write!(f, "tunnel tool reported an error"),
            Self::TimedOut => write!(f, "tunnel tool did not respond in time"),
            Self::ConfigWrite => write!(f, "tunnel configuration could not be written"),
            Self::Busy => write!(f, "network is already changing state"),
        }
    }
}
