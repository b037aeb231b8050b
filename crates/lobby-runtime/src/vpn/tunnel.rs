//! Tunnel interface control. The manager only talks to a `TunnelBackend`;
//! `WgQuick` drives the real `wg-quick` tool.

use std::path::{Path, PathBuf};

use thiserror::Error;

use lobby_core::error::ActivationFailure;

use crate::shell;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("{tool} not found on PATH")]
    ToolUnavailable { tool: String },

    #[error("{0}")]
    Rejected(String),
}

impl TunnelError {
    pub fn failure(&self) -> ActivationFailure {
        match self {
            Self::ToolUnavailable { .. } => ActivationFailure::ToolUnavailable,
            Self::Rejected(_) => ActivationFailure::Rejected,
        }
    }
}

/// Brings an interface up or down from a rendered config file. Calls block;
/// the manager runs them on the blocking pool under a timeout.
pub trait TunnelBackend: Send + Sync + 'static {
    fn up(&self, config_path: &Path) -> Result<(), TunnelError>;
    fn down(&self, config_path: &Path) -> Result<(), TunnelError>;
}

/// `wg-quick up|down <file>`. The binary is resolved on every call, so a
/// manager built before WireGuard was installed starts working once it is.
#[derive(Debug, Clone, Default)]
pub struct WgQuick {
    program: Option<PathBuf>,
}

impl WgQuick {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific binary instead of searching `PATH`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn resolve(&self) -> Result<PathBuf, TunnelError> {
        match &self.program {
            Some(p) => Ok(p.clone()),
            None => which::which("wg-quick").map_err(|_| TunnelError::ToolUnavailable {
                tool: "wg-quick".to_string(),
            }),
        }
    }

    fn run(&self, verb: &str, config_path: &Path) -> Result<(), TunnelError> {
        let program = self.resolve()?;
        let program = program.to_string_lossy();
        let path = config_path.to_string_lossy();
        shell::run_host_checked(&program, &[verb, &path])
            .map(|_| ())
            .map_err(|e| TunnelError::Rejected(format!("{:#}", e)))
    }
}

impl TunnelBackend for WgQuick {
    fn up(&self, config_path: &Path) -> Result<(), TunnelError> {
        self.run("up", config_path)
    }

    fn down(&self, config_path: &Path) -> Result<(), TunnelError> {
        self.run("down", config_path)
    }
}
