//! Detect WireGuard tooling on the host and work out how to install it.

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::info;

use crate::shell;

const PACKAGE: &str = "wireguard-tools";
const MANUAL_URL: &str = "https://www.wireguard.com/install/";

/// What `check_wireguard_availability` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireGuardAvailability {
    /// Both `wg` and `wg-quick` were found.
    pub installed: bool,
    pub wg_path: Option<PathBuf>,
    pub wg_quick_path: Option<PathBuf>,
    pub version: Option<String>,
    /// How to get there when `installed` is false.
    pub install_plan: Option<InstallPlan>,
}

/// One way of installing the tunnel tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallPlan {
    /// Run a package manager non-interactively.
    PackageManager { program: String, args: Vec<String> },
    /// A generated shell script to review and run.
    Script { script: String },
    /// Nothing automatable; show these instructions.
    Manual { instructions: String },
}

impl InstallPlan {
    /// One-line description for terminal output.
    pub fn describe(&self) -> String {
        match self {
            Self::PackageManager { program, args } => format!("{} {}", program, args.join(" ")),
            Self::Script { .. } => "build wireguard-tools from source (script)".to_string(),
            Self::Manual { instructions } => instructions.clone(),
        }
    }
}

fn package_manager(program: &str, args: &[&str]) -> InstallPlan {
    InstallPlan::PackageManager {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

/// Pick an install plan for `os` given which programs exist.
pub fn plan_for(os: &str, has_program: impl Fn(&str) -> bool) -> InstallPlan {
    match os {
        "linux" => {
            if has_program("apt-get") {
                package_manager("apt-get", &["install", "-y", PACKAGE])
            } else if has_program("dnf") {
                package_manager("dnf", &["install", "-y", PACKAGE])
            } else if has_program("pacman") {
                package_manager("pacman", &["-S", "--noconfirm", PACKAGE])
            } else if has_program("zypper") {
                package_manager("zypper", &["--non-interactive", "install", PACKAGE])
            } else if has_program("apk") {
                package_manager("apk", &["add", PACKAGE])
            } else {
                InstallPlan::Script {
                    script: source_build_script(),
                }
            }
        }
        "macos" => {
            if has_program("brew") {
                package_manager("brew", &["install", PACKAGE])
            } else {
                InstallPlan::Manual {
                    instructions: format!(
                        "Install Homebrew and run `brew install {}`, or see {}",
                        PACKAGE, MANUAL_URL
                    ),
                }
            }
        }
        other => InstallPlan::Manual {
            instructions: format!("No automated install for {}; see {}", other, MANUAL_URL),
        },
    }
}

fn source_build_script() -> String {
    format!(
        r#"#!/bin/sh
set -eu
workdir=$(mktemp -d)
trap 'rm -rf "$workdir"' EXIT
git clone --depth 1 https://git.zx2c4.com/{pkg} "$workdir/{pkg}"
make -C "$workdir/{pkg}/src"
sudo make -C "$workdir/{pkg}/src" install WITH_WGQUICK=yes
wg --version
"#,
        pkg = PACKAGE
    )
}

/// The plan for this host.
pub fn install_plan() -> InstallPlan {
    plan_for(std::env::consts::OS, |p| which::which(p).is_ok())
}

/// Probe for `wg` and `wg-quick`. Blocking.
pub fn check() -> WireGuardAvailability {
    let wg_path = which::which("wg").ok();
    let wg_quick_path = which::which("wg-quick").ok();
    let version = wg_path.as_ref().and_then(|p| {
        shell::run_host_stdout(&p.to_string_lossy(), &["--version"])
            .ok()
            .and_then(|out| out.lines().next().map(str::to_string))
    });
    let installed = wg_path.is_some() && wg_quick_path.is_some();

    WireGuardAvailability {
        installed,
        wg_path,
        wg_quick_path,
        version,
        install_plan: if installed { None } else { Some(install_plan()) },
    }
}

/// Execute a plan with output visible to the user. Package managers other
/// than brew run through `sudo` unless we are already root.
pub fn install(plan: &InstallPlan) -> Result<()> {
    match plan {
        InstallPlan::PackageManager { program, args } => {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            info!(program = %program, "Installing {}", PACKAGE);
            if program == "brew" || is_root() {
                shell::run_host_visible(program, &args)
            } else {
                let mut sudo_args = vec![program.as_str()];
                sudo_args.extend(args);
                shell::run_host_visible("sudo", &sudo_args)
            }
        }
        InstallPlan::Script { script } => {
            info!("Building {} from source", PACKAGE);
            shell::run_host_visible("sh", &["-c", script])
        }
        InstallPlan::Manual { instructions } => {
            bail!("Automatic installation is not available: {}", instructions)
        }
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
