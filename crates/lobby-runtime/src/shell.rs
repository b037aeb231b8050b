use anyhow::{Context, Result};
use std::process::{Command, Output, Stdio};

/// Run a command on the host, capturing output.
pub fn run_host(cmd: &str, args: &[&str]) -> Result<Output> {
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))
}

/// Run a command on the host, failing on a non-zero exit. Stderr is folded
/// into the error so callers can log it.
pub fn run_host_checked(cmd: &str, args: &[&str]) -> Result<Output> {
    let output = run_host(cmd, args)?;
    if !output.status.success() {
        anyhow::bail!(
            "Command failed (exit {}): {} {}: {}",
            output.status.code().unwrap_or(-1),
            cmd,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Run a command on the host, inheriting stdio (visible to user).
pub fn run_host_visible(cmd: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(cmd)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!(
            "Command failed (exit {}): {} {}",
            status.code().unwrap_or(-1),
            cmd,
            args.join(" ")
        );
    }
    Ok(())
}

/// Run a command on the host, returning trimmed stdout (stderr if stdout is
/// empty, since several tools print their version there).
pub fn run_host_stdout(cmd: &str, args: &[&str]) -> Result<String> {
    let output = run_host_checked(cmd, args)?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
    } else {
        Ok(stdout)
    }
}
