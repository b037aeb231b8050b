//! Per-process CPU and memory readings from `/proc`.

use std::time::Instant;

use anyhow::{Context, Result};

use lobby_core::health::ResourceReading;

/// CPU time consumed by a process at a point in wall-clock time. The next
/// sample's CPU percentage is the delta between two marks.
#[derive(Debug, Clone, Copy)]
pub struct CpuMark {
    pub ticks: u64,
    pub at: Instant,
}

/// Raw counters parsed out of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFields {
    pub utime: u64,
    pub stime: u64,
    /// Clock ticks after boot at which the process started.
    pub starttime: u64,
}

/// Parse `/proc/<pid>/stat`. The command name sits in parentheses and may
/// itself contain spaces or parentheses, so fields are counted from the
/// last `)`.
pub fn parse_stat(content: &str) -> Result<StatFields> {
    let close = content
        .rfind(')')
        .context("malformed /proc stat: no command terminator")?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // fields[0] is field 3 (state); utime/stime/starttime are fields 14/15/22.
    let field = |idx: usize, name: &str| -> Result<u64> {
        fields
            .get(idx)
            .with_context(|| format!("malformed /proc stat: missing {}", name))?
            .parse::<u64>()
            .with_context(|| format!("malformed /proc stat: bad {}", name))
    };
    Ok(StatFields {
        utime: field(11, "utime")?,
        stime: field(12, "stime")?,
        starttime: field(19, "starttime")?,
    })
}

/// Parse the resident page count out of `/proc/<pid>/statm`.
pub fn parse_statm_resident(content: &str) -> Result<u64> {
    content
        .split_whitespace()
        .nth(1)
        .context("malformed /proc statm")?
        .parse()
        .context("malformed /proc statm: bad resident count")
}

/// CPU percentage (100 = one full core) between two marks.
pub fn cpu_percent(prev: &CpuMark, now: &CpuMark, clk_tck: f64) -> f32 {
    let wall = now.at.saturating_duration_since(prev.at).as_secs_f64();
    if wall <= 0.0 || clk_tck <= 0.0 {
        return 0.0;
    }
    let cpu = now.ticks.saturating_sub(prev.ticks) as f64 / clk_tck;
    (cpu / wall * 100.0) as f32
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::sync::OnceLock;

    fn clk_tck() -> f64 {
        static TCK: OnceLock<f64> = OnceLock::new();
        *TCK.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
            n if n > 0 => n as f64,
            _ => 100.0,
        })
    }

    fn page_size() -> u64 {
        static PAGE: OnceLock<u64> = OnceLock::new();
        *PAGE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as u64,
            _ => 4096,
        })
    }

    fn uptime_secs() -> Result<f64> {
        let content =
            std::fs::read_to_string("/proc/uptime").context("Failed to read /proc/uptime")?;
        content
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .context("malformed /proc/uptime")
    }

    pub fn sample(pid: u32, prev: Option<CpuMark>) -> Result<(ResourceReading, CpuMark)> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .with_context(|| format!("Failed to read stat for pid {}", pid))?;
        let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid))
            .with_context(|| format!("Failed to read statm for pid {}", pid))?;
        let now = Instant::now();

        let fields = parse_stat(&stat)?;
        let mark = CpuMark {
            ticks: fields.utime + fields.stime,
            at: now,
        };
        let tck = clk_tck();

        let cpu_usage_percent = match prev {
            Some(prev) => cpu_percent(&prev, &mark, tck),
            None => {
                // First reading: average over the process lifetime.
                let age = uptime_secs()? - fields.starttime as f64 / tck;
                if age > 0.0 {
                    (mark.ticks as f64 / tck / age * 100.0) as f32
                } else {
                    0.0
                }
            }
        };
        let memory_usage_bytes = parse_statm_resident(&statm)? * page_size();

        Ok((
            ResourceReading {
                cpu_usage_percent,
                memory_usage_bytes,
            },
            mark,
        ))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn sample(pid: u32, _prev: Option<CpuMark>) -> Result<(ResourceReading, CpuMark)> {
        anyhow::bail!("resource sampling for pid {} requires /proc", pid)
    }
}

/// Take one reading for `pid`. `prev` is the mark returned by the previous
/// call for the same process.
pub fn sample(pid: u32, prev: Option<CpuMark>) -> Result<(ResourceReading, CpuMark)> {
    imp::sample(pid, prev)
}
