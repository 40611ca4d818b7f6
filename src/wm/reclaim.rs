//! Forcible reclamation of a TCP port held by some other process.
//!
//! Used only after a port failed to free up within the release window.

use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::wm::error::{Result, WmError};

pub trait PortReclaimer: Send + Sync {
    /// Kill whatever listens on `port`. Returns the number of processes signalled.
    fn reclaim(&self, port: u16) -> Result<usize>;

    fn name(&self) -> &'static str;
}

/// Pick the reclaimer for the current platform.
#[cfg(unix)]
pub fn platform_reclaimer() -> Arc<dyn PortReclaimer> {
    if tool_available("lsof", &["-v"]) {
        Arc::new(LsofReclaimer)
    } else {
        Arc::new(NoopReclaimer)
    }
}

#[cfg(windows)]
pub fn platform_reclaimer() -> Arc<dyn PortReclaimer> {
    Arc::new(NetstatReclaimer)
}

#[cfg(not(any(unix, windows)))]
pub fn platform_reclaimer() -> Arc<dyn PortReclaimer> {
    Arc::new(NoopReclaimer)
}

#[cfg(unix)]
fn tool_available(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

/// `lsof` lookup followed by SIGKILL.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LsofReclaimer;

#[cfg(unix)]
impl PortReclaimer for LsofReclaimer {
    fn reclaim(&self, port: u16) -> Result<usize> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let out = Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
            .output()?;
        // lsof exits 1 when nothing matches.
        let pids = parse_pid_lines(&String::from_utf8_lossy(&out.stdout));
        let me = std::process::id();
        let mut killed = 0usize;
        for pid in pids.into_iter().filter(|p| *p != me) {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => {
                    info!(port, pid, "reclaim: attempt=signal sig=KILL");
                    killed += 1;
                }
                Err(e) => warn!(port, pid, error = %e, "reclaim: kill failed"),
            }
        }
        Ok(killed)
    }

    fn name(&self) -> &'static str {
        "lsof"
    }
}

/// `netstat -ano` lookup followed by `taskkill /F`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetstatReclaimer;

impl PortReclaimer for NetstatReclaimer {
    fn reclaim(&self, port: u16) -> Result<usize> {
        let out = Command::new("netstat").arg("-ano").output()?;
        let pids = parse_netstat_listeners(&String::from_utf8_lossy(&out.stdout), port);
        let me = std::process::id();
        let mut killed = 0usize;
        for pid in pids.into_iter().filter(|p| *p != me) {
            let status = Command::new("taskkill")
                .args(["/F", "/PID", &pid.to_string()])
                .status()
                .map_err(|e| WmError::Spawn(format!("taskkill: {e}")))?;
            if status.success() {
                info!(port, pid, "reclaim: attempt=taskkill");
                killed += 1;
            } else {
                warn!(port, pid, %status, "reclaim: taskkill failed");
            }
        }
        Ok(killed)
    }

    fn name(&self) -> &'static str {
        "netstat"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReclaimer;

impl PortReclaimer for NoopReclaimer {
    fn reclaim(&self, port: u16) -> Result<usize> {
        debug!(port, "reclaim: no port reclaimer available on this platform");
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

fn parse_pid_lines(s: &str) -> Vec<u32> {
    let mut out: Vec<u32> = s
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Pids from `netstat -ano` rows listening on `port` (local address column).
fn parse_netstat_listeners(s: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut out = Vec::new();
    for line in s.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        // Proto  Local Address  Foreign Address  State  PID
        if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if let Ok(pid) = cols[4].parse::<u32>() {
            if pid > 0 && !out.contains(&pid) {
                out.push(pid);
            }
        }
    }
    out
}
