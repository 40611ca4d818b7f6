//! `wmctl`: start, stop, restart and inspect the daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::wm::cli::{Cmd, CtlArgs, OutputFormat};
use crate::wm::config::{self, MasterConfig};
use crate::wm::logging::{self, LogConfig};
use crate::wm::retry::Poll;
use crate::wm::wire::{self, Action, ExchangeTimeouts, Request};

#[derive(Debug, Clone, Copy)]
pub struct CtlTimings {
    pub start_wait: Duration,
    pub stop_wait: Duration,
    pub kill_wait: Duration,
    pub restart_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for CtlTimings {
    fn default() -> Self {
        Self {
            start_wait: Duration::from_secs(15),
            stop_wait: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            restart_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonStatus {
    NotRunning,
    /// Raw `status` response from the daemon.
    Running(Value),
}

#[derive(Debug, Clone)]
pub struct Ctl {
    cfg: MasterConfig,
    daemon_bin: Option<PathBuf>,
    timings: CtlTimings,
}

impl Ctl {
    pub fn new(cfg: MasterConfig, daemon_bin: Option<PathBuf>) -> Self {
        Self {
            cfg,
            daemon_bin,
            timings: CtlTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: CtlTimings) -> Self {
        self.timings = timings;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.cfg.control.host, self.cfg.control.port)
    }

    /// Raw TCP connect probe against the control port.
    pub async fn is_reachable(&self) -> bool {
        let connect = TcpStream::connect((self.cfg.control.host.as_str(), self.cfg.control.port));
        matches!(
            tokio::time::timeout(Duration::from_secs(1), connect).await,
            Ok(Ok(_))
        )
    }

    async fn wait_reachable(&self, want: bool, within: Duration) -> bool {
        Poll::within(within, self.timings.poll_interval)
            .until(|| async move { self.is_reachable().await == want })
            .await
    }

    /// Waits for `pid` itself to go away; reachability stands in where liveness is unknown.
    async fn wait_exited(&self, pid: u32, within: Duration) -> bool {
        Poll::within(within, self.timings.poll_interval)
            .until(|| async move {
                match pid_alive(pid) {
                    Some(alive) => !alive,
                    None => !self.is_reachable().await,
                }
            })
            .await
    }

    fn daemon_program(&self) -> PathBuf {
        if let Some(p) = &self.daemon_bin {
            return p.clone();
        }
        let name = format!("workermaster{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|d| d.join(&name)))
            .filter(|p| p.is_file())
            .unwrap_or_else(|| PathBuf::from(name))
    }

    /// Daemon stdout/stderr land next to the pid file.
    fn daemon_output_path(&self) -> PathBuf {
        self.cfg.control.pid_file.with_extension("out")
    }

    pub async fn start(&self) -> anyhow::Result<String> {
        if self.is_reachable().await {
            return Ok(format!("workermaster already running on {}", self.addr()));
        }
        let program = self.daemon_program();
        let out_path = self.daemon_output_path();
        if let Some(dir) = out_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&out_path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", out_path.display()))?;

        let mut cmd = Command::new(&program);
        if let Some(cfg_path) = &self.cfg.source {
            cmd.arg("-c").arg(cfg_path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out.try_clone()?))
            .stderr(Stdio::from(out));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: a Ctrl-C aimed at wmctl must not reach the daemon.
            cmd.process_group(0);
        }
        debug!(program = %program.display(), "spawning daemon");
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to launch {}: {e}", program.display()))?;
        let pid = child.id();
        write_pid_file(&self.cfg.control.pid_file, pid)?;

        let up = Poll::within(self.timings.start_wait, self.timings.poll_interval)
            .run(|_| {
                let exited = matches!(child.try_wait(), Ok(Some(_)));
                async move {
                    if exited {
                        return Some(false);
                    }
                    self.is_reachable().await.then_some(true)
                }
            })
            .await;
        match up {
            Some(true) => Ok(format!("workermaster started pid={pid} on {}", self.addr())),
            Some(false) => {
                remove_pid_file(&self.cfg.control.pid_file);
                anyhow::bail!(
                    "workermaster exited during startup; see {}",
                    out_path.display()
                )
            }
            None => anyhow::bail!(
                "workermaster pid={pid} did not open {} within {}ms; see {}",
                self.addr(),
                self.timings.start_wait.as_millis(),
                out_path.display()
            ),
        }
    }

    pub async fn stop(&self) -> anyhow::Result<String> {
        let pid_file = &self.cfg.control.pid_file;
        if !self.is_reachable().await {
            remove_pid_file(pid_file);
            return Ok("workermaster is not running".to_string());
        }

        let t = ExchangeTimeouts {
            connect: Duration::from_secs(2),
            io: self.cfg.timeouts.control_request,
        };
        let msg = Request::new(Action::StopServer).to_value();
        let acknowledged =
            match wire::exchange(&self.cfg.control.host, self.cfg.control.port, &msg, t).await {
                Ok(resp) => {
                    info!(response = %resp, "stop: attempt=stop_server outcome=acknowledged");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "stop: attempt=stop_server outcome=failed");
                    false
                }
            };

        // The control port closes before the workers are torn down, so only the
        // daemon's exit means the pool is gone.
        let budget = teardown_budget(&self.cfg);
        let Some(pid) = read_pid_file(pid_file) else {
            if self.wait_reachable(false, self.timings.stop_wait).await {
                return Ok("workermaster stopped".to_string());
            }
            anyhow::bail!(
                "workermaster still answers on {} and no pid file at {}",
                self.addr(),
                pid_file.display()
            );
        };
        let first_wait = if acknowledged {
            budget
        } else {
            self.timings.stop_wait
        };
        if self.wait_exited(pid, first_wait).await {
            remove_pid_file(pid_file);
            return Ok("workermaster stopped".to_string());
        }

        warn!(pid, budget_ms = budget.as_millis() as u64, "daemon still alive after stop_server; decision=signal");
        signal_term(pid);
        if self.wait_exited(pid, budget).await {
            remove_pid_file(pid_file);
            return Ok(format!("workermaster stopped (SIGTERM pid={pid})"));
        }
        warn!(pid, "daemon outlived SIGTERM; decision=kill-group");
        signal_kill(pid);
        if self.wait_exited(pid, self.timings.kill_wait).await {
            remove_pid_file(pid_file);
            return Ok(format!("workermaster stopped (SIGKILL pid={pid})"));
        }
        anyhow::bail!("workermaster pid={pid} survived SIGKILL")
    }

    pub async fn restart(&self) -> anyhow::Result<String> {
        let stopped = self.stop().await?;
        tokio::time::sleep(self.timings.restart_delay).await;
        let started = self.start().await?;
        Ok(format!("{stopped}\n{started}"))
    }

    pub async fn status(&self) -> anyhow::Result<DaemonStatus> {
        if !self.is_reachable().await {
            return Ok(DaemonStatus::NotRunning);
        }
        let t = ExchangeTimeouts {
            connect: Duration::from_secs(2),
            io: self.cfg.timeouts.control_request,
        };
        let msg = Request::new(Action::Status).to_value();
        let resp = wire::exchange(&self.cfg.control.host, self.cfg.control.port, &msg, t)
            .await
            .map_err(|e| anyhow::anyhow!("status request to {} failed: {e}", self.addr()))?;
        Ok(DaemonStatus::Running(resp))
    }

    pub fn render_status(&self, status: &DaemonStatus) -> String {
        match status {
            DaemonStatus::NotRunning => format!("workermaster is not running ({})", self.addr()),
            DaemonStatus::Running(v) => {
                format!("workermaster running on {}\n{}", self.addr(), render_status_text(v))
            }
        }
    }
}

fn write_pid_file(path: &Path, pid: u32) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, format!("{pid}\n"))
        .map_err(|e| anyhow::anyhow!("failed to write pid file {}: {e}", path.display()))
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove pid file");
        }
    }
}

/// Upper bound on how long a daemon may spend stopping a full pool, one worker at a
/// time, each through the whole stop_server/TERM/KILL/release chain.
pub fn teardown_budget(cfg: &MasterConfig) -> Duration {
    let t = &cfg.timeouts;
    let release = t.release_interval.saturating_mul(t.release_attempts);
    let per_worker = t
        .stop_request
        .saturating_mul(2)
        .saturating_add(t.stop_grace)
        .saturating_add(t.term_wait.saturating_mul(2))
        .saturating_add(release)
        .saturating_add(Duration::from_secs(1));
    let workers = u32::try_from(cfg.workers.max_processes).unwrap_or(u32::MAX);
    per_worker
        .saturating_mul(workers)
        .saturating_add(Duration::from_secs(5))
}

/// `None` where the platform gives no cheap answer.
#[cfg(unix)]
fn pid_alive(pid: u32) -> Option<bool> {
    use nix::unistd::Pid;
    let Ok(raw) = i32::try_from(pid) else {
        return Some(false);
    };
    if nix::sys::signal::kill(Pid::from_raw(raw), None).is_err() {
        return Some(false);
    }
    Some(!is_zombie(pid))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}

/// An exited but unreaped process still answers signal 0.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match nix::sys::signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => info!(pid, ?sig, "stop: attempt=signal"),
        Err(e) => warn!(pid, ?sig, error = %e, "stop: signal failed"),
    }
}

#[cfg(unix)]
fn signal_term(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

/// SIGKILL the daemon's process group, which also holds the workers it spawned.
#[cfg(unix)]
fn signal_kill(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => info!(pid, "stop: attempt=signal sig=KILL scope=group"),
        Err(e) => {
            debug!(pid, error = %e, "group kill failed; falling back to the pid");
            send_signal(pid, Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn signal_term(pid: u32) {
    let _ = Command::new("taskkill").args(["/PID", &pid.to_string()]).status();
}

#[cfg(not(unix))]
fn signal_kill(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status();
}

fn fmt_uptime_ms(ms: u64) -> String {
    let mut s = (ms + 500) / 1000;
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

fn pad(s: &str, width: usize) -> String {
    format!("{s:<width$}")
}

fn border(widths: &[usize]) -> String {
    let mut out = String::from("+");
    for w in widths {
        out.push_str(&"-".repeat(*w + 2));
        out.push('+');
    }
    out
}

fn row_line(cols: &[String], widths: &[usize]) -> String {
    let mut out = String::from("|");
    for (i, w) in widths.iter().enumerate() {
        let v = cols.get(i).map(String::as_str).unwrap_or("");
        out.push(' ');
        out.push_str(&pad(v, *w));
        out.push_str(" |");
    }
    out
}

/// Text table for a daemon `status` response.
pub fn render_status_text(v: &Value) -> String {
    if v.get("success").and_then(Value::as_bool) != Some(true) {
        let err = v.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        return format!("status failed: {err}");
    }
    let max = v.get("max_processes").and_then(Value::as_u64).unwrap_or(0);
    let workers = v
        .get("workers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = format!("workers: {}/{max}", workers.len());
    if let Some([first, last]) = v
        .get("port_range")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
    {
        out.push_str(&format!(" (ports {first}-{last})"));
    }
    out.push('\n');

    if !workers.is_empty() {
        let headers = ["port", "pid", "uptime", "idle", "binary_path"];
        let rows: Vec<Vec<String>> = workers
            .iter()
            .map(|w| {
                let num = |k: &str| w.get(k).and_then(Value::as_u64);
                vec![
                    num("port").map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    num("pid").map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    num("uptime_ms").map(fmt_uptime_ms).unwrap_or_else(|| "-".into()),
                    num("idle_ms").map(fmt_uptime_ms).unwrap_or_else(|| "-".into()),
                    w.get("binary_path")
                        .and_then(Value::as_str)
                        .unwrap_or("-")
                        .to_string(),
                ]
            })
            .collect();
        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for r in &rows {
            for (i, c) in r.iter().enumerate() {
                widths[i] = widths[i].max(c.len());
            }
        }
        let top = border(&widths);
        out.push_str(&top);
        out.push('\n');
        out.push_str(&row_line(
            &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &widths,
        ));
        out.push('\n');
        out.push_str(&top);
        out.push('\n');
        for r in &rows {
            out.push_str(&row_line(r, &widths));
            out.push('\n');
        }
        out.push_str(&top);
        out.push('\n');
    }

    let reserved: Vec<String> = v
        .get("reserved")
        .and_then(Value::as_array)
        .map(|a| a.iter().map(|p| p.to_string()).collect())
        .unwrap_or_default();
    if !reserved.is_empty() {
        out.push_str(&format!("reserved ports: {}\n", reserved.join(",")));
    }
    out.trim_end().to_string()
}

/// `wmctl` entry point.
pub async fn run() -> anyhow::Result<()> {
    let args = CtlArgs::parse();
    let cfg = config::load_master_config(args.config.as_deref())?;
    // Warnings only unless WM_LOG says otherwise.
    logging::init(
        LogConfig::from_config(&cfg.logging)
            .with_level(tracing::Level::WARN)
            .with_env_overrides(),
    );
    let ctl = Ctl::new(cfg, args.daemon_bin);

    let cmd = args.cmd.unwrap_or(Cmd::Status {
        format: OutputFormat::Text,
    });
    match cmd {
        Cmd::Start => println!("{}", ctl.start().await?),
        Cmd::Stop => println!("{}", ctl.stop().await?),
        Cmd::Restart => println!("{}", ctl.restart().await?),
        Cmd::Status { format } => {
            let status = ctl.status().await?;
            match format {
                OutputFormat::Text => println!("{}", ctl.render_status(&status)),
                OutputFormat::Json => {
                    let v = match &status {
                        DaemonStatus::NotRunning => {
                            serde_json::json!({"running": false})
                        }
                        DaemonStatus::Running(resp) => {
                            serde_json::json!({"running": true, "status": resp})
                        }
                    };
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
        }
    }
    Ok(())
}
