#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use workermaster::wm::config::MasterConfig;
use workermaster::wm::ports::is_port_free;

pub fn stub_worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_wm-stub-worker"))
}

static NEXT_BLOCK: AtomicU16 = AtomicU16::new(0);

/// `len` consecutive free ports, never handed out twice within one test binary.
pub fn free_block(len: u16) -> u16 {
    let seed = 21_000 + (std::process::id() % 12_000) as u16;
    loop {
        let offset = NEXT_BLOCK.fetch_add(len + 1, Ordering::SeqCst);
        let base = seed + offset % 20_000;
        if (base..base + len).all(|p| is_port_free("127.0.0.1", p)) {
            return base;
        }
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub cfg: MasterConfig,
}

impl Fixture {
    /// Pool of `max` stub workers; `extra` flags are appended to every launch.
    pub fn new(max: usize, extra: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = MasterConfig::default();
        cfg.control.port = 0;
        cfg.control.pid_file = dir.path().join("wm.pid");
        cfg.workers.port_base = free_block(max as u16);
        cfg.workers.port_count = max as u16;
        cfg.workers.max_processes = max;
        cfg.workers.program = Some(stub_worker());
        let launch_log = dir.path().join("launches.log");
        let mut args: Vec<String> = [
            "--port",
            "{port}",
            "--target",
            "{target}",
            "--launch-log",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(launch_log.to_string_lossy().into_owned());
        args.extend(extra.iter().map(|s| s.to_string()));
        cfg.workers.args = args;

        let t = &mut cfg.timeouts;
        t.startup = Duration::from_secs(5);
        t.probe_interval = Duration::from_millis(50);
        t.probe_connect = Duration::from_millis(500);
        t.request = Duration::from_secs(5);
        t.control_request = Duration::from_secs(10);
        t.stop_request = Duration::from_secs(1);
        t.stop_grace = Duration::from_millis(300);
        t.term_wait = Duration::from_secs(1);
        t.release_attempts = 30;
        t.release_interval = Duration::from_millis(100);
        Self { dir, cfg }
    }

    pub fn target(&self, name: &str) -> PathBuf {
        let p = self.dir.path().join(name);
        std::fs::write(&p, b"MZ\x90\x00").unwrap();
        p
    }

    pub fn launches(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("launches.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn range(&self) -> (u16, u16) {
        self.cfg.workers.port_range()
    }
}

pub fn state_of(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(".i64");
    PathBuf::from(s)
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(unix)]
pub fn sigkill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}
