//! Handle to one running worker process.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::process::Child;

use crate::wm::error::{Result, WmError};

pub struct WorkerProcess {
    pub port: u16,
    pid: u32,
    child: Child,
    /// Target bound to this worker; `None` until promoted.
    pub target: Option<PathBuf>,
    pub last_used: Instant,
    pub started_at: Instant,
    exited: bool,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("target", &self.target)
            .field("exited", &self.exited)
            .finish()
    }
}

impl WorkerProcess {
    pub fn new(port: u16, child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| WmError::Spawn("worker exited before its pid could be read".into()))?;
        let now = Instant::now();
        Ok(Self {
            port,
            pid,
            child,
            target: None,
            last_used: now,
            started_at: now,
            exited: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Non-blocking liveness check; reaps the child when it has exited.
    pub fn is_running(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.exited = true;
                false
            }
        }
    }

    /// Wait up to `timeout` for the process to exit. Returns true once it is gone.
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        if self.exited {
            return true;
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(_) => {
                self.exited = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Send SIGTERM.
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if self.exited {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| WmError::Spawn(format!("pid {} out of range", self.pid)))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| WmError::Io(e.into()))
    }

    /// No polite signal off Unix; fall through to the hard kill.
    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> Result<()> {
        self.child.start_kill().map_err(WmError::from)
    }

    /// SIGKILL and wait up to `timeout` for the exit to be reaped.
    pub async fn kill(&mut self, timeout: Duration) -> Result<bool> {
        if self.exited {
            return Ok(true);
        }
        if let Err(e) = self.child.start_kill() {
            // Already gone between the check and the kill.
            if !self.is_running() {
                return Ok(true);
            }
            return Err(e.into());
        }
        Ok(self.wait_exit(timeout).await)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn sleeper() -> WorkerProcess {
        let child = Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        WorkerProcess::new(7001, child).unwrap()
    }

    #[tokio::test]
    async fn test_terminate_stops_sleep() {
        let mut p = sleeper();
        assert!(p.is_running());
        assert!(p.pid() > 0);
        p.terminate().unwrap();
        assert!(p.wait_exit(Duration::from_secs(5)).await);
        assert!(!p.is_running());
        // signalling a reaped process is a no-op
        p.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_kill_reaps() {
        let mut p = sleeper();
        assert!(!p.wait_exit(Duration::from_millis(50)).await);
        assert!(p.kill(Duration::from_secs(5)).await.unwrap());
        assert!(!p.is_running());
        assert!(p.kill(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_moves_last_used() {
        let mut p = sleeper();
        let before = p.last_used;
        tokio::time::sleep(Duration::from_millis(5)).await;
        p.touch();
        assert!(p.last_used > before);
        assert_eq!(p.started_at, before);
        p.kill(Duration::from_secs(5)).await.unwrap();
    }
}
