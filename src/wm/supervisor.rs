//! The worker pool: at most `max_processes` live workers, one per target.
//!
//! All bookkeeping sits behind one mutex over {active workers, reservations}. The lock
//! is only held for map operations; launching, probing, message exchange and waiting
//! for processes or ports all happen with it released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::wm::config::{MasterConfig, Timeouts};
use crate::wm::error::{ProtocolError, Result, WmError};
use crate::wm::ports::{PortAllocator, Reservations};
use crate::wm::proc::WorkerProcess;
use crate::wm::reclaim::PortReclaimer;
use crate::wm::retry::Poll;
use crate::wm::spawn::LaunchSpec;
use crate::wm::wire::{self, Action, ExchangeTimeouts, Request};

/// Where to reach a live worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub port: u16,
    pub pid: u32,
    pub binary_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub port: u16,
    pub pid: u32,
    pub binary_path: Option<PathBuf>,
    pub idle_ms: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub max_processes: usize,
    pub workers: Vec<WorkerSnapshot>,
    pub reserved: Vec<u16>,
}

struct PoolState {
    workers: HashMap<u16, WorkerProcess>,
    reservations: Reservations,
}

enum Promotion {
    Stored(WorkerInfo),
    /// Another spawn for the same target won the race.
    Duplicate(WorkerInfo, WorkerProcess),
}

pub struct Supervisor {
    state: Mutex<PoolState>,
    ports: PortAllocator,
    launch: LaunchSpec,
    worker_host: String,
    max_processes: usize,
    state_suffix: String,
    timeouts: Timeouts,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("ports", &self.ports)
            .field("max_processes", &self.max_processes)
            .finish_non_exhaustive()
    }
}

fn ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Supervisor {
    pub fn new(cfg: &MasterConfig, reclaimer: Arc<dyn PortReclaimer>) -> Result<Self> {
        let w = &cfg.workers;
        let t = &cfg.timeouts;
        if w.max_processes == 0 {
            return Err(WmError::Config("workers.max_processes must be at least 1".into()));
        }
        let ports = PortAllocator::new(
            w.host.clone(),
            w.port_range(),
            Poll::new(t.release_attempts, t.release_interval),
            reclaimer,
        );
        Ok(Self {
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                reservations: Reservations::new(t.reservation_ttl),
            }),
            ports,
            launch: LaunchSpec::from_config(w)?,
            worker_host: w.host.clone(),
            max_processes: w.max_processes,
            state_suffix: w.state_suffix.clone(),
            timeouts: t.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves the maps consistent; keep going.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn port_range(&self) -> (u16, u16) {
        self.ports.range()
    }

    pub fn state_path(&self, target: &Path) -> PathBuf {
        let mut s = target.as_os_str().to_os_string();
        s.push(&self.state_suffix);
        PathBuf::from(s)
    }

    pub fn request_timeouts(&self) -> ExchangeTimeouts {
        ExchangeTimeouts {
            connect: self.timeouts.probe_connect,
            io: self.timeouts.request,
        }
    }

    /// Return the live worker bound to `target`, starting one if needed.
    pub async fn ensure_worker(&self, target: &Path) -> Result<WorkerInfo> {
        if let Some(info) = self.lookup(target).await {
            return Ok(info);
        }

        let state = self.state_path(target);
        if !target.exists() && !state.exists() {
            return Err(WmError::TargetNotFound {
                target: target.display().to_string(),
                state: state.display().to_string(),
            });
        }

        let port = self.acquire_port().await?;
        let proc = match self.start_on(port, target).await {
            Ok(p) => p,
            Err(e) => {
                self.ports.cancel(&mut self.lock().reservations, port);
                return Err(e);
            }
        };

        let promotion = {
            let mut st = self.lock();
            st.reservations.remove(port);
            let existing = st
                .workers
                .iter()
                .find(|(_, w)| w.target.as_deref() == Some(target))
                .map(|(p, _)| *p);
            match existing.and_then(|p| st.workers.get_mut(&p)) {
                Some(w) => {
                    w.touch();
                    Promotion::Duplicate(info_of(w, target), proc)
                }
                None => {
                    let mut proc = proc;
                    proc.target = Some(target.to_path_buf());
                    proc.touch();
                    let info = info_of(&proc, target);
                    st.workers.insert(port, proc);
                    Promotion::Stored(info)
                }
            }
        };

        match promotion {
            Promotion::Stored(info) => {
                info!(port, pid = info.pid, target = %target.display(), "worker active");
                Ok(info)
            }
            Promotion::Duplicate(existing, fresh) => {
                warn!(
                    port,
                    pid = fresh.pid(),
                    existing_port = existing.port,
                    target = %target.display(),
                    "concurrent spawn for the same target; decision=drop-duplicate"
                );
                if let Err(e) = self.stop_process(fresh, true).await {
                    error!(port, error = %e, "failed to stop duplicate worker");
                }
                self.ports.wait_released(port).await;
                Ok(existing)
            }
        }
    }

    /// Fast path: refresh and return the active worker for `target`. Dead workers are dropped.
    async fn lookup(&self, target: &Path) -> Option<WorkerInfo> {
        let dead_port = {
            let mut st = self.lock();
            let port = st
                .workers
                .iter()
                .find(|(_, w)| w.target.as_deref() == Some(target))
                .map(|(p, _)| *p)?;
            let w = st.workers.get_mut(&port)?;
            if w.is_running() {
                w.touch();
                return Some(info_of(w, target));
            }
            port
        };
        let dead = self.lock().workers.remove(&dead_port);
        if let Some(w) = dead {
            warn!(port = dead_port, pid = w.pid(), target = %target.display(), "worker exited on its own; respawning");
        }
        self.release_port(dead_port).await;
        None
    }

    /// Reserve a free port. Only a pool at capacity evicts its least recently used worker.
    async fn acquire_port(&self) -> Result<u16> {
        let (port, victim) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let now = Instant::now();
            for p in st.reservations.purge_expired(now) {
                info!(port = p, "reservation expired");
            }
            if st.workers.len() + st.reservations.len() < self.max_processes {
                let workers = &st.workers;
                return match self
                    .ports
                    .reserve(&mut st.reservations, |p| workers.contains_key(&p), now)
                {
                    Some(p) => Ok(p),
                    None => {
                        let (first, last) = self.ports.range();
                        warn!(
                            workers = st.workers.len(),
                            reserved = st.reservations.len(),
                            first,
                            last,
                            "no bindable port below capacity; decision=reject"
                        );
                        Err(WmError::PortExhausted { first, last })
                    }
                };
            }
            let lru = st
                .workers
                .iter()
                .min_by_key(|(_, w)| w.last_used)
                .map(|(p, _)| *p);
            let Some(p) = lru else {
                let (first, last) = self.ports.range();
                return Err(WmError::PortExhausted { first, last });
            };
            let victim = st.workers.remove(&p);
            st.reservations.insert(p, now);
            (p, victim)
        };

        if let Some(w) = victim {
            info!(
                port,
                pid = w.pid(),
                target = ?w.target,
                idle_ms = ms(w.last_used.elapsed()),
                "pool full; decision=evict-lru"
            );
            if let Err(e) = self.stop_process(w, true).await {
                error!(port, error = %e, "evicted worker could not be stopped");
            }
        }
        if !self.ports.wait_released(port).await {
            self.ports.cancel(&mut self.lock().reservations, port);
            let (first, last) = self.ports.range();
            return Err(WmError::PortExhausted { first, last });
        }
        Ok(port)
    }

    /// Launch and probe; on failure quarantine the persisted state and retry exactly once.
    async fn start_on(&self, port: u16, target: &Path) -> Result<WorkerProcess> {
        let state = self.state_path(target);
        let mut attempt: u32 = 1;
        loop {
            // Keep a long startup from outliving the reservation.
            self.lock().reservations.insert(port, Instant::now());

            let mut proc = self.launch.launch(port, target)?;
            let started = Instant::now();
            if self.await_ready(&mut proc).await {
                info!(port, pid = proc.pid(), attempt, elapsed_ms = ms(started.elapsed()), "worker ready");
                return Ok(proc);
            }
            warn!(
                port,
                pid = proc.pid(),
                target = %target.display(),
                attempt,
                elapsed_ms = ms(started.elapsed()),
                "worker did not answer hello"
            );
            if let Err(e) = self.stop_process(proc, false).await {
                error!(port, error = %e, "unready worker could not be stopped");
            }

            if attempt == 1 && state.exists() {
                let bak = quarantine_path(&state);
                match std::fs::rename(&state, &bak) {
                    Ok(()) => warn!(
                        state = %state.display(),
                        moved_to = %bak.display(),
                        "analysis state looks corrupted; decision=quarantine-and-retry"
                    ),
                    Err(e) => {
                        error!(state = %state.display(), error = %e, "quarantine failed");
                        self.ports.wait_released(port).await;
                        return Err(WmError::WorkerStartupTimeout {
                            target: target.display().to_string(),
                            attempts: attempt,
                        });
                    }
                }
                self.ports.wait_released(port).await;
                attempt += 1;
                continue;
            }

            self.ports.wait_released(port).await;
            return Err(WmError::WorkerStartupTimeout {
                target: target.display().to_string(),
                attempts: attempt,
            });
        }
    }

    async fn await_ready(&self, proc: &mut WorkerProcess) -> bool {
        let port = proc.port;
        let host = self.worker_host.clone();
        let probe = ExchangeTimeouts {
            connect: self.timeouts.probe_connect,
            io: self.timeouts.probe_connect,
        };
        let poll = Poll::within(self.timeouts.startup, self.timeouts.probe_interval);
        let attempts = poll.run(|_| {
            let alive = proc.is_running();
            let host = host.clone();
            async move {
                if !alive {
                    return Some(false);
                }
                wire::hello(&host, port, probe).await.then_some(true)
            }
        });
        matches!(
            tokio::time::timeout(self.timeouts.startup, attempts).await,
            Ok(Some(true))
        )
    }

    /// stop_server (when `graceful`), grace wait, SIGTERM, wait, SIGKILL.
    async fn stop_process(&self, mut proc: WorkerProcess, graceful: bool) -> Result<()> {
        let port = proc.port;
        let pid = proc.pid();
        let started = Instant::now();

        if graceful {
            let t = ExchangeTimeouts {
                connect: self.timeouts.stop_request,
                io: self.timeouts.stop_request,
            };
            let msg = Request::new(Action::StopServer).to_value();
            match wire::exchange(&self.worker_host, port, &msg, t).await {
                Ok(_) => info!(port, pid, "stop: attempt=stop_server outcome=acknowledged"),
                Err(e) => info!(port, pid, error = %e, "stop: attempt=stop_server outcome=failed"),
            }
            if proc.wait_exit(self.timeouts.stop_grace).await {
                info!(port, pid, elapsed_ms = ms(started.elapsed()), "stop: outcome=grace_exit");
                return Ok(());
            }
        }

        info!(port, pid, "stop: attempt=signal sig=TERM");
        if let Err(e) = proc.terminate() {
            warn!(port, pid, error = %e, "stop: SIGTERM failed");
        }
        if proc.wait_exit(self.timeouts.term_wait).await {
            info!(port, pid, elapsed_ms = ms(started.elapsed()), "stop: outcome=term_exit");
            return Ok(());
        }

        info!(port, pid, "stop: attempt=signal sig=KILL");
        match proc.kill(self.timeouts.term_wait).await {
            Ok(true) => {
                info!(port, pid, elapsed_ms = ms(started.elapsed()), "stop: outcome=killed");
                Ok(())
            }
            Ok(false) | Err(_) => {
                let err = WmError::ProcessTerminationFailure { port, pid };
                error!(port, pid, "stop: outcome=survived {err}");
                Err(err)
            }
        }
    }

    /// Stop the worker on `port` with full escalation. The pool entry and the port are
    /// always released; the error only reports a process that outlived SIGKILL.
    pub async fn terminate_worker(&self, port: u16) -> Result<()> {
        let removed = {
            let mut st = self.lock();
            st.reservations.remove(port);
            st.workers.remove(&port)
        };
        let Some(proc) = removed else {
            return Ok(());
        };
        info!(port, pid = proc.pid(), target = ?proc.target, "terminating worker");
        let res = self.stop_process(proc, true).await;
        self.release_port(port).await;
        res
    }

    /// Forget `port` in both maps, then wait until the OS has let go of it.
    async fn release_port(&self, port: u16) -> bool {
        {
            let mut st = self.lock();
            st.workers.remove(&port);
            st.reservations.remove(port);
        }
        self.ports.wait_released(port).await
    }

    /// Terminate the least recently used worker. Returns its port.
    pub async fn evict_lru(&self) -> Option<u16> {
        let port = {
            let st = self.lock();
            st.workers
                .iter()
                .min_by_key(|(_, w)| w.last_used)
                .map(|(p, _)| *p)
        }?;
        info!(port, "decision=evict-lru");
        if let Err(e) = self.terminate_worker(port).await {
            error!(port, error = %e, "eviction left a stray process");
        }
        Some(port)
    }

    /// Terminate every active worker.
    pub async fn stop_all(&self) {
        let ports: Vec<u16> = {
            let st = self.lock();
            let mut v: Vec<u16> = st.workers.keys().copied().collect();
            v.sort_unstable();
            v
        };
        if ports.is_empty() {
            return;
        }
        info!(count = ports.len(), "decision=stop-all");
        for port in ports {
            if let Err(e) = self.terminate_worker(port).await {
                error!(port, error = %e, "worker survived stop-all");
            }
        }
    }

    /// Forward one request to the worker on `port` and return its raw response.
    pub async fn forward(
        &self,
        info: &WorkerInfo,
        request: &Value,
    ) -> std::result::Result<Value, ProtocolError> {
        wire::exchange(&self.worker_host, info.port, request, self.request_timeouts()).await
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.lock();
        let mut workers: Vec<WorkerSnapshot> = st
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                port: w.port,
                pid: w.pid(),
                binary_path: w.target.clone(),
                idle_ms: ms(w.last_used.elapsed()),
                uptime_ms: ms(w.started_at.elapsed()),
            })
            .collect();
        workers.sort_by_key(|w| w.port);
        PoolSnapshot {
            max_processes: self.max_processes,
            workers,
            reserved: st.reservations.ports(),
        }
    }
}

fn info_of(w: &WorkerProcess, target: &Path) -> WorkerInfo {
    WorkerInfo {
        port: w.port,
        pid: w.pid(),
        binary_path: target.to_path_buf(),
    }
}

/// `<state>.bak`
fn quarantine_path(state: &Path) -> PathBuf {
    let mut s = state.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}
