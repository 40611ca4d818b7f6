//! Control server: accepts one client connection at a time and dispatches it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::time as tokio_time;
use tracing::{debug, error, info, warn};

use crate::wm::build_info;
use crate::wm::config::{self, MasterConfig};
use crate::wm::dispatch::Dispatcher;
use crate::wm::error::ProtocolError;
use crate::wm::ports::is_port_free;
use crate::wm::reclaim::{self, PortReclaimer};
use crate::wm::retry::Poll;
use crate::wm::supervisor::Supervisor;
use crate::wm::wire::{self, ExchangeTimeouts, MAX_MESSAGE_BYTES};

/// How long one accept waits before the running flag is re-checked.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ControlServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl ControlServer {
    /// Bind the control port. A stale holder of the port is reclaimed once; a live
    /// workermaster is never touched.
    pub async fn bind(
        cfg: &MasterConfig,
        supervisor: Arc<Supervisor>,
        reclaimer: Arc<dyn PortReclaimer>,
    ) -> anyhow::Result<Self> {
        let host = cfg.control.host.as_str();
        let port = cfg.control.port;
        if port != 0 && !is_port_free(host, port) {
            let probe = ExchangeTimeouts {
                connect: Duration::from_secs(1),
                io: Duration::from_secs(2),
            };
            if wire::hello(host, port, probe).await {
                anyhow::bail!("workermaster already running (control port {host}:{port} answers hello)");
            }
            warn!(port, reclaimer = reclaimer.name(), "control port busy; decision=reclaim");
            match tokio::task::spawn_blocking(move || reclaimer.reclaim(port)).await {
                Ok(Ok(n)) => info!(port, killed = n, "control port reclaim finished"),
                Ok(Err(e)) => warn!(port, error = %e, "control port reclaim failed"),
                Err(e) => warn!(port, error = %e, "control port reclaim task panicked"),
            }
            let h = host.to_string();
            let freed = Poll::new(10, Duration::from_millis(500))
                .until(|| {
                    let h = h.clone();
                    async move { is_port_free(&h, port) }
                })
                .await;
            anyhow::ensure!(freed, "control port {host}:{port} is in use and could not be released");
        }
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind control port {host}:{port}: {e}"))?;
        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(supervisor),
            running: Arc::new(AtomicBool::new(true)),
            request_timeout: cfg.timeouts.control_request,
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Cleared to stop the accept loop (signals, `stop_server`).
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Accept loop. Every exit path closes the control port, then stops all workers.
    pub async fn serve(self) -> anyhow::Result<()> {
        let port = self.local_port().unwrap_or_default();
        info!(port, "control server listening");
        while self.running.load(Ordering::SeqCst) {
            match tokio_time::timeout(ACCEPT_TIMEOUT, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!(error = %e, "accept error");
                    tokio_time::sleep(Duration::from_millis(200)).await;
                }
                Ok(Ok((stream, addr))) => {
                    debug!(%addr, "connection accepted");
                    let started = Instant::now();
                    if let Err(e) = self.handle_connection(stream).await {
                        warn!(%addr, error = %e, "connection error");
                    }
                    debug!(%addr, elapsed_ms = started.elapsed().as_millis() as u64, "connection done");
                }
            }
        }
        let Self {
            listener,
            dispatcher,
            ..
        } = self;
        drop(listener);
        info!(port, "control port closed; decision=stop-all");
        dispatcher.supervisor().stop_all().await;
        info!("shutdown complete");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ProtocolError> {
        let read = tokio_time::timeout(
            self.request_timeout,
            wire::read_message(&mut stream, MAX_MESSAGE_BYTES),
        )
        .await;
        let request = match read {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                let _ = wire::write_message(&mut stream, &wire::protocol_error_envelope(&e)).await;
                return Err(e);
            }
            Err(_) => {
                let e = ProtocolError::Timeout {
                    phase: "reading request",
                    ms: self.request_timeout.as_millis() as u64,
                };
                let _ = wire::write_message(&mut stream, &wire::protocol_error_envelope(&e)).await;
                return Err(e);
            }
        };
        let out = self.dispatcher.handle(request).await;
        let written = wire::write_message(&mut stream, &out.response).await;
        if out.shutdown {
            self.running.store(false, Ordering::SeqCst);
        }
        written
    }
}

fn start_signal_listener_async(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if wait_for_shutdown_signal().await {
            flag.store(false, Ordering::SeqCst);
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> bool {
    use tokio::signal::unix::{SignalKind, signal};
    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(t), Ok(i)) => (t, i),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers");
            return false;
        }
    };
    tokio::select! {
        _ = term.recv() => info!(signal = "TERM", "signal received"),
        _ = int.recv() => info!(signal = "INT", "signal received"),
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> bool {
    let got = tokio::signal::ctrl_c().await.is_ok();
    if got {
        info!(signal = "INT", "signal received");
    }
    got
}

/// Daemon entry point: validate, build the pool, serve until stopped.
pub async fn run_daemon_async(cfg: MasterConfig) -> anyhow::Result<()> {
    config::validate(&cfg)?;
    config::validate_for_daemon(&cfg)?;
    let build = build_info::BuildInfo::current();
    info!(
        build_time = build.time_raw,
        build_host = build.host,
        git_rev = build.git_rev,
        config = ?cfg.source,
        "{}",
        build_info::banner()
    );

    let reclaimer = reclaim::platform_reclaimer();
    let (first, last) = cfg.workers.port_range();
    info!(
        control_port = cfg.control.port,
        worker_ports = %format!("{first}-{last}"),
        max_processes = cfg.workers.max_processes,
        reclaimer = reclaimer.name(),
        "starting"
    );
    let supervisor = Arc::new(Supervisor::new(&cfg, Arc::clone(&reclaimer))?);
    let server = ControlServer::bind(&cfg, supervisor, reclaimer).await?;
    start_signal_listener_async(server.running_flag());
    server.serve().await
}
