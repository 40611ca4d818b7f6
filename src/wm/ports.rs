//! Worker port bookkeeping.
//!
//! A port in the configured range is in exactly one of three states: free, reserved
//! (claimed by an in-progress spawn) or active (backing a live worker). Active ports
//! are owned by the supervisor's worker map; this module tracks reservations and
//! talks to the OS.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::wm::reclaim::PortReclaimer;
use crate::wm::retry::Poll;

/// Ports claimed but not yet backing a live worker.
#[derive(Debug)]
pub struct Reservations {
    ttl: Duration,
    entries: HashMap<u16, Instant>,
}

impl Reservations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Drop reservations older than the TTL as of `now`. Returns the purged ports.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<u16> {
        let ttl = self.ttl;
        let mut purged: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= ttl)
            .map(|(p, _)| *p)
            .collect();
        for p in &purged {
            self.entries.remove(p);
        }
        purged.sort_unstable();
        purged
    }

    pub fn insert(&mut self, port: u16, now: Instant) {
        self.entries.insert(port, now);
    }

    pub fn remove(&mut self, port: u16) -> bool {
        self.entries.remove(&port).is_some()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.entries.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut v: Vec<u16> = self.entries.keys().copied().collect();
        v.sort_unstable();
        v
    }
}

/// True when nothing is bound to `host:port` right now.
pub fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

pub struct PortAllocator {
    host: String,
    first: u16,
    last: u16,
    release_poll: Poll,
    reclaimer: Arc<dyn PortReclaimer>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("host", &self.host)
            .field("range", &(self.first..=self.last))
            .field("release_poll", &self.release_poll)
            .field("reclaimer", &self.reclaimer.name())
            .finish()
    }
}

impl PortAllocator {
    pub fn new(
        host: impl Into<String>,
        range: (u16, u16),
        release_poll: Poll,
        reclaimer: Arc<dyn PortReclaimer>,
    ) -> Self {
        Self {
            host: host.into(),
            first: range.0,
            last: range.1,
            release_poll,
            reclaimer,
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.first, self.last)
    }

    /// Reserve the lowest port that is neither reserved, active, nor bound at the OS level.
    ///
    /// Called with the pool lock held; the OS check is a local bind probe.
    pub fn reserve(
        &self,
        reservations: &mut Reservations,
        is_active: impl Fn(u16) -> bool,
        now: Instant,
    ) -> Option<u16> {
        for port in reservations.purge_expired(now) {
            info!(port, "reservation expired");
        }
        for port in self.first..=self.last {
            if reservations.contains(port) || is_active(port) {
                continue;
            }
            if !is_port_free(&self.host, port) {
                debug!(port, "port busy at the OS level, skipping");
                continue;
            }
            reservations.insert(port, now);
            debug!(port, "port reserved");
            return Some(port);
        }
        None
    }

    /// Drop a reservation without waiting; nothing was bound to the port yet.
    pub fn cancel(&self, reservations: &mut Reservations, port: u16) -> bool {
        let dropped = reservations.remove(port);
        if dropped {
            debug!(port, "reservation cancelled");
        }
        dropped
    }

    /// Wait for the OS to report `port` free, reclaiming it forcibly if the poll runs out.
    ///
    /// Bookkeeping is the caller's job. Returns whether the port ended up free.
    pub async fn wait_released(&self, port: u16) -> bool {
        let host = self.host.clone();
        let freed = self
            .release_poll
            .until(|| {
                let host = host.clone();
                async move { is_port_free(&host, port) }
            })
            .await;
        if freed {
            return true;
        }
        warn!(
            port,
            attempts = self.release_poll.attempts,
            reclaimer = self.reclaimer.name(),
            "port still busy after release window; decision=reclaim"
        );
        let reclaimer = Arc::clone(&self.reclaimer);
        let killed = tokio::task::spawn_blocking(move || reclaimer.reclaim(port)).await;
        match killed {
            Ok(Ok(n)) => info!(port, killed = n, "reclaim finished"),
            Ok(Err(e)) => warn!(port, error = %e, "reclaim failed"),
            Err(e) => warn!(port, error = %e, "reclaim task panicked"),
        }
        // Give a SIGKILLed holder a moment to let go.
        let settle = Poll::new(5, Duration::from_millis(200));
        let host = self.host.clone();
        let freed = settle
            .until(|| {
                let host = host.clone();
                async move { is_port_free(&host, port) }
            })
            .await;
        if !freed {
            warn!(port, "port could not be reclaimed");
        }
        freed
    }
}
