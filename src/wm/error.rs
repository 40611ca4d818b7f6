//! Error types for workermaster.

use std::io;
use thiserror::Error;

/// Transport-level failure while exchanging one message with a peer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection refused on port {port}")]
    ConnectionRefused { port: u16 },

    #[error("timed out after {ms}ms while {phase}")]
    Timeout { phase: &'static str, ms: u64 },

    #[error("peer closed the connection before sending a complete message")]
    Closed,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Stable kind string used in `{success:false, error}` envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::ConnectionRefused { .. } => "connection_refused",
            ProtocolError::Timeout { .. } => "timeout",
            ProtocolError::Closed => "connection_closed",
            ProtocolError::Malformed(_) => "malformed_payload",
            ProtocolError::TooLarge { .. } => "payload_too_large",
            ProtocolError::Io(_) => "socket_error",
        }
    }
}

/// Main error type for pool, supervisor and control-plane operations.
#[derive(Error, Debug)]
pub enum WmError {
    #[error("no free or evictable worker port in {first}-{last}")]
    PortExhausted { first: u16, last: u16 },

    #[error("worker for {target} did not become ready (attempts={attempts})")]
    WorkerStartupTimeout { target: String, attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("worker pid={pid} on port {port} survived stop_server, SIGTERM and SIGKILL")]
    ProcessTerminationFailure { port: u16, pid: u32 },

    #[error("neither {target} nor its analysis state {state} exists")]
    TargetNotFound { target: String, state: String },

    #[error("failed to launch worker: {0}")]
    Spawn(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WmError {
    /// Stable kind string used in `{success:false, error}` envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            WmError::PortExhausted { .. } => "port_exhausted",
            WmError::WorkerStartupTimeout { .. } => "worker_startup_timeout",
            WmError::Protocol(p) => p.kind(),
            WmError::ProcessTerminationFailure { .. } => "process_termination_failure",
            WmError::TargetNotFound { .. } => "target_not_found",
            WmError::Spawn(_) => "spawn_failed",
            WmError::Config(_) => "invalid_config",
            WmError::Io(_) => "io_error",
        }
    }
}

/// Result type alias for workermaster operations.
pub type Result<T> = std::result::Result<T, WmError>;
