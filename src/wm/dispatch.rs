//! Routes control-plane requests to the worker bound to their target.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::wm::supervisor::Supervisor;
use crate::wm::wire::{self, Action};

/// What the control server should do after replying.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub response: Value,
    pub shutdown: bool,
}

impl Dispatched {
    fn reply(response: Value) -> Self {
        Self {
            response,
            shutdown: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Handle one request. Every response carries a `success` boolean.
    pub async fn handle(&self, request: Value) -> Dispatched {
        let Some(obj) = request.as_object() else {
            return Dispatched::reply(wire::error_envelope(
                "malformed_payload: request must be a JSON object",
            ));
        };
        let Some(action_name) = obj.get("action").and_then(Value::as_str) else {
            return Dispatched::reply(wire::error_envelope("action is required"));
        };
        let Some(action) = Action::parse(action_name) else {
            return Dispatched::reply(wire::error_envelope(format!(
                "unknown action: {action_name}"
            )));
        };
        let binary_path = obj
            .get("binary_path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        debug!(%action, binary_path, "dispatch");

        match action {
            Action::StopServer => {
                info!("stop_server received; decision=stop-all");
                self.supervisor.stop_all().await;
                Dispatched {
                    response: json!({"success": true, "message": "all workers stopped; shutting down"}),
                    shutdown: true,
                }
            }
            Action::Status => Dispatched::reply(self.status()),
            // Control-plane liveness when no target is named.
            Action::Hello if binary_path.is_none() => {
                Dispatched::reply(json!({"success": true, "message": "hi"}))
            }
            Action::Hello | Action::GetFunctions | Action::DecompileFunction => {
                let Some(binary_path) = binary_path else {
                    return Dispatched::reply(wire::error_envelope("binary_path is required"));
                };
                if action == Action::DecompileFunction {
                    let address = obj.get("address").and_then(Value::as_str);
                    match address {
                        None => {
                            return Dispatched::reply(wire::error_envelope("address is required"));
                        }
                        Some(a) if wire::parse_address(a).is_none() => {
                            return Dispatched::reply(wire::error_envelope(format!(
                                "invalid address: {a}"
                            )));
                        }
                        Some(_) => {}
                    }
                }
                Dispatched::reply(self.forward(Path::new(binary_path), &request).await)
            }
        }
    }

    async fn forward(&self, target: &Path, request: &Value) -> Value {
        let info = match self.supervisor.ensure_worker(target).await {
            Ok(info) => info,
            Err(e) => {
                warn!(target = %target.display(), error = %e, "no worker for target");
                return wire::error_envelope(format!("{}: {e}", e.kind()));
            }
        };
        match self.supervisor.forward(&info, request).await {
            Ok(resp) => wire::normalize_response(resp),
            Err(e) => {
                warn!(port = info.port, pid = info.pid, error = %e, "worker exchange failed");
                wire::protocol_error_envelope(&e)
            }
        }
    }

    fn status(&self) -> Value {
        let snap = self.supervisor.snapshot();
        let (first, last) = self.supervisor.port_range();
        json!({
            "success": true,
            "max_processes": snap.max_processes,
            "port_range": [first, last],
            "workers": snap.workers,
            "reserved": snap.reserved,
        })
    }
}
