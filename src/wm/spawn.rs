//! Launching worker processes from the configured argv template.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::wm::config::WorkersConfig;
use crate::wm::error::{Result, WmError};
use crate::wm::proc::WorkerProcess;

/// Program plus argument template; placeholders are substituted per element.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub script: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn from_config(w: &WorkersConfig) -> Result<Self> {
        let program = w.program.clone().ok_or_else(|| {
            WmError::Config("no worker program configured (workers.program or IDAPATH)".into())
        })?;
        Ok(Self {
            program,
            args: w.args.clone(),
            script: w.script.clone(),
            log_dir: w.log_dir.clone(),
        })
    }

    /// Expand `{port}`, `{target}` and `{script}` in every template element.
    pub fn render_args(&self, port: u16, target: &Path) -> Vec<String> {
        let port_s = port.to_string();
        let target_s = target.to_string_lossy();
        let script_s = self
            .script
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.args
            .iter()
            .map(|a| {
                a.replace("{port}", &port_s)
                    .replace("{target}", &target_s)
                    .replace("{script}", &script_s)
            })
            .collect()
    }

    fn stdio_for(&self, port: u16) -> Result<(Stdio, Stdio)> {
        let Some(dir) = self.log_dir.as_deref() else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("worker-{port}.log"));
        let out = OpenOptions::new().create(true).append(true).open(&path)?;
        let err = out.try_clone()?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }

    /// Start the worker for `target` on `port`. No shell is involved.
    pub fn launch(&self, port: u16, target: &Path) -> Result<WorkerProcess> {
        let args = self.render_args(port, target);
        let (stdout, stderr) = self.stdio_for(port)?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        debug!(port, program = %self.program.display(), ?args, "launching worker");
        let child = cmd.spawn().map_err(|e| {
            WmError::Spawn(format!("{}: {e}", self.program.display()))
        })?;
        let proc = WorkerProcess::new(port, child)?;
        info!(port, pid = proc.pid(), target = %target.display(), "worker launched");
        Ok(proc)
    }
}
