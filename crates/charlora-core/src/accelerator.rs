//! GPU detection through `nvidia-smi`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use charlora_training::AcceleratorProbe;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

pub const NVIDIA_SMI: &str = "nvidia-smi";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a short diagnostic command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    pub ok: bool,
    pub code: i32,
    /// Combined stdout and stderr, or the launch failure.
    pub out: String,
}

impl CommandReport {
    fn failed(out: impl Into<String>) -> Self {
        Self { ok: false, code: -1, out: out.into() }
    }
}

/// Run `program args`, giving up after `timeout`.
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> CommandReport {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => {
            let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
            out.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandReport { ok: output.status.success(), code: output.status.code().unwrap_or(-1), out }
        }
        Ok(Err(e)) => CommandReport::failed(e.to_string()),
        Err(_) => CommandReport::failed(format!("{program} timed out after {}s", timeout.as_secs_f32())),
    }
}

/// First executable named `name` on `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

/// Lists GPUs with `nvidia-smi -L`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new(NVIDIA_SMI, vec!["-L".to_string()])
    }
}

impl NvidiaSmiProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, timeout: PROBE_TIMEOUT }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn list_devices(&self) -> CommandReport {
        run_command(&self.program, &self.args, self.timeout).await
    }

    /// A successful listing with at least one `GPU ...` line.
    pub fn reports_device(report: &CommandReport) -> bool {
        report.ok && report.out.lines().any(|line| line.trim_start().starts_with("GPU"))
    }
}

#[async_trait]
impl AcceleratorProbe for NvidiaSmiProbe {
    async fn is_available(&self) -> bool {
        let report = self.list_devices().await;
        let available = Self::reports_device(&report);
        debug!(program = %self.program, code = report.code, available, "Probed accelerator");
        available
    }
}
