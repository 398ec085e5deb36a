//! Runs the external trainer and streams its output into a job log.

use crate::error::{TrainingError, TrainingResult};
use crate::progress::LogSink;
use std::io::{BufRead, Read};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Device selection variable inherited by the trainer.
pub const DEVICE_ENV_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// A process to launch.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, ..Self::default() }
    }

    #[must_use]
    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Device environment for the trainer.
///
/// With an accelerator the inherited `CUDA_VISIBLE_DEVICES` is kept when it is
/// non-empty, otherwise device `0` is selected. Without one nothing is set.
pub fn device_env(accelerator: bool, inherited: Option<&str>) -> Option<(String, String)> {
    if !accelerator {
        return None;
    }
    let devices = inherited.map(str::trim).filter(|v| !v.is_empty()).unwrap_or("0");
    Some((DEVICE_ENV_VAR.to_string(), devices.to_string()))
}

/// Spawn `spec` and stream its combined output into `sink`.
///
/// stdout and stderr share one pipe, so lines reach the sink in exactly the
/// order the process wrote them. Lines are decoded leniently and stripped of
/// trailing whitespace. The exit status is awaited once the pipe closes.
///
/// # Arguments
/// * `spec` - Program, arguments, working directory and extra environment
/// * `sink` - Receives every output line as soon as it is read
///
/// # Returns
/// The exit code, or `-1` when the process was killed by a signal
///
/// # Errors
/// Returns [`TrainingError::Spawn`] if the program cannot be started
pub async fn run_streaming(spec: &ProcessSpec, sink: &dyn LogSink) -> TrainingResult<i32> {
    let (reader, writer) = std::io::pipe()?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer.try_clone()?))
        .stderr(Stdio::from(writer))
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let spawned = cmd.spawn();
    // The command owns the parent's write ends; the pipe only reaches EOF once they close.
    drop(cmd);
    let mut child = spawned.map_err(|source| TrainingError::Spawn { program: spec.program.clone(), source })?;
    debug!(program = %spec.program, pid = ?child.id(), "Spawned process");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pump = tokio::task::spawn_blocking(move || pump_lines(reader, &tx));
    while let Some(line) = rx.recv().await {
        sink.line(line);
    }
    if let Err(e) = pump.await {
        warn!(error = %e, "Output reader task failed");
    }

    let status = child.wait().await?;
    let code = status.code().unwrap_or(-1);
    debug!(program = %spec.program, code, "Process exited");
    Ok(code)
}

fn pump_lines(reader: impl Read, tx: &mpsc::UnboundedSender<String>) {
    let mut reader = std::io::BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).trim_end().to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}
