use crate::job::JobId;
use crate::registry::JobRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// User-facing milestones written to a job's log.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started,
    BaseModel { base: String },
    FrameCount { count: usize },
    PreparingDataset,
    DatasetReady,
    LaunchingTrainer,
    Copying { path: PathBuf },
    Done,
    Failed { error: String },
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => f.write_str("🚀 Starting one-click pipeline…"),
            Self::BaseModel { base } => write!(f, "Base model: {base}"),
            Self::FrameCount { count } => write!(f, "Frames: {count}"),
            Self::PreparingDataset => f.write_str("📦 Preparing images…"),
            Self::DatasetReady => f.write_str("✅ Dataset prepared"),
            Self::LaunchingTrainer => f.write_str("🚀 Launching kohya_ss…"),
            Self::Copying { path } => write!(f, "📁 Copying to {}", path.display()),
            Self::Done => f.write_str("✅ Done! Use weight 0.7–0.85 in Easy Diffusion."),
            Self::Failed { error } => write!(f, "❌ Error: {error}"),
        }
    }
}

/// Destination for log lines produced while a job runs.
pub trait LogSink: Send + Sync {
    fn line(&self, line: String);

    fn event(&self, event: ProgressEvent) {
        self.line(event.to_string());
    }
}

/// Appends lines to one job's record in the registry.
#[derive(Debug, Clone)]
pub struct RegistryLogSink {
    registry: Arc<JobRegistry>,
    job_id: JobId,
}

impl RegistryLogSink {
    #[must_use]
    pub fn new(registry: Arc<JobRegistry>, job_id: JobId) -> Self {
        Self { registry, job_id }
    }
}

impl LogSink for RegistryLogSink {
    fn line(&self, line: String) {
        if let Err(e) = self.registry.append_log(&self.job_id, line) {
            warn!(job_id = %self.job_id, error = %e, "Dropped job log line");
        }
    }
}

/// Collects lines in memory, for unit tests that drive a stage without a registry.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryLogSink {
    lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryLogSink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
impl LogSink for MemoryLogSink {
    fn line(&self, line: String) {
        self.lines.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobParams, JobRecord};

    #[test]
    fn test_event_lines() {
        assert_eq!(ProgressEvent::BaseModel { base: "ds8".into() }.to_string(), "Base model: ds8");
        assert_eq!(ProgressEvent::FrameCount { count: 8 }.to_string(), "Frames: 8");
        assert_eq!(ProgressEvent::Failed { error: "x".into() }.to_string(), "❌ Error: x");
    }

    #[test]
    fn test_registry_sink_appends_in_order() {
        let registry = Arc::new(JobRegistry::new());
        let job_id = registry.create(JobRecord::new(JobId::from("sink"), JobParams::new())).unwrap();
        let sink = RegistryLogSink::new(Arc::clone(&registry), job_id.clone());

        sink.event(ProgressEvent::Started);
        sink.line("raw output".to_string());

        let logs = registry.snapshot(&job_id).unwrap().logs;
        assert_eq!(logs, vec!["🚀 Starting one-click pipeline…".to_string(), "raw output".to_string()]);
    }

    #[test]
    fn test_registry_sink_ignores_unknown_job() {
        let registry = Arc::new(JobRegistry::new());
        let sink = RegistryLogSink::new(Arc::clone(&registry), JobId::from("ghost"));
        sink.line("lost".to_string());
        assert!(registry.is_empty());
    }
}
