//! Job submission and status, independent of any transport.

use std::path::PathBuf;
use std::sync::Arc;

use charlora_training::job::keys;
use charlora_training::layout::path_component;
use charlora_training::{
    AcceleratorProbe, JobId, JobParams, JobRegistry, JobSnapshot, Pipeline, TrainingResult,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::diagnostics::{DiagnosticsProbe, GpuDiagnostics};
use crate::error::{CoreError, Result};

pub const CONFIG_TEST_MESSAGE: &str = "Environment is ready for training (kohya_ss)";
const FALLBACK_UPLOAD_NAME: &str = "image";

/// One uploaded reference image.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

/// A request to train a character LoRA.
#[derive(Debug, Clone)]
pub struct Submission {
    pub name: String,
    pub trigger: String,
    pub base_model: String,
    pub resolution: u32,
    pub network_dim: u32,
    pub steps: u32,
    pub unet_only: String,
    pub files: Vec<UploadedFile>,
}

/// An accepted submission whose pipeline is running.
#[derive(Debug)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub task: JoinHandle<TrainingResult<PathBuf>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigTestReport {
    pub ok: bool,
    pub ed_lora_dir: PathBuf,
    pub docker: bool,
    pub ssh: bool,
    pub message: String,
}

/// Accepts jobs, stages their inputs and starts their pipelines.
#[derive(Clone, Debug)]
pub struct JobService {
    config: Arc<Config>,
    pipeline: Pipeline,
    diagnostics: DiagnosticsProbe,
}

impl JobService {
    pub fn new(config: Config, probe: Arc<dyn AcceleratorProbe>) -> Self {
        let diagnostics = DiagnosticsProbe::system(config.training.kohya.accelerate_config_path.clone());
        let pipeline = Pipeline::new(Arc::new(JobRegistry::new()), Arc::new(config.training.clone()), probe);
        Self { config: Arc::new(config), pipeline, diagnostics }
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsProbe) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.pipeline.registry()
    }

    /// Validate, store the uploads under the job's `raw/` directory, register
    /// the job and start its pipeline on the current runtime.
    pub async fn submit(&self, submission: Submission) -> Result<SubmittedJob> {
        let name = submission.name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidSubmission("Character name is required".to_string()));
        }
        if path_component(name).as_deref() != Some(name) {
            return Err(CoreError::InvalidSubmission(
                "Character name must not contain path separators".to_string(),
            ));
        }
        let minimum = self.config.min_reference_images;
        if submission.files.len() < minimum {
            return Err(CoreError::InvalidSubmission(format!(
                "At least {minimum} images are required, got {}",
                submission.files.len()
            )));
        }

        let job_id = JobId::new();
        let raw_dir = self.pipeline.layout().ensure_raw_dir(&job_id)?;
        for (idx, file) in submission.files.iter().enumerate() {
            let stored = format!("{idx:03}_{}", sanitize_filename(file.filename.as_deref()));
            tokio::fs::write(raw_dir.join(stored), &file.bytes).await?;
        }

        let trigger = match submission.trigger.trim() {
            "" => self.config.training.trigger_token.as_str(),
            trigger => trigger,
        };
        let base_model = match submission.base_model.trim() {
            "" => self.config.training.base_models.default_key.as_str(),
            base => base,
        };
        let params = JobParams::new()
            .with(keys::NAME, name)
            .with(keys::TRIGGER, trigger)
            .with(keys::BASE_MODEL, base_model)
            .with(keys::RESOLUTION, submission.resolution.to_string())
            .with(keys::NETWORK_DIM, submission.network_dim.to_string())
            .with(keys::STEPS, submission.steps.to_string())
            .with(keys::UNET_ONLY, submission.unet_only.trim());

        let job_id = self.pipeline.bootstrap(job_id, params, submission.files.len())?;
        info!(job_id = %job_id, name, base_model, frames = submission.files.len(), "Job submitted");
        let task = self.pipeline.spawn(job_id.clone());
        Ok(SubmittedJob { job_id, task })
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobSnapshot> {
        self.registry().snapshot(job_id).map_err(|_| CoreError::JobNotFound(job_id.clone()))
    }

    pub fn config_test(&self) -> ConfigTestReport {
        ConfigTestReport {
            ok: true,
            ed_lora_dir: self.config.training.ed_lora_dir.clone(),
            docker: self.config.local_docker,
            ssh: self.config.ssh.host.as_deref().is_some_and(|h| !h.is_empty()),
            message: CONFIG_TEST_MESSAGE.to_string(),
        }
    }

    pub async fn diagnostics(&self) -> GpuDiagnostics {
        self.diagnostics.collect().await
    }
}

/// Final path component of an uploaded file name, or `image`.
pub fn sanitize_filename(name: Option<&str>) -> String {
    name.and_then(|n| n.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or(FALLBACK_UPLOAD_NAME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(Some("frame.png")), "frame.png");
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("C:\\shots\\a.jpg")), "a.jpg");
        assert_eq!(sanitize_filename(Some("dir/")), "image");
        assert_eq!(sanitize_filename(Some("..")), "image");
        assert_eq!(sanitize_filename(None), "image");
    }
}
