//! The job driver: dataset → trainer → artifact copy.

use crate::accelerator::AcceleratorProbe;
use crate::artifacts::{copy_artifact, locate_artifact};
use crate::command::{build_training_command, ARTIFACT_SUFFIX};
use crate::dataset::{inputs_from_dir, prepare_dataset, DatasetRequest, PreparedDataset};
use crate::error::{RegistryError, TrainingError, TrainingResult};
use crate::job::{keys, JobId, JobParams, JobRecord, JobState, DEFAULT_CHARACTER_NAME};
use crate::layout::JobLayout;
use crate::progress::{LogSink, ProgressEvent, RegistryLogSink};
use crate::registry::JobRegistry;
use crate::settings::TrainingSettings;
use crate::supervisor::{device_env, run_streaming, ProcessSpec, DEVICE_ENV_VAR};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Drives jobs through `Prepping → Training → Copying → Done`.
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<JobRegistry>,
    settings: Arc<TrainingSettings>,
    layout: JobLayout,
    probe: Arc<dyn AcceleratorProbe>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("jobs", &self.registry.len())
            .field("jobs_root", &self.layout.root())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        registry: Arc<JobRegistry>,
        settings: Arc<TrainingSettings>,
        probe: Arc<dyn AcceleratorProbe>,
    ) -> Self {
        let layout = JobLayout::new(settings.jobs_root.clone());
        Self { registry, settings, layout, probe }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    #[must_use]
    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    #[must_use]
    pub fn probe(&self) -> &Arc<dyn AcceleratorProbe> {
        &self.probe
    }

    /// Register a new job and write its opening log lines.
    ///
    /// The job's raw inputs are expected under `layout().raw_dir(&job_id)`.
    pub fn bootstrap(&self, job_id: JobId, params: JobParams, frame_count: usize) -> TrainingResult<JobId> {
        let base = params.get_or(keys::BASE_MODEL, &self.settings.base_models.default_key).to_string();
        let job_id = self.registry.create(JobRecord::new(job_id, params))?;

        let sink = self.sink(&job_id);
        sink.event(ProgressEvent::Started);
        sink.event(ProgressEvent::BaseModel { base });
        sink.event(ProgressEvent::FrameCount { count: frame_count });
        Ok(job_id)
    }

    /// Run the job to a terminal state.
    ///
    /// Every failure ends here: it is logged to the job and recorded with
    /// [`JobRegistry::set_error`], then returned.
    ///
    /// # Returns
    /// Path of the artifact copied into `ed_lora_dir`
    ///
    /// # Errors
    /// Returns the first error of any stage
    pub async fn run(&self, job_id: &JobId) -> TrainingResult<PathBuf> {
        let sink = self.sink(job_id);
        match self.drive(job_id, &sink).await {
            Ok(artifact) => {
                info!(job_id = %job_id, artifact = %artifact.display(), "Training job finished");
                Ok(artifact)
            }
            Err(e) => {
                let message = e.to_string();
                sink.event(ProgressEvent::Failed { error: message.clone() });
                if let Err(registry_err) = self.registry.set_error(job_id, message) {
                    error!(job_id = %job_id, error = %registry_err, "Could not record job failure");
                }
                error!(job_id = %job_id, error = %e, "Training job failed");
                Err(e)
            }
        }
    }

    /// Spawn [`Pipeline::run`] onto the current runtime.
    pub fn spawn(&self, job_id: JobId) -> tokio::task::JoinHandle<TrainingResult<PathBuf>> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(&job_id).await })
    }

    fn sink(&self, job_id: &JobId) -> RegistryLogSink {
        RegistryLogSink::new(Arc::clone(&self.registry), job_id.clone())
    }

    async fn drive(&self, job_id: &JobId, sink: &RegistryLogSink) -> TrainingResult<PathBuf> {
        let params = self
            .registry
            .get(job_id)
            .map(|job| job.params().clone())
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))?;

        self.registry.set_state(job_id, JobState::Prepping)?;
        let dataset = self.prepare(job_id, &params, sink.clone()).await?;

        let output_dir = self.layout.output_dir(job_id, &self.settings.kohya.output_subdir);
        tokio::fs::create_dir_all(&output_dir).await?;

        let accelerator = self.probe.is_available().await;
        let invocation =
            build_training_command(&params, &dataset.images_dir, &output_dir, &self.settings, accelerator)?;

        let working_dir = self.settings.kohya.working_dir();
        if !working_dir.is_dir() {
            return Err(TrainingError::MissingFile { what: "kohya_ss working directory", path: working_dir });
        }

        self.registry.set_state(job_id, JobState::Training)?;
        sink.event(ProgressEvent::LaunchingTrainer);
        info!(job_id = %job_id, accelerator, precision = %invocation.mixed_precision, "Launching trainer");

        let mut spec = ProcessSpec::new(invocation.program.clone(), invocation.args.clone()).current_dir(working_dir);
        let inherited = std::env::var(DEVICE_ENV_VAR).ok();
        if let Some((key, value)) = device_env(accelerator, inherited.as_deref()) {
            spec = spec.env(key, value);
        }
        let code = run_streaming(&spec, sink).await?;
        if code != 0 {
            return Err(TrainingError::TrainerExit { code });
        }

        let source = locate_artifact(&output_dir, &invocation.artifact_stem, ARTIFACT_SUFFIX)?;
        self.registry.set_state(job_id, JobState::Copying)?;

        let file_name = source.file_name().map(ToOwned::to_owned).unwrap_or_default();
        let destination = self.settings.ed_lora_dir.join(file_name);
        let destination = copy_artifact(source, destination).await?;
        sink.event(ProgressEvent::Copying { path: destination.clone() });

        self.registry.set_artifact(job_id, destination.clone())?;
        sink.event(ProgressEvent::Done);
        self.registry.set_state(job_id, JobState::Done)?;
        Ok(destination)
    }

    async fn prepare(&self, job_id: &JobId, params: &JobParams, sink: RegistryLogSink) -> TrainingResult<PreparedDataset> {
        let raw_dir = self.layout.raw_dir(job_id);
        let images_dir = self.layout.images_dir(job_id);
        let resolution = params.parse_or(keys::RESOLUTION, self.settings.train.resolution)?;
        let trigger = params.get_or(keys::TRIGGER, &self.settings.trigger_token).to_string();
        let name = params.get_or(keys::NAME, DEFAULT_CHARACTER_NAME).to_string();

        tokio::task::spawn_blocking(move || {
            let request = DatasetRequest { inputs: inputs_from_dir(&raw_dir)?, images_dir, resolution, trigger, name };
            prepare_dataset(&request, &sink)
        })
        .await
        .map_err(|e| TrainingError::Other(e.into()))?
    }
}
