//! Charlora Training
//!
//! The job orchestration core of the one-click character LoRA service:
//! - Tracking jobs in a shared, lock-protected registry (`JobRegistry`)
//! - Preparing a kohya_ss style dataset from reference images
//! - Building the external trainer invocation (`build_training_command`)
//! - Supervising the trainer subprocess and streaming its output
//! - Driving a job from dataset prep to the copied artifact (`Pipeline`)

pub mod accelerator;
pub mod artifacts;
pub mod command;
pub mod dataset;
pub mod error;
pub mod job;
pub mod layout;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod supervisor;

pub use accelerator::{AcceleratorProbe, FixedAccelerator};
pub use artifacts::{copy_artifact, latest_candidate, locate_artifact};
pub use command::{build_training_command, render_artifact_stem, TrainerInvocation, ARTIFACT_SUFFIX};
pub use dataset::{prepare_dataset, DatasetInput, DatasetRequest, PreparedDataset};
pub use error::{RegistryError, TrainingError, TrainingResult};
pub use job::{JobId, JobParams, JobRecord, JobSnapshot, JobState};
pub use layout::JobLayout;
pub use pipeline::Pipeline;
pub use progress::{LogSink, ProgressEvent, RegistryLogSink};
pub use registry::JobRegistry;
pub use settings::{BaseModels, KohyaSettings, TrainDefaults, TrainingSettings};
pub use supervisor::{run_streaming, ProcessSpec};
