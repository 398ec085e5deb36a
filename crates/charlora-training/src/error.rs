use crate::job::{JobId, JobState};
use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Failures of registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition { job_id: JobId, from: JobState, to: JobState },

    #[error("job {job_id} already has an artifact")]
    ArtifactAlreadySet { job_id: JobId },

    #[error("job {job_id} is already {state}")]
    Terminal { job_id: JobId, state: JobState },
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("base model '{0}' is not configured")]
    UnknownBaseModel(String),

    #[error("{what} not found: {}", .path.display())]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("invalid value for parameter '{key}': {value:?}")]
    InvalidParam { key: String, value: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kohya_ss exited with code {code}")]
    TrainerExit { code: i32 },

    #[error("training artifact not found after kohya_ss finished ({stem}*{suffix} in {})", .dir.display())]
    ArtifactNotFound { stem: String, suffix: String, dir: PathBuf },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
