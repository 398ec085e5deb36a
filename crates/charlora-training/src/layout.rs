use crate::error::TrainingResult;
use crate::job::JobId;
use std::path::{Path, PathBuf};

pub const RAW_SUBDIR: &str = "raw";
pub const DATASET_SUBDIR: &str = "dataset";
pub const DATASET_IMAGES_SUBDIR: &str = "images";
pub const CHECKPOINTS_SUBDIR: &str = "checkpoints";

/// Reduce user text to one path component.
///
/// Separators and control characters become `_`, so the result never leaves
/// the directory it is joined onto. Blank names and names made only of dots
/// yield `None`.
#[must_use]
pub fn path_component(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.chars().all(|c| c == '.') { None } else { Some(cleaned) }
}

/// Filesystem layout of per-job working directories.
///
/// Each job owns `<jobs_root>/<job_id>/` exclusively:
/// `raw/` for uploads, `dataset/images/` for the prepared dataset and an
/// output subdirectory for trainer checkpoints.
#[derive(Debug, Clone)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    #[must_use]
    pub fn raw_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join(RAW_SUBDIR)
    }

    #[must_use]
    pub fn dataset_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join(DATASET_SUBDIR)
    }

    #[must_use]
    pub fn images_dir(&self, job_id: &JobId) -> PathBuf {
        self.dataset_dir(job_id).join(DATASET_IMAGES_SUBDIR)
    }

    /// Trainer output directory; an empty subdir name falls back to `checkpoints`.
    #[must_use]
    pub fn output_dir(&self, job_id: &JobId, output_subdir: &str) -> PathBuf {
        let subdir = if output_subdir.trim().is_empty() { CHECKPOINTS_SUBDIR } else { output_subdir };
        self.job_dir(job_id).join(subdir)
    }

    pub fn ensure_raw_dir(&self, job_id: &JobId) -> TrainingResult<PathBuf> {
        let dir = self.raw_dir(job_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
