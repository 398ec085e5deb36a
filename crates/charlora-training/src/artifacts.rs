use crate::error::{TrainingError, TrainingResult};
use std::fs::{File, FileTimes};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Find the artifact the trainer produced.
///
/// The exact `<dir>/<stem><suffix>` wins. Otherwise the lexicographically last
/// file matching `<stem>*<suffix>` is taken; for step-numbered checkpoints
/// that is the latest one.
///
/// # Arguments
/// * `dir` - Trainer output directory
/// * `stem` - Artifact base name handed to the trainer as `--output_name`
/// * `suffix` - Weights extension, including the dot
///
/// # Returns
/// Path of the chosen artifact
///
/// # Errors
/// Returns `ArtifactNotFound` if no file matches
pub fn locate_artifact(dir: &Path, stem: &str, suffix: &str) -> TrainingResult<PathBuf> {
    let exact = dir.join(format!("{stem}{suffix}"));
    if exact.is_file() {
        return Ok(exact);
    }
    latest_candidate(dir, stem, suffix)?.ok_or_else(|| TrainingError::ArtifactNotFound {
        stem: stem.to_string(),
        suffix: suffix.to_string(),
        dir: dir.to_path_buf(),
    })
}

/// Lexicographically last file in `dir` named `<stem>*<suffix>`.
pub fn latest_candidate(dir: &Path, stem: &str, suffix: &str) -> TrainingResult<Option<PathBuf>> {
    let pattern = format!(
        "{}/{}*{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(stem),
        glob::Pattern::escape(suffix)
    );
    let entries = glob::glob(&pattern).map_err(|e| TrainingError::Other(e.into()))?;
    let latest = entries.filter_map(Result::ok).filter(|p| p.is_file()).max();
    debug!(pattern = %pattern, found = ?latest, "Searched for artifact candidates");
    Ok(latest)
}

/// Copy `from` into `to`, creating parent directories and keeping the
/// source's modification and access times.
///
/// # Returns
/// The destination path
///
/// # Errors
/// Returns error if the destination cannot be created or written
pub async fn copy_artifact(from: PathBuf, to: PathBuf) -> TrainingResult<PathBuf> {
    tokio::task::spawn_blocking(move || copy_preserving_times(&from, &to).map(|()| to))
        .await
        .map_err(|e| TrainingError::Other(e.into()))?
}

fn copy_preserving_times(from: &Path, to: &Path) -> TrainingResult<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to)?;
    let meta = std::fs::metadata(from)?;
    let times = FileTimes::new().set_modified(meta.modified()?).set_accessed(meta.accessed()?);
    File::options().write(true).open(to)?.set_times(times)?;
    Ok(())
}
