//! Process-wide store of job records.
//!
//! Every operation takes the single registry lock for the duration of one
//! read-modify-write. The lock is a plain `std::sync::Mutex` and is never held
//! across an `.await`.

use crate::error::RegistryError;
use crate::job::{JobId, JobRecord, JobSnapshot, JobState};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Registry of all jobs known to this process.
///
/// Records live in memory only and are lost on restart.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry").field("job_count", &self.len()).finish_non_exhaustive()
    }
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        // Mutations are single assignments or pushes, so a poisoned map is still consistent.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut JobRecord) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut jobs = self.lock();
        let record = jobs.get_mut(job_id).ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))?;
        f(record)
    }

    /// Insert a new record. Fails if the id is already taken.
    pub fn create(&self, record: JobRecord) -> RegistryResult<JobId> {
        let job_id = record.job_id.clone();
        match self.lock().entry(job_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateJob(job_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                debug!(job_id = %job_id, "Job created");
                Ok(job_id)
            }
        }
    }

    /// Copy of the record, if it exists.
    pub fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.lock().get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Advance the job along the pipeline order.
    ///
    /// Moving backwards, leaving a terminal state, or entering `Error` (use
    /// [`JobRegistry::set_error`]) is rejected.
    pub fn set_state(&self, job_id: &JobId, state: JobState) -> RegistryResult<()> {
        self.with_job(job_id, |record| {
            if record.state.is_terminal() {
                return Err(RegistryError::Terminal { job_id: job_id.clone(), state: record.state });
            }
            if !record.state.can_advance_to(state) {
                return Err(RegistryError::InvalidTransition {
                    job_id: job_id.clone(),
                    from: record.state,
                    to: state,
                });
            }
            if record.state != state {
                debug!(job_id = %job_id, from = %record.state, to = %state, "Job state changed");
            }
            record.state = state;
            Ok(())
        })
    }

    /// Append one line to the job log. Allowed in every state.
    pub fn append_log(&self, job_id: &JobId, line: impl Into<String>) -> RegistryResult<()> {
        let line = line.into();
        self.with_job(job_id, |record| {
            record.logs.push(line);
            Ok(())
        })
    }

    /// Record the final artifact location. Set at most once, before the job ends.
    pub fn set_artifact(&self, job_id: &JobId, path: PathBuf) -> RegistryResult<()> {
        self.with_job(job_id, |record| {
            if record.state.is_terminal() {
                return Err(RegistryError::Terminal { job_id: job_id.clone(), state: record.state });
            }
            if record.artifact_path.is_some() {
                return Err(RegistryError::ArtifactAlreadySet { job_id: job_id.clone() });
            }
            record.artifact_path = Some(path);
            Ok(())
        })
    }

    /// Record the failure message and force `Error` in one step.
    pub fn set_error(&self, job_id: &JobId, message: impl Into<String>) -> RegistryResult<()> {
        let message = message.into();
        self.with_job(job_id, |record| {
            if record.state.is_terminal() {
                return Err(RegistryError::Terminal { job_id: job_id.clone(), state: record.state });
            }
            debug!(job_id = %job_id, from = %record.state, "Job failed");
            record.error = Some(message);
            record.state = JobState::Error;
            Ok(())
        })
    }

    pub fn snapshot(&self, job_id: &JobId) -> RegistryResult<JobSnapshot> {
        self.lock()
            .get(job_id)
            .map(JobRecord::snapshot)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))
    }

    /// Snapshots of every job, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.lock();
        let mut records: Vec<&JobRecord> = jobs.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        records.into_iter().map(JobRecord::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
