use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Well-known parameter keys captured at submission time.
pub mod keys {
    pub const NAME: &str = "name";
    pub const TRIGGER: &str = "trigger";
    pub const BASE_MODEL: &str = "base_model";
    pub const RESOLUTION: &str = "resolution";
    pub const NETWORK_DIM: &str = "network_dim";
    pub const STEPS: &str = "steps";
    pub const UNET_ONLY: &str = "unet_only";
}

/// Character name used when a job carries none.
pub const DEFAULT_CHARACTER_NAME: &str = "character";

/// Identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Pipeline state of a job.
///
/// States advance in declaration order. `Error` is reachable from any
/// non-terminal state, and only through [`crate::JobRegistry::set_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Prepping,
    Training,
    Copying,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepping => "prepping",
            Self::Training => "training",
            Self::Copying => "copying",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Prepping => 0,
            Self::Training => 1,
            Self::Copying => 2,
            Self::Done => 3,
            Self::Error => 4,
        }
    }

    /// Whether a plain state update from `self` to `next` keeps the pipeline order.
    pub fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next != Self::Error && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable string parameters captured when a job is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(BTreeMap<String, String>);

impl JobParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse a parameter, falling back to `default` when it is absent.
    ///
    /// Only type conversion is checked; ranges are left to the operator.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> TrainingResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|_| TrainingError::InvalidParam {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    /// Lenient boolean: true/1/yes/y or false/0/no/n, anything else is `default`.
    pub fn flag_or(&self, key: &str, default: bool) -> bool {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => true,
            "false" | "0" | "no" | "n" => false,
            _ => default,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One pipeline invocation. Owned by the registry; mutated only through it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub(crate) job_id: JobId,
    pub(crate) state: JobState,
    pub(crate) logs: Vec<String>,
    pub(crate) artifact_path: Option<PathBuf>,
    pub(crate) error: Option<String>,
    pub(crate) params: JobParams,
    pub(crate) created_at: DateTime<Utc>,
}

impl JobRecord {
    #[must_use]
    pub fn new(job_id: JobId, params: JobParams) -> Self {
        Self {
            job_id,
            state: JobState::Prepping,
            logs: Vec::new(),
            artifact_path: None,
            error: None,
            params,
            created_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            state: self.state,
            logs: self.logs.clone(),
            artifact_path: self.artifact_path.clone(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time copy of a job, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub logs: Vec<String>,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_is_monotonic() {
        assert!(JobState::Prepping.can_advance_to(JobState::Training));
        assert!(JobState::Training.can_advance_to(JobState::Training));
        assert!(!JobState::Copying.can_advance_to(JobState::Training));
        assert!(!JobState::Done.can_advance_to(JobState::Done));
        assert!(!JobState::Prepping.can_advance_to(JobState::Error));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&JobState::Copying).unwrap();
        assert_eq!(json, "\"copying\"");
    }

    #[test]
    fn test_params_parse_and_flags() {
        let params = JobParams::new()
            .with(keys::STEPS, " 1200 ")
            .with(keys::RESOLUTION, "big")
            .with(keys::UNET_ONLY, "No");

        assert_eq!(params.parse_or(keys::STEPS, 10u32).unwrap(), 1200);
        assert_eq!(params.parse_or(keys::NETWORK_DIM, 32u32).unwrap(), 32);
        assert!(matches!(
            params.parse_or(keys::RESOLUTION, 512u32),
            Err(TrainingError::InvalidParam { .. })
        ));
        assert!(!params.flag_or(keys::UNET_ONLY, true));
    }

    #[test]
    fn test_unrecognised_flag_uses_default() {
        let params = JobParams::new().with(keys::UNET_ONLY, "maybe");
        assert!(params.flag_or(keys::UNET_ONLY, true));
        assert!(!params.flag_or(keys::UNET_ONLY, false));
    }

    #[test]
    fn test_new_record_starts_prepping() {
        let record = JobRecord::new(JobId::from("a"), JobParams::new());
        assert_eq!(record.state(), JobState::Prepping);
        assert!(record.logs().is_empty());
        assert!(record.error().is_none());
    }
}
