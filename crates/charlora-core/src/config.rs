//! Configuration module for the Charlora service.
//!
//! A single YAML file, every field optional. Training-related keys sit at the
//! top level and deserialize straight into [`TrainingSettings`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use charlora_training::TrainingSettings;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

pub const CONFIG_ENV_VAR: &str = "CHARLORA_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_MIN_REFERENCE_IMAGES: usize = 8;

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    /// Upper bound on a whole `/train` request body.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: default_address(), max_upload_bytes: default_max_upload_bytes() }
    }
}

/// Remote training host. Reported by `/config/test`; never connected to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(flatten)]
    pub training: TrainingSettings,
    #[serde(default = "default_min_reference_images")]
    pub min_reference_images: usize,
    #[serde(default = "default_true")]
    pub local_docker: bool,
    #[serde(default)]
    pub ssh: SshConfig,
}

fn default_min_reference_images() -> usize {
    DEFAULT_MIN_REFERENCE_IMAGES
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            training: TrainingSettings::default(),
            min_reference_images: DEFAULT_MIN_REFERENCE_IMAGES,
            local_docker: true,
            ssh: SshConfig::default(),
        }
    }
}

impl Config {
    /// `--config`, else `CHARLORA_CONFIG`, else `./config.yaml`.
    #[must_use]
    pub fn resolve_path(cli: Option<PathBuf>, env: Option<String>) -> PathBuf {
        cli.or_else(|| env.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Parse YAML text without touching paths or the filesystem.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and normalize the file at `path`; a missing file yields defaults.
    pub fn read(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            debug!(path = %path.display(), "Reading configuration file");
            Self::from_yaml_str(&std::fs::read_to_string(path)?)?
        } else {
            info!(path = %path.display(), "No configuration file, using defaults");
            Self::default()
        };
        config.normalize(&|name: &str| std::env::var(name).ok(), dirs::home_dir().as_deref())?;
        Ok(config)
    }

    /// [`Config::read`], then create the job and artifact directories.
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.ensure_dirs()?;
        Ok(config)
    }

    /// Expand variables and `~` in every path, make them absolute and
    /// restore the built-in base models when the file names none.
    pub fn normalize(&mut self, lookup: &dyn Fn(&str) -> Option<String>, home: Option<&Path>) -> Result<()> {
        self.training.fill_missing_base_models();
        let mut failure = None;
        let mut fix = |path: &Path| match normalize_path(path, lookup, home) {
            Ok(normalized) => normalized,
            Err(e) => {
                failure.get_or_insert(e);
                path.to_path_buf()
            }
        };
        self.training.map_paths(&mut fix);
        if let Some(workdir) = self.ssh.workdir.as_mut() {
            *workdir = fix(workdir.as_path());
        }
        failure.map_or(Ok(()), Err)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.training.jobs_root, &self.training.ed_lora_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| CoreError::Config(format!("cannot create {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

/// `$VAR`/`${VAR}` expansion, then leading `~`, then absolutization.
pub fn normalize_path(
    path: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
    home: Option<&Path>,
) -> Result<PathBuf> {
    let expanded = expand_vars(&path.to_string_lossy(), lookup);
    let expanded = expand_home(&expanded, home);
    std::path::absolute(&expanded)
        .map_err(|e| CoreError::Config(format!("invalid path {}: {e}", expanded.display())))
}

/// Replace `$NAME` and `${NAME}` with values from `lookup`. Unknown
/// variables and stray `$` are left as written.
pub fn expand_vars(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            braced.find('}').map_or(("", 0), |end| (&braced[..end], end + 2))
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        let value = if name.is_empty() { None } else { lookup(name) };
        match value {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home.to_path_buf(),
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}
