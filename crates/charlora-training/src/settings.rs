//! Static settings consumed by the pipeline.
//!
//! These types deserialize directly from the service configuration file; every
//! field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_TRIGGER_TOKEN: &str = "svtchar";
pub const DEFAULT_BASE_MODEL: &str = "ds8";
pub const DEFAULT_ARTIFACT_TEMPLATE: &str = "{name}_lora_{base}_v1";

const KOHYA_ROOT_CANDIDATES: &[&str] = &["/opt/kohya_ss", "/workspace/sd-scripts", "/sd-scripts"];

/// Hyperparameter defaults, used when a job does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainDefaults {
    pub resolution: u32,
    pub steps: u32,
    pub network_dim: u32,
    pub unet_only: bool,
    pub lr_unet: f64,
    pub lr_text: f64,
    pub noise_offset: f64,
    pub caption_dropout: f64,
    pub save_every: u32,
    pub min_snr_gamma: f64,
    pub train_batch_size: u32,
    pub mixed_precision: String,
}

impl Default for TrainDefaults {
    fn default() -> Self {
        Self {
            resolution: 512,
            steps: 2500,
            network_dim: 32,
            unet_only: true,
            lr_unet: 1e-4,
            lr_text: 5e-5,
            noise_offset: 0.05,
            caption_dropout: 0.1,
            save_every: 500,
            min_snr_gamma: 5.0,
            train_batch_size: 1,
            mixed_precision: "bf16".to_string(),
        }
    }
}

/// Location and conventions of the external kohya_ss trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KohyaSettings {
    pub accelerate_bin: String,
    pub script_path: PathBuf,
    /// Working directory for the trainer; the script's directory when unset.
    pub workspace: Option<PathBuf>,
    pub output_subdir: String,
    pub network_module: String,
    pub artifact_template: String,
    /// Accelerate config rewritten before each launch; skipped when unset.
    pub accelerate_config_path: Option<PathBuf>,
}

impl KohyaSettings {
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.workspace.clone().unwrap_or_else(|| {
            self.script_path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }
}

impl Default for KohyaSettings {
    fn default() -> Self {
        let root = default_kohya_root();
        Self {
            accelerate_bin: std::env::var("ACCELERATE_BIN").unwrap_or_else(|_| "accelerate".to_string()),
            script_path: root.join("train_network.py"),
            workspace: Some(root),
            output_subdir: "output".to_string(),
            network_module: "lycoris.kohya".to_string(),
            artifact_template: DEFAULT_ARTIFACT_TEMPLATE.to_string(),
            accelerate_config_path: dirs::home_dir()
                .map(|home| home.join(".cache/huggingface/accelerate/default_config.yaml")),
        }
    }
}

/// `KOHYA_ROOT`, else the first well-known install that exists, else `~/kohya_ss`.
#[must_use]
pub fn default_kohya_root() -> PathBuf {
    if let Ok(root) = std::env::var("KOHYA_ROOT") {
        if !root.trim().is_empty() {
            return PathBuf::from(root);
        }
    }
    let home_install = dirs::home_dir().unwrap_or_default().join("kohya_ss");
    KOHYA_ROOT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .chain(std::iter::once(home_install.clone()))
        .find(|candidate| candidate.exists())
        .unwrap_or(home_install)
}

/// Base checkpoints selectable by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModels {
    #[serde(rename = "use", default = "default_base_model_key")]
    pub default_key: String,
    #[serde(flatten)]
    pub paths: BTreeMap<String, PathBuf>,
}

fn default_base_model_key() -> String {
    DEFAULT_BASE_MODEL.to_string()
}

impl BaseModels {
    pub fn resolve(&self, key: &str) -> Option<&Path> {
        self.paths.get(key).map(PathBuf::as_path)
    }

    fn builtin_paths() -> BTreeMap<String, PathBuf> {
        let models = PathBuf::from("models");
        BTreeMap::from([
            ("ds8".to_string(), models.join("dreamshaper_8.safetensors")),
            ("sd15".to_string(), models.join("v1-5-pruned-emaonly.safetensors")),
        ])
    }
}

impl Default for BaseModels {
    fn default() -> Self {
        Self { default_key: default_base_model_key(), paths: Self::builtin_paths() }
    }
}

/// Everything the pipeline reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Parent of the per-job working directories.
    pub jobs_root: PathBuf,
    /// Destination of finished artifacts.
    pub ed_lora_dir: PathBuf,
    pub trigger_token: String,
    #[serde(rename = "base_model")]
    pub base_models: BaseModels,
    pub train: TrainDefaults,
    pub kohya: KohyaSettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            jobs_root: PathBuf::from("data").join("jobs"),
            ed_lora_dir: PathBuf::from("artifacts").join("ed_lora"),
            trigger_token: DEFAULT_TRIGGER_TOKEN.to_string(),
            base_models: BaseModels::default(),
            train: TrainDefaults::default(),
            kohya: KohyaSettings::default(),
        }
    }
}

impl TrainingSettings {
    /// A `base_model` section that names no paths gets the built-in ones.
    pub fn fill_missing_base_models(&mut self) {
        if self.base_models.paths.is_empty() {
            self.base_models.paths = BaseModels::builtin_paths();
        }
    }

    /// Apply `f` to every filesystem path in the settings.
    pub fn map_paths(&mut self, mut f: impl FnMut(&Path) -> PathBuf) {
        self.jobs_root = f(self.jobs_root.as_path());
        self.ed_lora_dir = f(self.ed_lora_dir.as_path());
        for path in self.base_models.paths.values_mut() {
            *path = f(path.as_path());
        }
        self.kohya.script_path = f(self.kohya.script_path.as_path());
        if let Some(workspace) = self.kohya.workspace.as_mut() {
            *workspace = f(workspace.as_path());
        }
        if let Some(accel) = self.kohya.accelerate_config_path.as_mut() {
            *accel = f(accel.as_path());
        }
    }
}
