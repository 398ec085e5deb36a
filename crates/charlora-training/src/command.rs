//! Construction of the kohya_ss `train_network.py` invocation.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{keys, JobParams, DEFAULT_CHARACTER_NAME};
use crate::layout::path_component;
use crate::settings::TrainingSettings;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension of the trained network weights.
pub const ARTIFACT_SUFFIX: &str = ".safetensors";
/// Extension of the caption sidecars written next to dataset images.
pub const CAPTION_EXTENSION: &str = ".txt";
/// Precision mode used when no accelerator is available.
pub const NO_MIXED_PRECISION: &str = "no";

pub const GPU_IDS_FLAG: &str = "--gpu_ids";
pub const UNET_ONLY_FLAG: &str = "--network_train_unet_only";
pub const TEXT_ENCODER_LR_FLAG: &str = "--text_encoder_lr";

/// A fully resolved trainer launch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Artifact base name passed as `--output_name`.
    pub artifact_stem: String,
    /// `<output_dir>/<stem>.safetensors`.
    pub expected_artifact: PathBuf,
    pub mixed_precision: String,
}

impl TrainerInvocation {
    /// Program followed by its arguments.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

/// Precision handed to the trainer: the configured mode with an accelerator, `no` without.
pub fn mixed_precision_for(configured: &str, accelerator: bool) -> &str {
    if accelerator { configured } else { NO_MIXED_PRECISION }
}

/// Substitute `{name}` and `{base}` into the artifact template.
///
/// Both values are reduced to a single path component first, so the stem can
/// be joined onto the output directory without escaping it.
pub fn render_artifact_stem(template: &str, name: &str, base: &str) -> String {
    let name = path_component(name).unwrap_or_else(|| DEFAULT_CHARACTER_NAME.to_string());
    let base = path_component(base).unwrap_or_default();
    template.replace("{name}", &name).replace("{base}", &base)
}

/// Build the trainer command for one job.
///
/// Also rewrites the accelerate config (when a path is configured) so that it
/// agrees with the precision on the command line. That write is best-effort.
///
/// # Arguments
/// * `params` - Job parameters; absent values fall back to `settings`
/// * `images_dir` - Parent of the concept folder, passed as `--train_data_dir`
/// * `output_dir` - Where the trainer writes checkpoints and the final weights
/// * `settings` - Base models, kohya_ss locations and hyperparameter defaults
/// * `accelerator` - Whether a GPU was detected for this launch
///
/// # Returns
/// The argv plus the artifact stem and the path the weights are expected at
///
/// # Errors
/// Returns `UnknownBaseModel` if the base model key is not configured,
/// `MissingFile` if the model or the training script is missing, and
/// `InvalidParam` if a numeric parameter does not parse
pub fn build_training_command(
    params: &JobParams,
    images_dir: &Path,
    output_dir: &Path,
    settings: &TrainingSettings,
    accelerator: bool,
) -> TrainingResult<TrainerInvocation> {
    let base_key = params.get_or(keys::BASE_MODEL, &settings.base_models.default_key);
    let base_path = settings
        .base_models
        .resolve(base_key)
        .ok_or_else(|| TrainingError::UnknownBaseModel(base_key.to_string()))?;
    if !base_path.exists() {
        return Err(TrainingError::MissingFile { what: "base model file", path: base_path.to_path_buf() });
    }

    let kohya = &settings.kohya;
    if !kohya.script_path.exists() {
        return Err(TrainingError::MissingFile {
            what: "kohya_ss train_network.py",
            path: kohya.script_path.clone(),
        });
    }

    let train = &settings.train;
    let name = params.get_or(keys::NAME, DEFAULT_CHARACTER_NAME);
    let resolution: u32 = params.parse_or(keys::RESOLUTION, train.resolution)?;
    let steps: u32 = params.parse_or(keys::STEPS, train.steps)?;
    let network_dim: u32 = params.parse_or(keys::NETWORK_DIM, train.network_dim)?;
    let unet_only = params.flag_or(keys::UNET_ONLY, train.unet_only);

    let mixed_precision = mixed_precision_for(&train.mixed_precision, accelerator).to_string();
    if let Some(path) = kohya.accelerate_config_path.as_deref() {
        write_accelerate_config(path, &mixed_precision, accelerator);
    }

    let artifact_stem = render_artifact_stem(&kohya.artifact_template, name, base_key);
    let expected_artifact = output_dir.join(format!("{artifact_stem}{ARTIFACT_SUFFIX}"));

    let mut args = vec!["launch".to_string()];
    if accelerator {
        args.extend([GPU_IDS_FLAG.to_string(), "0".to_string()]);
    }
    args.push(kohya.script_path.display().to_string());

    let mut flag = |name: &str, value: String| {
        args.push(name.to_string());
        args.push(value);
    };
    flag("--pretrained_model_name_or_path", base_path.display().to_string());
    flag("--train_data_dir", images_dir.display().to_string());
    flag("--resolution", format!("{resolution},{resolution}"));
    flag("--network_module", kohya.network_module.clone());
    flag("--network_dim", network_dim.to_string());
    flag("--output_dir", output_dir.display().to_string());
    flag("--output_name", artifact_stem.clone());
    flag("--max_train_steps", steps.to_string());
    flag("--save_every_n_steps", train.save_every.to_string());
    flag("--learning_rate", train.lr_unet.to_string());
    flag("--train_batch_size", train.train_batch_size.to_string());
    flag("--noise_offset", train.noise_offset.to_string());
    flag("--caption_dropout_rate", train.caption_dropout.to_string());
    flag("--min_snr_gamma", train.min_snr_gamma.to_string());
    flag("--mixed_precision", mixed_precision.clone());
    flag("--caption_extension", CAPTION_EXTENSION.to_string());

    if unet_only {
        args.push(UNET_ONLY_FLAG.to_string());
    } else if train.lr_text > 0.0 {
        args.extend([TEXT_ENCODER_LR_FLAG.to_string(), train.lr_text.to_string()]);
    }

    Ok(TrainerInvocation {
        program: kohya.accelerate_bin.clone(),
        args,
        artifact_stem,
        expected_artifact,
        mixed_precision,
    })
}

/// Single-process accelerate config matching the chosen device and precision.
pub fn accelerate_config_yaml(mixed_precision: &str, accelerator: bool) -> String {
    format!(
        "compute_environment: LOCAL_MACHINE\n\
         distributed_type: 'NO'\n\
         downcast_bf16: 'no'\n\
         dynamo_backend: 'no'\n\
         machine_rank: 0\n\
         main_process_ip: 127.0.0.1\n\
         main_process_port: 29500\n\
         mixed_precision: {mixed_precision}\n\
         num_machines: 1\n\
         num_processes: 1\n\
         rdzv_backend: static\n\
         same_network: true\n\
         tpu_name: null\n\
         use_cpu: {}\n",
        !accelerator
    )
}

/// Best-effort write; the trainer falls back to its own defaults when this fails.
fn write_accelerate_config(path: &Path, mixed_precision: &str, accelerator: bool) {
    let result = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::write(path, accelerate_config_yaml(mixed_precision, accelerator)));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "Skipped accelerate config write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TrainingSettings;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        settings: TrainingSettings,
        images_dir: PathBuf,
        output_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::write(root.join("ds8.safetensors"), b"weights").unwrap();
        std::fs::write(root.join("train_network.py"), b"# trainer").unwrap();

        let mut settings = TrainingSettings::default();
        settings.base_models.paths.clear();
        settings.base_models.paths.insert("ds8".into(), root.join("ds8.safetensors"));
        settings.base_models.paths.insert("gone".into(), root.join("missing.safetensors"));
        settings.kohya.script_path = root.join("train_network.py");
        settings.kohya.accelerate_config_path = Some(root.join("accelerate/default_config.yaml"));

        Fixture {
            images_dir: root.join("dataset/images"),
            output_dir: root.join("output"),
            settings,
            _temp: temp,
        }
    }

    fn params(unet_only: &str) -> JobParams {
        JobParams::new()
            .with(keys::NAME, "aria")
            .with(keys::BASE_MODEL, "ds8")
            .with(keys::RESOLUTION, "768")
            .with(keys::STEPS, "1200")
            .with(keys::NETWORK_DIM, "16")
            .with(keys::UNET_ONLY, unet_only)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(String::as_str)
    }

    #[test]
    fn test_cpu_command_has_no_gpu_flags_and_no_precision() {
        let fx = fixture();
        let inv = build_training_command(&params("true"), &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap();

        assert!(!inv.args.iter().any(|a| a == GPU_IDS_FLAG));
        assert_eq!(inv.mixed_precision, "no");
        assert_eq!(value_after(&inv.args, "--mixed_precision"), Some("no"));

        let accel = std::fs::read_to_string(fx.settings.kohya.accelerate_config_path.as_ref().unwrap()).unwrap();
        assert!(accel.contains("mixed_precision: no"));
        assert!(accel.contains("use_cpu: true"));
    }

    #[test]
    fn test_gpu_command_selects_device_and_configured_precision() {
        let fx = fixture();
        let inv = build_training_command(&params("true"), &fx.images_dir, &fx.output_dir, &fx.settings, true).unwrap();

        assert_eq!(inv.args[0], "launch");
        assert_eq!(&inv.args[1..3], &["--gpu_ids".to_string(), "0".to_string()]);
        assert_eq!(inv.args[3], fx.settings.kohya.script_path.display().to_string());
        assert_eq!(value_after(&inv.args, "--mixed_precision"), Some("bf16"));
    }

    #[test]
    fn test_command_carries_job_parameters() {
        let fx = fixture();
        let inv = build_training_command(&params("true"), &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap();

        assert_eq!(inv.program, fx.settings.kohya.accelerate_bin);
        assert_eq!(value_after(&inv.args, "--resolution"), Some("768,768"));
        assert_eq!(value_after(&inv.args, "--max_train_steps"), Some("1200"));
        assert_eq!(value_after(&inv.args, "--network_dim"), Some("16"));
        assert_eq!(value_after(&inv.args, "--output_name"), Some("aria_lora_ds8_v1"));
        assert_eq!(value_after(&inv.args, "--caption_extension"), Some(".txt"));
        assert_eq!(value_after(&inv.args, "--network_module"), Some("lycoris.kohya"));
        assert_eq!(inv.expected_artifact, fx.output_dir.join("aria_lora_ds8_v1.safetensors"));
    }

    #[test]
    fn test_unet_only_excludes_text_encoder_rate() {
        let fx = fixture();
        let inv = build_training_command(&params("true"), &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap();
        assert!(inv.args.iter().any(|a| a == UNET_ONLY_FLAG));
        assert!(!inv.args.iter().any(|a| a == TEXT_ENCODER_LR_FLAG));
    }

    #[test]
    fn test_full_network_trains_text_encoder() {
        let fx = fixture();
        let inv = build_training_command(&params("false"), &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap();
        assert!(!inv.args.iter().any(|a| a == UNET_ONLY_FLAG));
        assert_eq!(value_after(&inv.args, TEXT_ENCODER_LR_FLAG), Some("0.00005"));
    }

    #[test]
    fn test_zero_text_rate_emits_neither_flag() {
        let mut fx = fixture();
        fx.settings.train.lr_text = 0.0;
        let inv = build_training_command(&params("no"), &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap();
        assert!(!inv.args.iter().any(|a| a == UNET_ONLY_FLAG || a == TEXT_ENCODER_LR_FLAG));
    }

    #[test]
    fn test_unknown_base_model() {
        let fx = fixture();
        let p = params("true").with(keys::BASE_MODEL, "sdxl");
        let err = build_training_command(&p, &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap_err();
        assert!(matches!(err, TrainingError::UnknownBaseModel(ref key) if key == "sdxl"));
    }

    #[test]
    fn test_missing_base_model_file() {
        let fx = fixture();
        let p = params("true").with(keys::BASE_MODEL, "gone");
        let err = build_training_command(&p, &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap_err();
        assert!(matches!(err, TrainingError::MissingFile { what: "base model file", .. }));
    }

    #[test]
    fn test_missing_script() {
        let mut fx = fixture();
        fx.settings.kohya.script_path = PathBuf::from("/nonexistent/train_network.py");
        let err = build_training_command(&params("true"), &fx.images_dir, &fx.output_dir, &fx.settings, false).unwrap_err();
        assert!(matches!(err, TrainingError::MissingFile { .. }));
    }

    #[test]
    fn test_unwritable_accelerate_config_is_ignored() {
        let mut fx = fixture();
        let blocker = fx.output_dir.with_file_name("blocker");
        std::fs::write(&blocker, b"file, not dir").unwrap();
        fx.settings.kohya.accelerate_config_path = Some(blocker.join("default_config.yaml"));

        assert!(build_training_command(&params("true"), &fx.images_dir, &fx.output_dir, &fx.settings, false).is_ok());
    }

    #[test]
    fn test_render_artifact_stem() {
        assert_eq!(render_artifact_stem("{name}_lora_{base}_v1", "aria", "sd15"), "aria_lora_sd15_v1");
        assert_eq!(render_artifact_stem("{name}_lora_{base}_v1", "../../aria", "ds8"), ".._.._aria_lora_ds8_v1");
        assert_eq!(render_artifact_stem("{name}_lora_{base}_v1", " ", "ds8"), "character_lora_ds8_v1");
        assert_eq!(render_artifact_stem("fixed", "aria", "sd15"), "fixed");
    }
}
