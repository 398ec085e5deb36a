//! Shared test utilities for Charlora integration tests.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use charlora_core::config::Config;
use charlora_core::{DiagnosticsProbe, JobService, NvidiaSmiProbe, Submission, UploadedFile};
use charlora_training::{FixedAccelerator, JobId, JobRegistry, JobSnapshot};
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

/// Stands in for `accelerate`: run as `sh launch <script> --flags...`.
pub const FAKE_TRAINER: &str = r#"
out=""; name=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output_dir) out="$2"; shift 2 ;;
    --output_name) name="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "epoch 1/1"
printf 'weights' > "$out/$name.safetensors"
"#;

pub struct TestEnv {
    pub temp: TempDir,
    pub config: Config,
}

impl TestEnv {
    /// A configuration rooted in a fresh temp dir, with a fake kohya_ss install.
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let kohya_dir = root.join("kohya");
        std::fs::create_dir_all(&kohya_dir).unwrap();
        std::fs::write(kohya_dir.join("train_network.py"), "# stand-in").unwrap();
        std::fs::write(kohya_dir.join("launch"), FAKE_TRAINER).unwrap();
        std::fs::create_dir_all(root.join("models")).unwrap();
        std::fs::write(root.join("models/ds8.safetensors"), "base").unwrap();

        let yaml = format!(
            r"
jobs_root: {root}/jobs
ed_lora_dir: {root}/ed_lora
trigger_token: svtchar
base_model:
  use: ds8
  ds8: {root}/models/ds8.safetensors
kohya:
  accelerate_bin: sh
  script_path: {root}/kohya/train_network.py
  workspace: {root}/kohya
  accelerate_config_path: {root}/accelerate/default_config.yaml
ssh:
  host: trainer.local
",
            root = root.display()
        );
        let config_path = root.join("config.yaml");
        std::fs::write(&config_path, yaml).unwrap();
        let config = Config::load(&config_path).unwrap();
        Self { temp, config }
    }

    pub fn service(&self) -> JobService {
        let diagnostics = DiagnosticsProbe::new(
            self.temp.path(),
            NvidiaSmiProbe::new("/nonexistent/nvidia-smi", vec![]),
            self.config.training.kohya.accelerate_config_path.clone(),
        );
        JobService::new(self.config.clone(), Arc::new(FixedAccelerator(false))).with_diagnostics(diagnostics)
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::from_pixel(width, height, Rgb([30, 160, 220])).write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn uploads(count: usize) -> Vec<UploadedFile> {
    (0..count)
        .map(|idx| UploadedFile { filename: Some(format!("shot_{idx}.png")), bytes: png_bytes(48, 32) })
        .collect()
}

pub fn submission(name: &str, files: usize) -> Submission {
    Submission {
        name: name.to_string(),
        trigger: "svtchar".to_string(),
        base_model: "ds8".to_string(),
        resolution: 64,
        network_dim: 8,
        steps: 10,
        unet_only: "true".to_string(),
        files: uploads(files),
    }
}

/// Poll until the job is `done` or `error`.
pub async fn wait_for_terminal(registry: &JobRegistry, job_id: &JobId) -> JobSnapshot {
    for _ in 0..600 {
        let snapshot = registry.snapshot(job_id).unwrap();
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {job_id} did not finish");
}
