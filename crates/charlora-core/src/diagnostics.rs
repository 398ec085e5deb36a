//! Operator-facing report on GPU visibility inside the service's environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::accelerator::{find_in_path, CommandReport, NvidiaSmiProbe};

const ENV_KEYS: [&str; 2] = ["CUDA_VISIBLE_DEVICES", "NVIDIA_VISIBLE_DEVICES"];

#[derive(Debug, Clone, Serialize)]
pub struct AccelerateConfigReport {
    pub path: Option<PathBuf>,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_yaml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuDiagnostics {
    pub in_docker: bool,
    pub nvidia_devices: Vec<String>,
    pub env: BTreeMap<String, Option<String>>,
    pub has_nvidia_smi: bool,
    pub nvidia_smi: CommandReport,
    pub accelerator_available: bool,
    pub accelerate: AccelerateConfigReport,
    pub suggestions: Vec<String>,
}

/// Collects [`GpuDiagnostics`].
///
/// `root` stands in for `/` so the filesystem checks can be pointed elsewhere.
#[derive(Debug, Clone)]
pub struct DiagnosticsProbe {
    root: PathBuf,
    smi: NvidiaSmiProbe,
    accelerate_config: Option<PathBuf>,
}

impl DiagnosticsProbe {
    pub fn new(root: impl Into<PathBuf>, smi: NvidiaSmiProbe, accelerate_config: Option<PathBuf>) -> Self {
        Self { root: root.into(), smi, accelerate_config }
    }

    /// Probe of the real system.
    pub fn system(accelerate_config: Option<PathBuf>) -> Self {
        Self::new("/", NvidiaSmiProbe::default(), accelerate_config)
    }

    pub async fn collect(&self) -> GpuDiagnostics {
        let nvidia_devices = nvidia_devices(&self.root.join("dev"));
        let env = ENV_KEYS
            .iter()
            .map(|key| ((*key).to_string(), std::env::var(key).ok()))
            .collect();

        let smi_program = self.smi.program();
        let has_nvidia_smi = if Path::new(smi_program).is_absolute() {
            Path::new(smi_program).is_file()
        } else {
            find_in_path(smi_program).is_some()
        };
        let nvidia_smi = if has_nvidia_smi {
            self.smi.list_devices().await
        } else {
            CommandReport { ok: false, code: -1, out: format!("{smi_program} not found") }
        };
        let accelerator_available = NvidiaSmiProbe::reports_device(&nvidia_smi);

        let mut report = GpuDiagnostics {
            in_docker: self.root.join(".dockerenv").exists(),
            nvidia_devices,
            env,
            has_nvidia_smi,
            nvidia_smi,
            accelerator_available,
            accelerate: accelerate_config_report(self.accelerate_config.as_deref()),
            suggestions: Vec::new(),
        };
        report.suggestions = suggestions(&report);
        report
    }
}

fn nvidia_devices(dev_dir: &Path) -> Vec<String> {
    let pattern = format!("{}/nvidia*", glob::Pattern::escape(&dev_dir.to_string_lossy()));
    let mut devices: Vec<String> = glob::glob(&pattern)
        .map(|paths| paths.filter_map(Result::ok).map(|p| p.display().to_string()).collect())
        .unwrap_or_default();
    devices.sort();
    devices
}

fn accelerate_config_report(path: Option<&Path>) -> AccelerateConfigReport {
    let Some(path) = path else {
        return AccelerateConfigReport { path: None, exists: false, content: None, error: None };
    };
    let mut report =
        AccelerateConfigReport { path: Some(path.to_path_buf()), exists: path.is_file(), content: None, error: None };
    if report.exists {
        match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_yaml::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(content) => report.content = Some(content),
            Err(e) => report.error = Some(e),
        }
    }
    report
}

/// Hints for whatever in `report` blocks GPU training.
pub fn suggestions(report: &GpuDiagnostics) -> Vec<String> {
    let mut hints = Vec::new();
    if report.nvidia_devices.is_empty() {
        hints.push(
            "GPU devices are not visible in /dev. Recreate the container with --gpus and enable GPU support in Docker."
                .to_string(),
        );
    }
    if !report.nvidia_smi.ok {
        hints.push(
            "nvidia-smi is not available. Ensure the NVIDIA Container Toolkit is installed and the GPU is passed through."
                .to_string(),
        );
    }
    if !report.accelerator_available {
        hints.push("No usable GPU detected; kohya_ss will run on CPU with mixed precision disabled.".to_string());
    }
    if let (Some(path), false) = (&report.accelerate.path, report.accelerate.exists) {
        hints.push(format!("Accelerate config {} does not exist yet; it is written on the next training run.", path.display()));
    }
    hints
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_smi(script: &str) -> NvidiaSmiProbe {
        NvidiaSmiProbe::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_gpu_host_report() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("dev")).unwrap();
        std::fs::write(temp.path().join("dev/nvidia0"), "").unwrap();
        std::fs::write(temp.path().join("dev/nvidiactl"), "").unwrap();
        std::fs::write(temp.path().join(".dockerenv"), "").unwrap();
        let accel = temp.path().join("default_config.yaml");
        std::fs::write(&accel, "mixed_precision: bf16\nuse_cpu: false\n").unwrap();

        let probe = DiagnosticsProbe::new(temp.path(), fake_smi("echo 'GPU 0: Fake'"), Some(accel));
        let report = probe.collect().await;

        assert!(report.in_docker);
        assert_eq!(report.nvidia_devices.len(), 2);
        assert!(report.nvidia_devices[0].ends_with("nvidia0"));
        assert!(report.has_nvidia_smi);
        assert!(report.accelerator_available);
        assert!(report.accelerate.exists);
        let content = report.accelerate.content.unwrap();
        assert_eq!(content["mixed_precision"], serde_yaml::Value::from("bf16"));
        assert!(report.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_cpu_host_report_has_suggestions() {
        let temp = TempDir::new().unwrap();
        let probe = DiagnosticsProbe::new(
            temp.path(),
            NvidiaSmiProbe::new("/nonexistent/nvidia-smi", vec![]),
            Some(temp.path().join("missing.yaml")),
        );
        let report = probe.collect().await;

        assert!(!report.in_docker);
        assert!(report.nvidia_devices.is_empty());
        assert!(!report.has_nvidia_smi);
        assert_eq!(report.nvidia_smi.code, -1);
        assert!(!report.accelerator_available);
        assert!(!report.accelerate.exists);
        assert_eq!(report.suggestions.len(), 4);
        assert!(report.env.contains_key("CUDA_VISIBLE_DEVICES"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["nvidia_smi"]["ok"], false);
        assert!(json["accelerate"].get("content").is_none());
    }
}
