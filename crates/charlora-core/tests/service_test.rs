//! Job service behavior through the public API.
#![cfg(unix)]

mod common;

use charlora_core::CoreError;
use charlora_training::{JobId, JobState};
use common::{submission, wait_for_terminal, TestEnv};

#[tokio::test]
async fn test_submit_runs_job_to_done() {
    let env = TestEnv::new();
    let service = env.service();

    let submitted = service.submit(submission("  aria  ", 8)).await.unwrap();
    let artifact = submitted.task.await.unwrap().unwrap();

    let snapshot = service.status(&submitted.job_id).unwrap();
    assert_eq!(snapshot.state, JobState::Done);
    assert_eq!(snapshot.artifact_path.as_deref(), Some(artifact.as_path()));
    assert!(artifact.starts_with(&env.config.training.ed_lora_dir));
    assert_eq!(&snapshot.logs[..3], ["🚀 Starting one-click pipeline…", "Base model: ds8", "Frames: 8"]);
    assert!(snapshot.logs.contains(&"epoch 1/1".to_string()));

    let record = service.registry().get(&submitted.job_id).unwrap();
    assert_eq!(record.params().get("name"), Some("aria"));
    assert_eq!(record.params().get("resolution"), Some("64"));
}

#[tokio::test]
async fn test_uploads_are_numbered_and_sanitized() {
    let env = TestEnv::new();
    let service = env.service();
    let mut request = submission("aria", 8);
    request.files[0].filename = Some("../../escape.png".to_string());
    request.files[1].filename = None;

    let submitted = service.submit(request).await.unwrap();
    let raw_dir = env.config.training.jobs_root.join(submitted.job_id.as_str()).join("raw");
    assert!(raw_dir.join("000_escape.png").is_file());
    assert!(raw_dir.join("001_image").is_file());
    assert!(raw_dir.join("007_shot_7.png").is_file());

    let snapshot = wait_for_terminal(service.registry(), &submitted.job_id).await;
    assert_eq!(snapshot.state, JobState::Done);
}

#[tokio::test]
async fn test_blank_trigger_uses_configured_token() {
    let env = TestEnv::new();
    let service = env.service();
    let mut request = submission("aria", 8);
    request.trigger = "   ".to_string();

    let submitted = service.submit(request).await.unwrap();
    submitted.task.await.unwrap().unwrap();

    let caption_path = env
        .config
        .training
        .jobs_root
        .join(submitted.job_id.as_str())
        .join("dataset/images/1_aria/000.txt");
    assert_eq!(std::fs::read_to_string(caption_path).unwrap(), "svtchar aria");
}

#[tokio::test]
async fn test_blank_name_is_rejected_before_anything_is_created() {
    let env = TestEnv::new();
    let service = env.service();

    let err = service.submit(submission(" \t ", 8)).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidSubmission(_)));
    assert!(service.registry().is_empty());
    assert_eq!(std::fs::read_dir(&env.config.training.jobs_root).unwrap().count(), 0);
}

#[tokio::test]
async fn test_name_with_path_separators_is_rejected() {
    let env = TestEnv::new();
    let service = env.service();

    for name in ["x/../../other-job/raw", "..", "a\\b"] {
        let err = service.submit(submission(name, 8)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidSubmission(ref msg) if msg.contains("path separators")));
    }
    assert!(service.registry().is_empty());
    assert_eq!(std::fs::read_dir(&env.config.training.jobs_root).unwrap().count(), 0);
}

#[tokio::test]
async fn test_too_few_images_is_rejected() {
    let env = TestEnv::new();
    let service = env.service();

    let err = service.submit(submission("aria", 7)).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidSubmission(ref msg) if msg.contains('8')));
    assert!(service.registry().is_empty());
}

#[tokio::test]
async fn test_unknown_base_model_ends_in_error() {
    let env = TestEnv::new();
    let service = env.service();
    let mut request = submission("aria", 8);
    request.base_model = "sdxl".to_string();

    let submitted = service.submit(request).await.unwrap();
    assert!(submitted.task.await.unwrap().is_err());

    let snapshot = service.status(&submitted.job_id).unwrap();
    assert_eq!(snapshot.state, JobState::Error);
    assert!(snapshot.error.unwrap().contains("sdxl"));
}

#[tokio::test]
async fn test_status_of_unknown_job() {
    let env = TestEnv::new();
    let err = env.service().status(&JobId::from("missing")).unwrap_err();
    assert!(matches!(err, CoreError::JobNotFound(_)));
}

#[tokio::test]
async fn test_config_test_report() {
    let env = TestEnv::new();
    let report = env.service().config_test();
    assert!(report.ok);
    assert!(report.docker);
    assert!(report.ssh);
    assert_eq!(report.ed_lora_dir, env.config.training.ed_lora_dir);
    assert_eq!(report.message, "Environment is ready for training (kohya_ss)");
}
