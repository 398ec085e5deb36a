//! Charlora service: configuration, job submission and the HTTP surface
//! over the `charlora-training` pipeline.

pub mod accelerator;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod server;
pub mod service;

pub use accelerator::{CommandReport, NvidiaSmiProbe};
pub use config::Config;
pub use diagnostics::{DiagnosticsProbe, GpuDiagnostics};
pub use error::{CoreError, Result};
pub use service::{ConfigTestReport, JobService, Submission, SubmittedJob, UploadedFile};
