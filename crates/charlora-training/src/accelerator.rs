use async_trait::async_trait;

/// Reports whether a hardware accelerator is usable by the external trainer.
///
/// Pipelines query the probe once per job and reuse the answer for both the
/// precision mode and the device environment.
#[async_trait]
pub trait AcceleratorProbe: Send + Sync {
    async fn is_available(&self) -> bool;
}

/// A probe with a fixed answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedAccelerator(pub bool);

#[async_trait]
impl AcceleratorProbe for FixedAccelerator {
    async fn is_available(&self) -> bool {
        self.0
    }
}
