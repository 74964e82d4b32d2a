//! Signing strategies for packed images.

use crate::error::{BuildError, BuildResult};
use crate::steps::{StartGate, StepExecutor};
use async_trait::async_trait;
use convenient_process::{CommandSpec, LogSource, Severity};
use convenient_project::{Project, SignerKind};
use std::path::{Path, PathBuf};

/// A signing strategy.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `image` in place.
    async fn sign(
        &self,
        image: &Path,
        executor: &StepExecutor,
        source: &mut LogSource,
        gate: &StartGate,
    ) -> BuildResult<()>;
}

/// Strategy for a project's signer settings.
pub fn signer_for(project: &Project) -> BuildResult<Box<dyn Signer>> {
    match project.signer {
        SignerKind::None => Ok(Box::new(NullSigner)),
        SignerKind::Rwsig => {
            let key = project.signing_key.clone().ok_or_else(|| BuildError::Signing {
                project: project.name.clone(),
                reason: "rwsig signer requires a signing_key".to_string(),
            })?;
            Ok(Box::new(RwsigSigner {
                project: project.name.clone(),
                key,
            }))
        }
    }
}

/// Leaves the image untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSigner;

#[async_trait]
impl Signer for NullSigner {
    async fn sign(
        &self,
        _image: &Path,
        _executor: &StepExecutor,
        _source: &mut LogSource,
        _gate: &StartGate,
    ) -> BuildResult<()> {
        Ok(())
    }
}

/// Signs with `futility sign --type rwsig`.
#[derive(Debug, Clone)]
pub struct RwsigSigner {
    project: String,
    key: PathBuf,
}

impl RwsigSigner {
    /// Signer using the private key at `key`.
    pub fn new(project: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            key: key.into(),
        }
    }

    fn command(&self, futility: String, image: &Path) -> CommandSpec {
        CommandSpec::new([
            futility,
            "sign".to_string(),
            "--type".to_string(),
            "rwsig".to_string(),
            "--prikey".to_string(),
            self.key.display().to_string(),
            image.display().to_string(),
        ])
    }
}

#[async_trait]
impl Signer for RwsigSigner {
    async fn sign(
        &self,
        image: &Path,
        executor: &StepExecutor,
        source: &mut LogSource,
        gate: &StartGate,
    ) -> BuildResult<()> {
        if !self.key.is_file() {
            return Err(BuildError::Signing {
                project: self.project.clone(),
                reason: format!("signing key {} not found", self.key.display()),
            });
        }

        let spec = self.command(executor.tools().resolve("futility"), image);
        source.note(Severity::Info, format!("Signing: {}", spec.display()));
        executor
            .run(&self.project, "sign", spec, source, gate)
            .await
            .map_err(|e| match e {
                cancelled @ BuildError::Cancelled { .. } => cancelled,
                other => BuildError::Signing {
                    project: self.project.clone(),
                    reason: other.to_string(),
                },
            })?;
        Ok(())
    }
}
