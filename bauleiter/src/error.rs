//! Build error taxonomy.
//!
//! Resolution and registry errors abort a run before anything is built. Every
//! other error is attributed to one project and never stops its siblings.

use convenient_jobserver::JobServerError;
use convenient_process::ProcessError;
use convenient_project::{RegistryError, ResolutionError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while orchestrating a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A selector matched nothing.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The project registry is inconsistent.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The settings file is unreadable.
    #[error("invalid settings in {path}: {reason}")]
    Settings {
        /// Settings file.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },

    /// The job server could not be set up.
    #[error(transparent)]
    JobServer(#[from] JobServerError),

    /// Configuration of a project failed (bad fragment, unknown module, ...).
    #[error("configuration of {project} failed: {reason}")]
    Configuration {
        /// Project name.
        project: String,
        /// What went wrong.
        reason: String,
    },

    /// An external tool could not be started.
    #[error("{unit}: {source}")]
    Launch {
        /// `project:unit` or `project` for project-level tools.
        unit: String,
        /// Launch failure.
        #[source]
        source: ProcessError,
    },

    /// A build step exited non-zero or printed a fatal diagnostic.
    #[error("{unit}: {step} failed ({detail})")]
    BuildFailure {
        /// `project:unit`.
        unit: String,
        /// Step name (`configure`, `build`).
        step: String,
        /// Exit code or diagnostic summary.
        detail: String,
        /// Exit code of the failed step (0 when only a diagnostic failed it).
        exit_code: i32,
    },

    /// Packing the unit artifacts failed.
    #[error("packing {project} failed: {reason}")]
    Packing {
        /// Project name.
        project: String,
        /// What went wrong.
        reason: String,
    },

    /// Signing the packed image failed.
    #[error("signing {project} failed: {reason}")]
    Signing {
        /// Project name.
        project: String,
        /// What went wrong.
        reason: String,
    },

    /// The work was stopped before it could finish.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why.
        reason: String,
    },

    /// Filesystem failure outside of a subprocess.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for orchestration.
pub type BuildResult<T> = Result<T, BuildError>;

/// Error class as shown in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Selector or registry problem.
    Resolution,
    /// Settings or job server setup problem.
    Setup,
    /// Configuration step failed.
    Configuration,
    /// Tool missing.
    Launch,
    /// Compilation failed.
    BuildFailure,
    /// Packing failed.
    Packing,
    /// Signing failed.
    Signing,
    /// Operator interrupt or fail-fast abort.
    Cancelled,
    /// Filesystem failure.
    Io,
}

impl BuildError {
    /// Report class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Resolution(_) | BuildError::Registry(_) => ErrorKind::Resolution,
            BuildError::Settings { .. } | BuildError::JobServer(_) => ErrorKind::Setup,
            BuildError::Configuration { .. } => ErrorKind::Configuration,
            BuildError::Launch { .. } => ErrorKind::Launch,
            BuildError::BuildFailure { .. } => ErrorKind::BuildFailure,
            BuildError::Packing { .. } => ErrorKind::Packing,
            BuildError::Signing { .. } => ErrorKind::Signing,
            BuildError::Cancelled { .. } => ErrorKind::Cancelled,
            BuildError::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| BuildError::Io { path, source }
    }
}
