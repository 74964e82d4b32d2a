//! Registry and selector errors.

use std::path::PathBuf;
use thiserror::Error;

/// The project registry is unreadable or inconsistent.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A descriptor could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Descriptor path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Walking a search root failed.
    #[error("cannot scan project directory: {0}")]
    Walk(#[from] walkdir::Error),

    /// A descriptor is not valid YAML for the expected schema.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Descriptor path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_yaml::Error,
    },

    /// Two descriptors declare the same project name.
    #[error("project `{name}` is declared twice ({first} and {second})")]
    DuplicateName {
        /// Project name.
        name: String,
        /// Descriptor of the first declaration.
        first: PathBuf,
        /// Descriptor of the second declaration.
        second: PathBuf,
    },

    /// A project inherits from a name nobody declares.
    #[error("project `{project}` inherits from unknown project `{parent}`")]
    MissingParent {
        /// Declaring project.
        project: String,
        /// Missing parent name.
        parent: String,
    },

    /// Inheritance loops back on itself.
    #[error("inheritance cycle: {chain}")]
    Cycle {
        /// Names along the cycle, joined by ` -> `.
        chain: String,
    },

    /// A descriptor is well-formed YAML but semantically wrong.
    #[error("project `{project}` is invalid: {reason}")]
    Invalid {
        /// Project name.
        project: String,
        /// What is wrong.
        reason: String,
    },
}

/// Result alias for registry loading.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// A selector did not resolve to any project.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// A plain name matched no project.
    #[error("unknown project `{0}`")]
    UnknownProject(String),

    /// A wildcard matched no project.
    #[error("no project matches `{0}`")]
    NoMatch(String),

    /// A `%group` selector matched no program.
    #[error("unknown program `{0}`")]
    UnknownProgram(String),

    /// A wildcard is not a valid pattern.
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// The selector.
        pattern: String,
        /// Why it does not parse.
        reason: String,
    },

    /// No selector was given and "all" was not requested.
    #[error("no projects selected")]
    NothingSelected,
}
