//! Loaded, immutable project records.

use crate::config::BuildConfig;
use crate::descriptor::{PackerKind, SignerKind};
use std::fmt;
use std::path::PathBuf;

/// Stable index of a project inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectId(pub(crate) usize);

impl ProjectId {
    /// Position in the registry (projects are ordered by name).
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One buildable hardware target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Own id.
    pub id: ProjectId,
    /// Unique name.
    pub name: String,
    /// Board / chip target.
    pub board: String,
    /// Supported toolchains, preferred first.
    pub toolchains: Vec<String>,
    /// Packing strategy.
    pub packer: PackerKind,
    /// Signing strategy.
    pub signer: SignerKind,
    /// Absolute signing key path, when the signer needs one.
    pub signing_key: Option<PathBuf>,
    /// Program group.
    pub program: String,
    /// Directory holding the descriptor.
    pub dir: PathBuf,
    /// Descriptor this project came from.
    pub descriptor: PathBuf,
    /// Declared parents, in declared order.
    pub parents: Vec<ProjectId>,
    /// Every ancestor once, root-most first.
    pub lineage: Vec<ProjectId>,
    /// This project's own fragments (paths already absolute).
    pub own_config: BuildConfig,
}

impl Project {
    /// Preferred toolchain, if any was declared.
    pub fn default_toolchain(&self) -> Option<&str> {
        self.toolchains.first().map(String::as_str)
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
