//! On-disk project descriptors (`BUILD.yml`).
//!
//! ```yaml
//! projects:
//!   - name: fatcat
//!     board: npcx9/npcx9m7f
//!     toolchains: [coreboot-sdk, llvm]
//!     packer: raw
//!     inherited_from: [base]
//!     kconfig_files: [program.conf, fatcat/project.conf]
//!     dts_overlays: [fatcat/project.overlay]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// File name searched for under each search root.
pub const DESCRIPTOR_FILE_NAME: &str = "BUILD.yml";

/// Contents of one descriptor file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorFile {
    /// Projects declared in this file.
    #[serde(default)]
    pub projects: Vec<ProjectDescriptor>,
}

/// One declared project, as written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDescriptor {
    /// Unique project name.
    pub name: String,
    /// Board / chip target handed to the build tool.
    pub board: String,
    /// Supported toolchains, preferred first.
    #[serde(default)]
    pub toolchains: Vec<String>,
    /// How unit artifacts become the final image.
    #[serde(default)]
    pub packer: PackerKind,
    /// How the final image is signed.
    #[serde(default)]
    pub signer: SignerKind,
    /// Private key for signers that need one, relative to the descriptor.
    #[serde(default)]
    pub signing_key: Option<PathBuf>,
    /// Parent project names, in merge order.
    #[serde(default)]
    pub inherited_from: Vec<String>,
    /// Kconfig fragments, relative to the descriptor.
    #[serde(default)]
    pub kconfig_files: Vec<PathBuf>,
    /// Devicetree overlays, relative to the descriptor.
    #[serde(default)]
    pub dts_overlays: Vec<PathBuf>,
    /// Inline Kconfig definitions.
    #[serde(default)]
    pub kconfig: BTreeMap<String, String>,
    /// Source modules the build needs.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Program group; defaults to the descriptor's directory name.
    #[serde(default)]
    pub program: Option<String>,
}

/// Output packing strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackerKind {
    /// Single image, ELF kept as the artifact.
    Elf,
    /// Single image, flat binary.
    #[default]
    Raw,
    /// RO and RW images appended into one binary.
    Concat,
    /// RO and RW images assembled by `binman`.
    Binman,
}

impl fmt::Display for PackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackerKind::Elf => write!(f, "elf"),
            PackerKind::Raw => write!(f, "raw"),
            PackerKind::Concat => write!(f, "concat"),
            PackerKind::Binman => write!(f, "binman"),
        }
    }
}

/// Signing strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerKind {
    /// Leave the image unsigned.
    #[default]
    None,
    /// RW signature via `futility sign --type rwsig`.
    Rwsig,
}

impl fmt::Display for SignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerKind::None => write!(f, "none"),
            SignerKind::Rwsig => write!(f, "rwsig"),
        }
    }
}
