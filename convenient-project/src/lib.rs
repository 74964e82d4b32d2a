//! Firmware project registry.
//!
//! Projects are declared in `BUILD.yml` files, may inherit configuration
//! fragments from other projects, and are selected on the command line by
//! name, wildcard, or `%program` group.
//!
//! ```no_run
//! use convenient_project::find_projects;
//!
//! let registry = find_projects(&["zephyr/program"]).unwrap();
//! for id in registry.resolve(&["%fatcat"], false).unwrap() {
//!     let project = registry.get(id);
//!     let config = registry.resolved_config(id);
//!     println!("{} uses {} Kconfig fragments", project.name, config.kconfig_files.len());
//! }
//! ```

pub mod config;
pub mod descriptor;
pub mod error;
pub mod project;
pub mod registry;
pub mod selector;

pub use config::BuildConfig;
pub use descriptor::{
    DESCRIPTOR_FILE_NAME, DescriptorFile, PackerKind, ProjectDescriptor, SignerKind,
};
pub use error::{RegistryError, RegistryResult, ResolutionError};
pub use project::{Project, ProjectId};
pub use registry::{ProjectRegistry, find_projects, load_descriptor};
pub use selector::{PROGRAM_PREFIX, Selector};
