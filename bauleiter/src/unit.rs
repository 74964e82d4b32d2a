//! Build units: one compilation of a project (e.g. its RO or RW image).

use convenient_project::{BuildConfig, Project, ProjectId};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Name of the resolved Kconfig file inside a unit directory.
pub const RESOLVED_CONFIG: &str = "resolved.conf";
/// Name of the overlay list inside a unit directory.
pub const OVERLAY_LIST: &str = "overlays.txt";

/// A unit kind a packer asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitVariant {
    /// Unit name.
    pub name: &'static str,
    /// Extra Kconfig definitions for this variant.
    pub defs: &'static [(&'static str, &'static str)],
}

/// The only unit of single-image packers.
pub const SINGLE_IMAGE: UnitVariant = UnitVariant {
    name: "singleimage",
    defs: &[],
};

/// Read-only image.
pub const RO: UnitVariant = UnitVariant {
    name: "ro",
    defs: &[("CONFIG_CROS_EC_RO", "y")],
};

/// Read-write image.
pub const RW: UnitVariant = UnitVariant {
    name: "rw",
    defs: &[("CONFIG_CROS_EC_RW", "y")],
};

/// One concrete compilation of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildUnit {
    /// Owning project.
    pub project: ProjectId,
    /// Owning project's name.
    pub project_name: String,
    /// Board handed to the build tool.
    pub board: String,
    /// Unit name.
    pub name: String,
    /// Resolved configuration including the variant's definitions.
    pub config: BuildConfig,
    /// Build tree of this unit.
    pub dir: PathBuf,
    /// Toolchain in use.
    pub toolchain: String,
}

impl BuildUnit {
    /// One unit per variant, each under `<project_dir>/build-<variant>`.
    pub fn expand(
        project: &Project,
        config: &BuildConfig,
        variants: &[UnitVariant],
        project_dir: &Path,
        toolchain: &str,
    ) -> Vec<BuildUnit> {
        variants
            .iter()
            .map(|variant| {
                let config = variant
                    .defs
                    .iter()
                    .fold(config.clone(), |config, (key, value)| config.with_def(*key, *value));
                BuildUnit {
                    project: project.id,
                    project_name: project.name.clone(),
                    board: project.board.clone(),
                    name: variant.name.to_string(),
                    config,
                    dir: project_dir.join(format!("build-{}", variant.name)),
                    toolchain: toolchain.to_string(),
                }
            })
            .collect()
    }

    /// Log source name, `project:unit`.
    pub fn source_id(&self) -> String {
        format!("{}:{}", self.project_name, self.name)
    }

    /// Path of the resolved Kconfig file.
    pub fn config_file(&self) -> PathBuf {
        self.dir.join(RESOLVED_CONFIG)
    }

    /// Path of the overlay list.
    pub fn overlays_file(&self) -> PathBuf {
        self.dir.join(OVERLAY_LIST)
    }

    /// Module checkout paths this unit needs, in declared order.
    pub fn module_paths(
        &self,
        known: &BTreeMap<String, PathBuf>,
    ) -> Result<Vec<PathBuf>, String> {
        self.config
            .modules
            .iter()
            .map(|module| {
                known
                    .get(module)
                    .cloned()
                    .ok_or_else(|| format!("unknown module `{module}`"))
            })
            .collect()
    }

    /// Write the resolved configuration into the unit directory.
    ///
    /// Fragments are concatenated root-most first, followed by the inline
    /// definitions so they override anything a fragment set.
    pub fn write_configuration(&self, known_modules: &BTreeMap<String, PathBuf>) -> Result<(), String> {
        self.module_paths(known_modules)?;

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("cannot create {}: {}", self.dir.display(), e))?;

        let mut resolved = String::new();
        for fragment in &self.config.kconfig_files {
            let content = std::fs::read_to_string(fragment)
                .map_err(|e| format!("cannot read Kconfig fragment {}: {}", fragment.display(), e))?;
            let _ = writeln!(resolved, "# {}", fragment.display());
            resolved.push_str(&content);
            if !content.ends_with('\n') {
                resolved.push('\n');
            }
        }
        if !self.config.kconfig_defs.is_empty() {
            resolved.push_str("# generated\n");
            for (key, value) in &self.config.kconfig_defs {
                let _ = writeln!(resolved, "{key}={value}");
            }
        }

        let mut overlays = String::new();
        for overlay in &self.config.dts_overlays {
            if !overlay.is_file() {
                return Err(format!("devicetree overlay {} not found", overlay.display()));
            }
            let _ = writeln!(overlays, "{}", overlay.display());
        }

        std::fs::write(self.config_file(), resolved)
            .map_err(|e| format!("cannot write {}: {}", self.config_file().display(), e))?;
        std::fs::write(self.overlays_file(), overlays)
            .map_err(|e| format!("cannot write {}: {}", self.overlays_file().display(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convenient_project::{ProjectDescriptor, ProjectRegistry};

    fn project_in(dir: &Path) -> (ProjectRegistry, ProjectId) {
        std::fs::write(dir.join("base.conf"), "CONFIG_A=y\nCONFIG_B=y").unwrap();
        std::fs::write(dir.join("board.overlay"), "/ {};\n").unwrap();
        let descriptor: ProjectDescriptor = serde_yaml::from_str(
            "name: fatcat\nboard: npcx9\nkconfig_files: [base.conf]\ndts_overlays: [board.overlay]\nkconfig: {CONFIG_B: \"n\"}\nmodules: [ec]\n",
        )
        .unwrap();
        let registry =
            ProjectRegistry::from_descriptors(vec![(dir.join("BUILD.yml"), descriptor)]).unwrap();
        let id = registry.by_name("fatcat").unwrap().id;
        (registry, id)
    }

    #[test]
    fn test_expand_ro_rw() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = project_in(dir.path());
        let units = BuildUnit::expand(
            registry.get(id),
            &registry.resolved_config(id),
            &[RO, RW],
            &dir.path().join("out/fatcat"),
            "llvm",
        );

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].source_id(), "fatcat:ro");
        assert_eq!(units[0].config.kconfig_defs["CONFIG_CROS_EC_RO"], "y");
        assert!(!units[0].config.kconfig_defs.contains_key("CONFIG_CROS_EC_RW"));
        assert_eq!(units[1].dir, dir.path().join("out/fatcat/build-rw"));
        assert_eq!(units[1].toolchain, "llvm");
    }

    #[test]
    fn test_write_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = project_in(dir.path());
        let unit = BuildUnit::expand(
            registry.get(id),
            &registry.resolved_config(id),
            &[SINGLE_IMAGE],
            &dir.path().join("out"),
            "zephyr",
        )
        .remove(0);

        let modules = BTreeMap::from([("ec".to_string(), PathBuf::from("/src/ec"))]);
        unit.write_configuration(&modules).unwrap();

        let resolved = std::fs::read_to_string(unit.config_file()).unwrap();
        let a = resolved.find("CONFIG_A=y").unwrap();
        let generated = resolved.find("CONFIG_B=n").unwrap();
        assert!(a < generated);
        let overlays = std::fs::read_to_string(unit.overlays_file()).unwrap();
        assert!(overlays.trim_end().ends_with("board.overlay"));
    }

    #[test]
    fn test_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = project_in(dir.path());
        let unit = BuildUnit::expand(
            registry.get(id),
            &registry.resolved_config(id),
            &[SINGLE_IMAGE],
            &dir.path().join("out"),
            "zephyr",
        )
        .remove(0);

        let err = unit.write_configuration(&BTreeMap::new()).unwrap_err();
        assert!(err.contains("unknown module `ec`"));

        std::fs::remove_file(dir.path().join("base.conf")).unwrap();
        let modules = BTreeMap::from([("ec".to_string(), PathBuf::from("/src/ec"))]);
        let err = unit.write_configuration(&modules).unwrap_err();
        assert!(err.contains("base.conf"));
    }
}
