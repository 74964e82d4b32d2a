//! Resolved build configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration fragments in application order.
///
/// Later fragments override earlier ones when the build tool reads them, so
/// order is significant and preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildConfig {
    /// Kconfig fragment files, root-most first.
    pub kconfig_files: Vec<PathBuf>,
    /// Devicetree overlays, root-most first.
    pub dts_overlays: Vec<PathBuf>,
    /// Inline definitions; later layers win.
    pub kconfig_defs: BTreeMap<String, String>,
    /// Required modules, first mention first.
    pub modules: Vec<String>,
}

impl BuildConfig {
    /// Layer `overlay` on top of `self`.
    pub fn merge(&mut self, overlay: &BuildConfig) {
        self.kconfig_files.extend(overlay.kconfig_files.iter().cloned());
        self.dts_overlays.extend(overlay.dts_overlays.iter().cloned());
        for (key, value) in &overlay.kconfig_defs {
            self.kconfig_defs.insert(key.clone(), value.clone());
        }
        for module in &overlay.modules {
            if !self.modules.contains(module) {
                self.modules.push(module.clone());
            }
        }
    }

    /// Copy with one more definition.
    pub fn with_def(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kconfig_defs.insert(key.into(), value.into());
        self
    }
}
