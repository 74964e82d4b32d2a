//! Orchestrator settings and tool lookup.
//!
//! Settings come from an optional `bauleiter.yml`; every field has a default,
//! and command line flags override the file.

use crate::error::{BuildError, BuildResult};
use convenient_jobserver::JobServerMode;
use convenient_process::{Classifier, RuleSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Settings file looked up in the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "bauleiter.yml";

/// Environment prefix for tool overrides (`TOOL_PATH_ninja=/opt/bin/ninja`).
pub const TOOL_PATH_PREFIX: &str = "TOOL_PATH_";

/// Job server mode as written in settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobServerSetting {
    /// Join a parent if one is advertised.
    #[default]
    Auto,
    /// Always serve.
    Server,
    /// Always join a parent.
    Client,
}

impl From<JobServerSetting> for JobServerMode {
    fn from(setting: JobServerSetting) -> Self {
        match setting {
            JobServerSetting::Auto => JobServerMode::Auto,
            JobServerSetting::Server => JobServerMode::Server,
            JobServerSetting::Client => JobServerMode::Client,
        }
    }
}

/// argv templates for the two per-unit steps.
///
/// Placeholders: `{project}`, `{unit}`, `{board}`, `{toolchain}`,
/// `{build_dir}`, `{config_file}`, `{overlays}`, `{source_dir}`, `{modules}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTemplates {
    /// Generates the build tree.
    pub configure: Vec<String>,
    /// Compiles inside the generated tree.
    pub build: Vec<String>,
}

impl Default for StepTemplates {
    fn default() -> Self {
        let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect();
        Self {
            configure: owned(&[
                "cmake",
                "-S",
                "{source_dir}",
                "-B",
                "{build_dir}",
                "-G",
                "Ninja",
                "-DBOARD={board}",
                "-DZEPHYR_TOOLCHAIN_VARIANT={toolchain}",
                "-DCONF_FILE={config_file}",
                "-DDTC_OVERLAY_FILE={overlays}",
                "-DZEPHYR_MODULES={modules}",
            ]),
            build: owned(&["ninja", "-C", "{build_dir}"]),
        }
    }
}

/// Everything configurable about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root of all build output.
    pub build_dir: PathBuf,
    /// Where `BUILD.yml` files are searched.
    pub search_dirs: Vec<PathBuf>,
    /// Application source handed to the configure step.
    pub source_dir: PathBuf,
    /// Known modules (name → checkout path).
    pub modules: BTreeMap<String, PathBuf>,
    /// Explicit job count; forces server mode.
    pub jobs: Option<usize>,
    /// Job server mode.
    pub jobserver: JobServerSetting,
    /// Keep building after failures.
    pub keep_going: bool,
    /// Per-subprocess time limit in seconds.
    pub timeout_secs: Option<u64>,
    /// Count cancelled projects as failures for the exit code.
    pub cancelled_is_failure: bool,
    /// Step argv templates.
    pub steps: StepTemplates,
    /// Extra diagnostic rules, checked before the built-in ones.
    pub diagnostics: Vec<RuleSpec>,
    /// Tool path overrides.
    pub tools: BTreeMap<String, PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("build"),
            search_dirs: vec![PathBuf::from("zephyr/program")],
            source_dir: PathBuf::from("."),
            modules: BTreeMap::new(),
            jobs: None,
            jobserver: JobServerSetting::Auto,
            keep_going: false,
            timeout_secs: None,
            cancelled_is_failure: false,
            steps: StepTemplates::default(),
            diagnostics: Vec::new(),
            tools: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Parse a settings file.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path).map_err(BuildError::io(path))?;
        let settings = Self::from_yaml(&content).map_err(|reason| BuildError::Settings {
            path: path.to_path_buf(),
            reason,
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load `explicit` if given, else `bauleiter.yml` if present, else defaults.
    pub fn discover(explicit: Option<&Path>) -> BuildResult<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_SETTINGS_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse settings from YAML text. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    /// Per-subprocess timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Default rules plus the configured ones (configured first).
    pub fn classifier(&self) -> BuildResult<Classifier> {
        let mut extra = Vec::with_capacity(self.diagnostics.len());
        for rule in &self.diagnostics {
            extra.push(rule.compile().map_err(|e| BuildError::Settings {
                path: PathBuf::from(DEFAULT_SETTINGS_FILE),
                reason: e.to_string(),
            })?);
        }
        Ok(Classifier::with_extra_rules(extra))
    }
}

/// Tool name → executable lookup for one run.
///
/// Built once from the settings `tools` table and `TOOL_PATH_<name>`
/// environment variables; the environment wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    paths: BTreeMap<String, PathBuf>,
}

impl ToolPaths {
    /// Combine settings with the process environment.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::from_parts(&settings.tools, std::env::vars())
    }

    /// Combine a table with explicit environment entries.
    pub fn from_parts<I>(table: &BTreeMap<String, PathBuf>, env: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut paths = table.clone();
        for (key, value) in env {
            if let Some(name) = key.strip_prefix(TOOL_PATH_PREFIX) {
                if !name.is_empty() && !value.is_empty() {
                    paths.insert(name.to_string(), PathBuf::from(value));
                }
            }
        }
        Self { paths }
    }

    /// Executable for `name`; the bare name when no override exists.
    pub fn resolve(&self, name: &str) -> String {
        self.paths
            .get(name)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    }

    /// Whether an override exists.
    pub fn contains(&self, name: &str) -> bool {
        self.paths.contains_key(name)
    }
}
