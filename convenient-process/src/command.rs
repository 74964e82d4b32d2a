//! Description of one subprocess invocation.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to run, where, and with which extra environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory; inherits ours when `None`.
    pub workdir: Option<PathBuf>,
    /// Variables added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Wall-clock limit for this subprocess only.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Start from a full argv.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Shorthand for `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add several environment variables.
    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    /// Limit how long the process may run.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// argv[0], if any.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Render for logs, quoting arguments that contain whitespace.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("'{}'", arg.replace('\'', r"'\''"))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = CommandSpec::new(["cmake", "-S", "src"])
            .arg("-B")
            .arg("build dir")
            .current_dir("/tmp")
            .env("CC", "clang")
            .timeout(Some(Duration::from_secs(5)));

        assert_eq!(spec.program(), Some("cmake"));
        assert_eq!(spec.argv.len(), 5);
        assert_eq!(spec.workdir.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(spec.env, vec![("CC".to_string(), "clang".to_string())]);
        assert_eq!(spec.display(), "cmake -S src -B 'build dir'");
    }

    #[test]
    fn test_shell() {
        let spec = CommandSpec::shell("echo hi");
        assert_eq!(spec.argv, vec!["sh", "-c", "echo hi"]);
        assert_eq!(spec.display(), "sh -c 'echo hi'");
    }
}
