//! Per-unit steps and their execution under job tokens.

use crate::error::{BuildError, BuildResult};
use crate::settings::{StepTemplates, ToolPaths};
use crate::unit::BuildUnit;
use convenient_jobserver::{JobServerError, JobToken, JobTokenPool};
use convenient_process::{CommandSpec, LogSource, ProcessOutcome, ProcessRunner, Severity};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The two steps every unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Generate the build tree.
    Configure,
    /// Compile.
    Build,
}

impl StepKind {
    /// Template for this step.
    pub fn template(self, templates: &StepTemplates) -> &[String] {
        match self {
            StepKind::Configure => &templates.configure,
            StepKind::Build => &templates.build,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Configure => f.write_str("configure"),
            StepKind::Build => f.write_str("build"),
        }
    }
}

/// Placeholder values for one unit.
pub fn unit_vars(
    unit: &BuildUnit,
    source_dir: &Path,
    modules: &[PathBuf],
) -> BTreeMap<&'static str, String> {
    let joined = |paths: &[PathBuf]| {
        paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(";")
    };

    BTreeMap::from([
        ("project", unit.project_name.clone()),
        ("unit", unit.name.clone()),
        ("board", unit.board.clone()),
        ("toolchain", unit.toolchain.clone()),
        ("build_dir", unit.dir.to_string_lossy().into_owned()),
        ("config_file", unit.config_file().to_string_lossy().into_owned()),
        ("overlays", joined(&unit.config.dts_overlays)),
        ("source_dir", source_dir.to_string_lossy().into_owned()),
        ("modules", joined(modules)),
    ])
}

/// Substitute `{name}` placeholders; unknown ones are left as written.
pub fn expand_arg(arg: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let value = after
            .find('}')
            .and_then(|end| vars.get(&after[..end]).map(|value| (end, value)));
        match value {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a whole argv template and resolve its program through `tools`.
pub fn expand_argv(
    template: &[String],
    vars: &BTreeMap<&str, String>,
    tools: &ToolPaths,
) -> Vec<String> {
    let mut argv: Vec<String> = template.iter().map(|arg| expand_arg(arg, vars)).collect();
    if let Some(program) = argv.first_mut() {
        *program = tools.resolve(program);
    }
    argv
}

/// A cancellation scope that remembers what triggered it.
#[derive(Debug)]
pub struct Abort {
    token: CancellationToken,
    cause: OnceLock<String>,
}

impl Abort {
    /// Scope that also fires when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: OnceLock::new(),
        }
    }

    /// Fire, recording `cause` if this is the first trigger.
    pub fn trigger(&self, cause: impl Into<String>) {
        let _ = self.cause.set(cause.into());
        self.token.cancel();
    }

    /// Whether the scope fired (including through its parent).
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// What triggered it; `None` when the parent was cancelled.
    pub fn cause(&self) -> Option<&str> {
        self.cause.get().map(String::as_str)
    }

    /// Human-readable reason.
    pub fn reason(&self) -> String {
        match self.cause() {
            Some(cause) => format!("aborted after failure of {cause}"),
            None => "interrupted".to_string(),
        }
    }

    /// Resolves once fired.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

/// Decides whether a step of one project may still start.
///
/// Before the project holds its first token, a fail-fast abort of the run
/// cancels it. Once started, only its own abort scope (sibling unit failure
/// or operator interrupt) stops new steps.
#[derive(Debug, Clone)]
pub struct StartGate {
    run: Arc<Abort>,
    project: Arc<Abort>,
    started: Arc<AtomicBool>,
}

impl StartGate {
    /// Gate for one project.
    pub fn new(run: Arc<Abort>, project: Arc<Abort>) -> Self {
        Self {
            run,
            project,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the project already acquired a token.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Why no new step may start, if that is the case.
    pub fn closed_reason(&self) -> Option<String> {
        if self.project.is_triggered() {
            Some(self.project.reason())
        } else if !self.started() && self.run.is_triggered() {
            Some(self.run.reason())
        } else {
            None
        }
    }

    /// Stop further starts after `unit` of `project` failed: sibling units
    /// that have not started yet, and projects that have not started yet.
    pub fn abort_after_failure(&self, project: &str, unit: &str) {
        self.project.trigger(unit);
        self.run.trigger(project);
    }

    async fn acquire(
        &self,
        pool: &JobTokenPool,
        cancel: &CancellationToken,
    ) -> BuildResult<JobToken> {
        loop {
            let gated = !self.started();
            tokio::select! {
                biased;
                _ = self.project.triggered() => {
                    return Err(BuildError::Cancelled { reason: self.project.reason() });
                }
                _ = self.run.triggered(), if gated => {
                    if self.started() {
                        continue;
                    }
                    return Err(BuildError::Cancelled { reason: self.run.reason() });
                }
                token = pool.acquire_or_cancel(cancel) => {
                    let token = token.map_err(|e| match e {
                        JobServerError::Cancelled => {
                            BuildError::Cancelled { reason: "interrupted".to_string() }
                        }
                        JobServerError::ShutDown => {
                            BuildError::Cancelled { reason: "job server shut down".to_string() }
                        }
                        other => BuildError::JobServer(other),
                    })?;
                    self.started.store(true, Ordering::SeqCst);
                    return Ok(token);
                }
            }
        }
    }
}

/// Runs external tools, each under one job token.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    pool: JobTokenPool,
    runner: ProcessRunner,
    tools: ToolPaths,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl StepExecutor {
    /// Children inherit the pool's `MAKEFLAGS`; `cancel` stops running processes.
    pub fn new(
        pool: JobTokenPool,
        tools: ToolPaths,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let runner = ProcessRunner::with_env(pool.child_env());
        Self {
            pool,
            runner,
            tools,
            timeout,
            cancel,
        }
    }

    /// Token pool in use.
    pub fn pool(&self) -> &JobTokenPool {
        &self.pool
    }

    /// Tool lookup in use.
    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Operator cancellation.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one command as `label` (`project:unit` or `project`).
    ///
    /// The token is held only while the subprocess runs. Non-zero exits,
    /// timeouts and fatal diagnostics become [`BuildError::BuildFailure`].
    pub async fn run(
        &self,
        label: &str,
        step: &str,
        spec: CommandSpec,
        source: &mut LogSource,
        gate: &StartGate,
    ) -> BuildResult<ProcessOutcome> {
        let spec = spec.timeout(self.timeout);
        let token = gate.acquire(&self.pool, &self.cancel).await?;
        debug!(unit = label, step, command = %spec.display(), "Starting step");

        let process = self.runner.spawn(&spec).map_err(|source| BuildError::Launch {
            unit: label.to_string(),
            source,
        })?;
        let outcome = convenient_process::run_logged(process, source, &self.cancel)
            .await
            .map_err(|source| BuildError::Launch {
                unit: label.to_string(),
                source,
            })?;
        drop(token);

        if outcome.cancelled {
            source.note(Severity::Warning, format!("{step} interrupted"));
            return Err(BuildError::Cancelled {
                reason: "interrupted".to_string(),
            });
        }
        if outcome.timed_out {
            let detail = format!(
                "timed out after {}s",
                self.timeout.map(|t| t.as_secs()).unwrap_or_default()
            );
            source.note(Severity::Error, format!("{step} {detail}"));
            return Err(BuildError::BuildFailure {
                unit: label.to_string(),
                step: step.to_string(),
                detail,
                exit_code: outcome.exit_code,
            });
        }
        if outcome.exit_code != 0 {
            return Err(BuildError::BuildFailure {
                unit: label.to_string(),
                step: step.to_string(),
                detail: format!("exit code {}", outcome.exit_code),
                exit_code: outcome.exit_code,
            });
        }
        if outcome.fatal_diagnostic {
            return Err(BuildError::BuildFailure {
                unit: label.to_string(),
                step: step.to_string(),
                detail: "fatal diagnostic in output".to_string(),
                exit_code: outcome.exit_code,
            });
        }
        Ok(outcome)
    }

    /// Expand and run one unit step.
    pub async fn run_unit_step(
        &self,
        unit: &BuildUnit,
        kind: StepKind,
        template: &[String],
        vars: &BTreeMap<&'static str, String>,
        source: &mut LogSource,
        gate: &StartGate,
    ) -> BuildResult<ProcessOutcome> {
        let argv = expand_argv(template, vars, &self.tools);
        let spec = CommandSpec::new(argv).current_dir(&unit.dir);
        match kind {
            StepKind::Configure => source.note(Severity::Info, "Configuring."),
            StepKind::Build => source.note(Severity::Info, format!("Building: {}", spec.display())),
        }
        self.run(&unit.source_id(), &kind.to_string(), spec, source, gate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("board", "npcx9".to_string()),
            ("build_dir", "/b/fatcat/build-ro".to_string()),
            ("overlays", "a.overlay;b.overlay".to_string()),
        ])
    }

    #[test]
    fn test_expand_arg() {
        assert_eq!(expand_arg("-DBOARD={board}", &vars()), "-DBOARD=npcx9");
        assert_eq!(expand_arg("{build_dir}", &vars()), "/b/fatcat/build-ro");
        assert_eq!(
            expand_arg("-DDTC_OVERLAY_FILE={overlays}", &vars()),
            "-DDTC_OVERLAY_FILE=a.overlay;b.overlay"
        );
        assert_eq!(expand_arg("{unknown} {board", &vars()), "{unknown} {board");
        assert_eq!(expand_arg("${HOME}/{board}", &vars()), "${HOME}/npcx9");
    }

    #[test]
    fn test_expand_argv_resolves_program() {
        let tools = ToolPaths::from_parts(
            &BTreeMap::from([("ninja".to_string(), PathBuf::from("/opt/bin/ninja"))]),
            Vec::new(),
        );
        let template = vec!["ninja".to_string(), "-C".to_string(), "{build_dir}".to_string()];
        assert_eq!(
            expand_argv(&template, &vars(), &tools),
            vec!["/opt/bin/ninja", "-C", "/b/fatcat/build-ro"]
        );
    }

    #[test]
    fn test_abort_reason() {
        let root = CancellationToken::new();
        let abort = Abort::new(&root);
        assert!(!abort.is_triggered());
        abort.trigger("fatcat");
        abort.trigger("other");
        assert_eq!(abort.reason(), "aborted after failure of fatcat");

        let interrupted = Abort::new(&root);
        assert!(!interrupted.is_triggered());
        root.cancel();
        assert!(interrupted.is_triggered());
        assert_eq!(interrupted.reason(), "interrupted");
    }

    #[tokio::test]
    async fn test_gate_blocks_unstarted_projects_only() {
        let root = CancellationToken::new();
        let pool = JobTokenPool::server(2).unwrap();
        let run = Arc::new(Abort::new(&root));

        let started = StartGate::new(run.clone(), Arc::new(Abort::new(&root)));
        let waiting = StartGate::new(run.clone(), Arc::new(Abort::new(&root)));

        let token = started.acquire(&pool, &CancellationToken::new()).await.unwrap();
        drop(token);
        run.trigger("bloonchipper");

        assert!(started.closed_reason().is_none());
        let token = started.acquire(&pool, &CancellationToken::new()).await.unwrap();
        drop(token);

        assert_eq!(
            waiting.closed_reason().as_deref(),
            Some("aborted after failure of bloonchipper")
        );
        let err = waiting.acquire(&pool, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BuildError::Cancelled { .. }));
    }
}
