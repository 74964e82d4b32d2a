//! Build pipeline
//!
//! Drives every selected project through
//! `Pending → Configuring → Building → Packing → Signing → Succeeded`,
//! with all projects and all units of a project running concurrently. The
//! job token pool is the only limit on parallel subprocesses.
//!
//! Without keep-going, the first failure stops projects and units that have
//! not acquired a token yet; anything already running finishes.

use crate::error::{BuildError, BuildResult};
use crate::packers::{PackContext, packer_for};
use crate::result::{Artifact, ProjectResult, RunResult, UnitOutcome, UnitResult};
use crate::settings::{Settings, StepTemplates};
use crate::signers::signer_for;
use crate::state::{ProjectState, StateMachine};
use crate::steps::{Abort, StartGate, StepExecutor, StepKind, unit_vars};
use crate::unit::BuildUnit;
use chrono::Utc;
use convenient_process::{LogMultiplexer, LogSource, Severity};
use convenient_project::{Project, ProjectId, ProjectRegistry};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Artifact list written next to the packed image.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory of packed artifacts inside a project directory.
pub const OUTPUT_DIR: &str = "output";

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Root of all build output.
    pub build_dir: PathBuf,
    /// Application source handed to the configure step.
    pub source_dir: PathBuf,
    /// Known modules (name → checkout path).
    pub modules: BTreeMap<String, PathBuf>,
    /// Step argv templates.
    pub steps: StepTemplates,
    /// Build everything regardless of failures.
    pub keep_going: bool,
    /// Remove each project directory first.
    pub clobber: bool,
    /// Remove unit directories after a project succeeded.
    pub delete_intermediates: bool,
    /// Toolchain for every project instead of its preferred one.
    pub toolchain: Option<String>,
}

impl PipelineOptions {
    /// Options taken from settings; per-invocation flags stay off.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            build_dir: settings.build_dir.clone(),
            source_dir: settings.source_dir.clone(),
            modules: settings.modules.clone(),
            steps: settings.steps.clone(),
            keep_going: settings.keep_going,
            clobber: false,
            delete_intermediates: false,
            toolchain: None,
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    project: &'a str,
    artifacts: &'a [Artifact],
}

/// Builds a set of projects.
#[derive(Debug, Clone)]
pub struct BuildPipeline {
    registry: Arc<ProjectRegistry>,
    executor: StepExecutor,
    mux: LogMultiplexer,
    options: Arc<PipelineOptions>,
}

impl BuildPipeline {
    /// Pipeline over `registry`.
    pub fn new(
        registry: Arc<ProjectRegistry>,
        executor: StepExecutor,
        mux: LogMultiplexer,
        options: PipelineOptions,
    ) -> Self {
        Self {
            registry,
            executor,
            mux,
            options: Arc::new(options),
        }
    }

    /// `<build_dir>/<project>`.
    pub fn project_dir(&self, project: &Project) -> PathBuf {
        self.options.build_dir.join(&project.name)
    }

    /// Toolchain a project will be built with.
    pub fn toolchain_for(&self, project: &Project) -> Option<String> {
        self.options
            .toolchain
            .clone()
            .or_else(|| project.default_toolchain().map(str::to_string))
    }

    /// Units a project expands into.
    pub fn units_for(&self, id: ProjectId) -> BuildResult<Vec<BuildUnit>> {
        let project = self.registry.get(id);
        let toolchain = self.toolchain_for(project).ok_or_else(|| BuildError::Configuration {
            project: project.name.clone(),
            reason: "no toolchain declared and none given".to_string(),
        })?;
        Ok(BuildUnit::expand(
            project,
            &self.registry.resolved_config(id),
            packer_for(project.packer).variants(),
            &self.project_dir(project),
            &toolchain,
        ))
    }

    /// Build `ids` and wait until their logs are fully written.
    pub async fn run(&self, ids: &BTreeSet<ProjectId>) -> RunResult {
        let started = Utc::now();
        let cancel = self.executor.cancel_token().clone();
        let run_abort = Arc::new(Abort::new(&cancel));

        info!(
            projects = ids.len(),
            jobserver = self.executor.pool().kind(),
            capacity = ?self.executor.pool().capacity(),
            keep_going = self.options.keep_going,
            "Starting build"
        );

        let closer = {
            let pool = self.executor.pool().clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                if !pool.is_shut_down() {
                    info!("Build cancelled, closing job server");
                    pool.shutdown();
                }
            })
        };

        let handles: Vec<(String, JoinHandle<ProjectResult>)> = ids
            .iter()
            .map(|&id| {
                let pipeline = self.clone();
                let run_abort = run_abort.clone();
                let name = self.registry.get(id).name.clone();
                (name, tokio::spawn(async move { pipeline.build_project(id, run_abort).await }))
            })
            .collect();

        let mut projects = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(result) => projects.push(result),
                Err(e) => {
                    error!(project = %name, "Project task failed: {}", e);
                    projects.push(ProjectResult {
                        project: name,
                        state: ProjectState::Failed,
                        error_kind: None,
                        error: Some(format!("project task failed: {e}")),
                        units: Vec::new(),
                        artifacts: Vec::new(),
                        transitions: Vec::new(),
                        duration_ms: 0,
                    });
                }
            }
        }
        projects.sort_by(|a, b| a.project.cmp(&b.project));
        closer.abort();

        self.mux.wait_for_log_end().await;

        let stats = self.executor.pool().stats();
        debug!(
            high_water = stats.high_water,
            acquired = stats.acquired,
            released = stats.released,
            "Job token usage"
        );

        RunResult {
            projects,
            cancelled: cancel.is_cancelled(),
            started,
            finished: Utc::now(),
        }
    }

    async fn build_project(self, id: ProjectId, run_abort: Arc<Abort>) -> ProjectResult {
        let started = Instant::now();
        let project = self.registry.get(id);
        let gate = StartGate::new(
            run_abort,
            Arc::new(Abort::new(self.executor.cancel_token())),
        );
        let mut source = self.mux.register(project.name.clone());
        let mut machine = StateMachine::new();
        let mut units = Vec::new();
        let mut artifacts = Vec::new();

        let outcome = self
            .drive(id, &gate, &mut source, &mut machine, &mut units, &mut artifacts)
            .await;

        let (state, error_kind, error) = match outcome {
            Ok(()) => {
                info!(project = %project.name, "Project succeeded");
                (ProjectState::Succeeded, None, None)
            }
            Err(e @ BuildError::Cancelled { .. }) => {
                warn!(project = %project.name, "Project cancelled: {}", e);
                (ProjectState::Cancelled, Some(e.kind()), Some(e.to_string()))
            }
            Err(e) => {
                error!(project = %project.name, "Project failed: {}", e);
                source.note(Severity::Error, e.to_string());
                if !self.options.keep_going {
                    gate.abort_after_failure(&project.name, &project.name);
                }
                (ProjectState::Failed, Some(e.kind()), Some(e.to_string()))
            }
        };
        if !machine.state().is_terminal() {
            enter(&mut machine, state, &project.name);
        }

        ProjectResult {
            project: project.name.clone(),
            state: machine.state(),
            error_kind,
            error,
            units,
            artifacts,
            transitions: machine.history().to_vec(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn drive(
        &self,
        id: ProjectId,
        gate: &StartGate,
        source: &mut LogSource,
        machine: &mut StateMachine,
        unit_results: &mut Vec<UnitResult>,
        artifacts: &mut Vec<Artifact>,
    ) -> BuildResult<()> {
        let project = self.registry.get(id);
        if let Some(reason) = gate.closed_reason() {
            return Err(BuildError::Cancelled { reason });
        }

        enter(machine, ProjectState::Configuring, &project.name);
        let project_dir = self.project_dir(project);
        if self.options.clobber && project_dir.exists() {
            debug!(project = %project.name, "Removing {}", project_dir.display());
            std::fs::remove_dir_all(&project_dir).map_err(BuildError::io(&project_dir))?;
        }
        let units = self.units_for(id)?;
        for unit in &units {
            unit.write_configuration(&self.options.modules)
                .map_err(|reason| BuildError::Configuration {
                    project: project.name.clone(),
                    reason,
                })?;
        }

        enter(machine, ProjectState::Building, &project.name);
        source.note(
            Severity::Info,
            format!("Building in {}.", project_dir.display()),
        );
        let mut running = JoinSet::new();
        for (index, unit) in units.iter().enumerate() {
            let pipeline = self.clone();
            let unit = unit.clone();
            let gate = gate.clone();
            running.spawn(async move { (index, pipeline.build_unit(unit, gate).await) });
        }

        let mut finished = Vec::with_capacity(units.len());
        let mut failure: Option<BuildError> = None;
        let mut cancellation = None;
        while let Some(joined) = running.join_next().await {
            let (index, (result, error)) = joined.map_err(|e| BuildError::BuildFailure {
                unit: project.name.clone(),
                step: "build".to_string(),
                detail: format!("unit task failed: {e}"),
                exit_code: -1,
            })?;
            match error {
                Some(e @ BuildError::Cancelled { .. }) => {
                    cancellation.get_or_insert(e);
                }
                Some(e) => {
                    if failure.is_none() {
                        // Fail now; siblings still running are drained below.
                        enter(machine, ProjectState::Failed, &project.name);
                        if !self.options.keep_going {
                            let unit = format!("{}:{}", project.name, result.unit);
                            gate.abort_after_failure(&project.name, &unit);
                        }
                    }
                    failure.get_or_insert(e);
                }
                None => {}
            }
            finished.push((index, result));
        }
        finished.sort_by_key(|(index, _)| *index);
        unit_results.extend(finished.into_iter().map(|(_, result)| result));
        if let Some(e) = failure.or(cancellation) {
            return Err(e);
        }

        enter(machine, ProjectState::Packing, &project.name);
        let output_dir = project_dir.join(OUTPUT_DIR);
        std::fs::create_dir_all(&output_dir).map_err(BuildError::io(&output_dir))?;
        let packer = packer_for(project.packer);
        let mut ctx = PackContext {
            project: &project.name,
            units: &units,
            output_dir: &output_dir,
            executor: &self.executor,
            source: &mut *source,
            gate,
        };
        let packed = packer.pack(&mut ctx).await?;

        enter(machine, ProjectState::Signing, &project.name);
        let signer = signer_for(project)?;
        if let Some(image) = packed.first() {
            signer.sign(image, &self.executor, source, gate).await?;
        }

        for path in &packed {
            artifacts.push(describe_artifact(path)?);
        }
        write_manifest(&project.name, &output_dir, artifacts)?;
        source.note(
            Severity::Info,
            format!("Output in {}.", output_dir.display()),
        );

        if self.options.delete_intermediates {
            for unit in &units {
                if unit.dir.exists() {
                    std::fs::remove_dir_all(&unit.dir).map_err(BuildError::io(&unit.dir))?;
                }
            }
        }
        Ok(())
    }

    async fn build_unit(self, unit: BuildUnit, gate: StartGate) -> (UnitResult, Option<BuildError>) {
        let started = Instant::now();
        let mut source = self.mux.register(unit.source_id());
        let vars = match unit.module_paths(&self.options.modules) {
            Ok(modules) => unit_vars(&unit, &self.options.source_dir, &modules),
            Err(reason) => {
                let error = BuildError::Configuration {
                    project: unit.project_name.clone(),
                    reason,
                };
                return (unit_result(&unit, source, None, UnitOutcome::Failed, started), Some(error));
            }
        };

        if let Some(reason) = gate.closed_reason() {
            source.note(Severity::Info, format!("Skipped: {reason}."));
            return (
                unit_result(&unit, source, None, UnitOutcome::Skipped, started),
                Some(BuildError::Cancelled { reason }),
            );
        }

        let mut exit_code = None;
        let mut error = None;
        for kind in [StepKind::Configure, StepKind::Build] {
            let step = self
                .executor
                .run_unit_step(
                    &unit,
                    kind,
                    kind.template(&self.options.steps),
                    &vars,
                    &mut source,
                    &gate,
                )
                .await;
            match step {
                Ok(outcome) => exit_code = Some(outcome.exit_code),
                Err(e) => {
                    if let BuildError::BuildFailure { exit_code: code, .. } = &e {
                        exit_code = Some(*code);
                    }
                    error = Some(e);
                    break;
                }
            }
        }

        let outcome = match &error {
            None => UnitOutcome::Succeeded,
            Some(BuildError::Cancelled { .. }) => UnitOutcome::Cancelled,
            Some(e) => {
                source.note(Severity::Error, e.to_string());
                if !self.options.keep_going {
                    gate.abort_after_failure(&unit.project_name, &unit.source_id());
                }
                UnitOutcome::Failed
            }
        };
        debug!(unit = %unit.source_id(), ?outcome, "Unit finished");
        (unit_result(&unit, source, exit_code, outcome, started), error)
    }
}

fn unit_result(
    unit: &BuildUnit,
    source: LogSource,
    exit_code: Option<i32>,
    outcome: UnitOutcome,
    started: Instant,
) -> UnitResult {
    let summary = source.finish();
    UnitResult {
        unit: unit.name.clone(),
        exit_code,
        outcome,
        diagnostics: summary.diagnostics,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn enter(machine: &mut StateMachine, state: ProjectState, project: &str) {
    match machine.advance(state) {
        Ok(()) => debug!(project, "{}", state),
        Err(e) => warn!(project, "{}", e),
    }
}

/// Size and SHA-256 of one output file.
pub fn describe_artifact(path: &Path) -> BuildResult<Artifact> {
    let content = std::fs::read(path).map_err(BuildError::io(path))?;
    Ok(Artifact {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        size: content.len() as u64,
        sha256: hex::encode(Sha256::digest(&content)),
    })
}

fn write_manifest(project: &str, output_dir: &Path, artifacts: &[Artifact]) -> BuildResult<()> {
    let path = output_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&Manifest { project, artifacts })
        .map_err(|e| BuildError::io(&path)(e.into()))?;
    std::fs::write(&path, json).map_err(BuildError::io(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ec.bin");
        std::fs::write(&path, b"abc").unwrap();

        let artifact = describe_artifact(&path).unwrap();
        assert_eq!(artifact.name, "ec.bin");
        assert_eq!(artifact.size, 3);
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ec.bin");
        std::fs::write(&path, b"abc").unwrap();
        let artifacts = vec![describe_artifact(&path).unwrap()];

        write_manifest("fatcat", dir.path(), &artifacts).unwrap();
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(value["project"], "fatcat");
        assert_eq!(value["artifacts"][0]["size"], 3);
    }
}
