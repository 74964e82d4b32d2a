use bauleiter::commands::list::render_all;
use bauleiter::result::EXIT_CANCELLED;
use bauleiter::{
    BuildPipeline, ErrorKind, PipelineOptions, ProjectState, RunResult, StepExecutor,
    StepTemplates, ToolPaths, UnitOutcome,
};
use convenient_jobserver::JobTokenPool;
use convenient_process::{Classifier, LogMultiplexer, MemorySink};
use convenient_project::{ProjectRegistry, find_projects};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Build script used as the `build` step: `sh build.sh <project> <unit>`.
/// Unless the case body exits, it leaves zephyr.bin = "<unit>".
fn build_script(cases: &str) -> String {
    format!(
        r#"case "$1:$2" in
{cases}
esac
mkdir -p zephyr
printf '%s' "$2" > zephyr/zephyr.bin
printf 'ELF-%s' "$2" > zephyr/zephyr.elf
echo "built $1:$2"
"#
    )
}

struct Fixture {
    dir: TempDir,
    registry: Arc<ProjectRegistry>,
    sink: MemorySink,
    pool: JobTokenPool,
    cancel: CancellationToken,
}

impl Fixture {
    fn new(descriptors: &str, cases: &str, jobs: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("program");
        std::fs::create_dir_all(&program).unwrap();
        std::fs::write(program.join("BUILD.yml"), descriptors).unwrap();
        std::fs::write(dir.path().join("build.sh"), build_script(cases)).unwrap();

        let registry = Arc::new(find_projects(&[dir.path()]).unwrap());
        Self {
            dir,
            registry,
            sink: MemorySink::new(),
            pool: JobTokenPool::server(jobs).unwrap(),
            cancel: CancellationToken::new(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn pipeline(&self, keep_going: bool, tools: ToolPaths) -> BuildPipeline {
        let steps = StepTemplates {
            configure: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo configuring {project}:{unit} for {board} with {toolchain}".to_string(),
            ],
            build: vec![
                "sh".to_string(),
                self.path().join("build.sh").display().to_string(),
                "{project}".to_string(),
                "{unit}".to_string(),
            ],
        };
        let options = PipelineOptions {
            build_dir: self.path().join("build"),
            source_dir: self.path().to_path_buf(),
            modules: BTreeMap::from([("ec".to_string(), self.path().to_path_buf())]),
            steps,
            keep_going,
            clobber: false,
            delete_intermediates: false,
            toolchain: None,
        };
        let executor = StepExecutor::new(self.pool.clone(), tools, None, self.cancel.clone());
        let mux = LogMultiplexer::new(self.sink.clone(), Classifier::default());
        BuildPipeline::new(self.registry.clone(), executor, mux, options)
    }

    async fn run(&self, keep_going: bool, selectors: &[&str]) -> RunResult {
        let ids = self.registry.resolve(selectors, false).unwrap();
        self.pipeline(keep_going, ToolPaths::default()).run(&ids).await
    }

    fn output(&self, project: &str, file: &str) -> PathBuf {
        self.path().join("build").join(project).join("output").join(file)
    }
}

fn project(name: &str, packer: &str) -> String {
    format!("  - name: {name}\n    board: npcx9\n    toolchains: [llvm]\n    packer: {packer}\n")
}

fn descriptors(projects: &[String]) -> String {
    format!("projects:\n{}", projects.concat())
}

#[tokio::test]
async fn test_failed_unit_is_attributed_to_its_project() {
    let fixture = Fixture::new(
        &descriptors(&[project("A", "concat"), project("B", "concat")]),
        r#"  A:rw) echo "rw.c:1: error: boom"; exit 1 ;;"#,
        2,
    );

    let result = fixture.run(true, &["A", "B"]).await;

    assert_eq!(result.failed_projects(), vec!["A"]);
    assert_eq!(result.exit_code(false), 1);
    assert!(result.to_string().contains("Failed: A\n"));

    let a = result.project("A").unwrap();
    assert_eq!(a.state, ProjectState::Failed);
    assert_eq!(a.error_kind, Some(ErrorKind::BuildFailure));
    assert!(a.artifacts.is_empty());
    let rw = a.units.iter().find(|u| u.unit == "rw").unwrap();
    assert_eq!(rw.outcome, UnitOutcome::Failed);
    assert_eq!(rw.exit_code, Some(1));
    assert!(rw.diagnostics.iter().any(|d| d.text == "rw.c:1: error: boom"));
    let ro = a.units.iter().find(|u| u.unit == "ro").unwrap();
    assert_eq!(ro.outcome, UnitOutcome::Succeeded);

    let b = result.project("B").unwrap();
    assert_eq!(b.state, ProjectState::Succeeded);
    assert_eq!(std::fs::read(fixture.output("B", "ec.bin")).unwrap(), b"rorw");
    assert_eq!(fixture.pool.held(), 0);
}

#[tokio::test]
async fn test_fail_fast_leaves_started_project_alone() {
    let fixture = Fixture::new(
        &descriptors(&[project("A", "concat"), project("B", "concat")]),
        r#"  A:rw) sleep 0.2; echo "rw.c:1: error: boom"; exit 1 ;;
  B:*) sleep 0.6 ;;"#,
        4,
    );

    let result = fixture.run(false, &["A", "B"]).await;

    assert_eq!(result.failed_projects(), vec!["A"]);
    assert_eq!(result.exit_code(false), 1);
    assert!(!result.cancelled);

    let a = result.project("A").unwrap();
    assert_eq!(a.state, ProjectState::Failed);
    assert_eq!(a.error_kind, Some(ErrorKind::BuildFailure));
    assert!(a.error.as_deref().unwrap().starts_with("A:rw: build failed"));
    let rw = a.units.iter().find(|u| u.unit == "rw").unwrap();
    assert_eq!(rw.outcome, UnitOutcome::Failed);
    assert_eq!(rw.exit_code, Some(1));

    let b = result.project("B").unwrap();
    assert!(
        matches!(b.state, ProjectState::Succeeded | ProjectState::Cancelled),
        "{:?}",
        b.state
    );
    assert_ne!(b.error_kind, Some(ErrorKind::BuildFailure));
    assert_eq!(fixture.pool.held(), 0);
}

#[tokio::test]
async fn test_project_fails_before_slow_sibling_finishes() {
    let fixture = Fixture::new(
        &descriptors(&[project("J", "concat")]),
        r#"  J:ro) sleep 1 ;;
  J:rw) exit 1 ;;"#,
        2,
    );

    let result = fixture.run(true, &["J"]).await;

    let j = result.project("J").unwrap();
    assert_eq!(j.state, ProjectState::Failed);
    let states: Vec<_> = j.transitions.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            ProjectState::Pending,
            ProjectState::Configuring,
            ProjectState::Building,
            ProjectState::Failed,
        ]
    );
    let building = j.transitions[2].at;
    let failed = j.transitions[3].at;
    assert!((failed - building).num_milliseconds() < 800);
    let ro = j.units.iter().find(|u| u.unit == "ro").unwrap();
    assert_eq!(ro.outcome, UnitOutcome::Succeeded);
    assert!(ro.duration_ms >= 1000);
}

#[tokio::test]
async fn test_fatal_diagnostic_fails_despite_zero_exit() {
    let fixture = Fixture::new(
        &descriptors(&[project("C", "raw")]),
        r#"  C:singleimage) echo "devicetree error: /soc/i2c: missing property" ;;"#,
        2,
    );

    let result = fixture.run(false, &["C"]).await;

    let c = result.project("C").unwrap();
    assert_eq!(c.state, ProjectState::Failed);
    assert_eq!(c.error_kind, Some(ErrorKind::BuildFailure));
    assert_eq!(c.units[0].exit_code, Some(0));
    assert!(c.units[0].diagnostics.iter().any(|d| d.fatal));
    assert!(!fixture.output("C", "ec.bin").exists());
}

#[tokio::test]
async fn test_success_writes_image_and_manifest() {
    let fixture = Fixture::new(&descriptors(&[project("D", "elf")]), "", 2);

    let result = fixture.run(false, &["D"]).await;

    assert!(result.succeeded());
    assert_eq!(result.exit_code(false), 0);
    let d = result.project("D").unwrap();
    let states: Vec<_> = d.transitions.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            ProjectState::Pending,
            ProjectState::Configuring,
            ProjectState::Building,
            ProjectState::Packing,
            ProjectState::Signing,
            ProjectState::Succeeded,
        ]
    );

    assert_eq!(d.artifacts.len(), 1);
    assert_eq!(d.artifacts[0].name, "zephyr.elf");
    assert_eq!(d.artifacts[0].size, "ELF-singleimage".len() as u64);

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fixture.output("D", "manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["project"], "D");
    assert_eq!(manifest["artifacts"][0]["sha256"], d.artifacts[0].sha256.as_str());

    let unit_dir = fixture.path().join("build/D/build-singleimage");
    assert!(unit_dir.join("resolved.conf").is_file());
    assert!(unit_dir.join("overlays.txt").is_file());
}

#[tokio::test]
async fn test_log_barrier_covers_all_output() {
    let fixture = Fixture::new(&descriptors(&[project("E", "concat")]), "", 2);

    let result = fixture.run(false, &["E"]).await;
    assert!(result.succeeded());

    for unit in ["ro", "rw"] {
        let records = fixture.sink.records_for(&format!("E:{unit}"));
        assert_eq!(records[0].text, "Configuring.");
        assert!(records
            .iter()
            .any(|r| r.text == format!("configuring E:{unit} for npcx9 with llvm")));
        assert_eq!(records.last().unwrap().text, format!("built E:{unit}"));
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn test_fail_fast_cancels_projects_that_did_not_start() {
    let bad = format!("{}    modules: [nope]\n", project("bad", "raw"));
    let mut projects = vec![bad];
    projects.extend((1..=4).map(|i| project(&format!("good{i}"), "raw")));
    let fixture = Fixture::new(&descriptors(&projects), "  *) sleep 0.2 ;;", 1);

    let result = fixture.run(false, &["bad", "good*"]).await;

    let bad = result.project("bad").unwrap();
    assert_eq!(bad.state, ProjectState::Failed);
    assert_eq!(bad.error_kind, Some(ErrorKind::Configuration));
    assert!(bad.units.is_empty());

    assert_eq!(result.failed_projects(), vec!["bad"]);
    let cancelled = result.cancelled_projects();
    assert!(cancelled.len() >= 3, "cancelled: {cancelled:?}");
    for name in cancelled {
        let error = result.project(name).unwrap().error.clone().unwrap();
        assert!(error.contains("aborted after failure of bad"), "{error}");
    }
    assert_eq!(result.exit_code(false), 1);
    assert!(!result.cancelled);
}

#[tokio::test]
async fn test_keep_going_builds_everything_else() {
    let bad = format!("{}    modules: [nope]\n", project("bad", "raw"));
    let mut projects = vec![bad];
    projects.extend((1..=4).map(|i| project(&format!("good{i}"), "raw")));
    let fixture = Fixture::new(&descriptors(&projects), "", 1);

    let result = fixture.run(true, &["bad", "good*"]).await;

    assert_eq!(result.failed_projects(), vec!["bad"]);
    assert!(result.cancelled_projects().is_empty());
    for i in 1..=4 {
        let name = format!("good{i}");
        assert_eq!(result.project(&name).unwrap().state, ProjectState::Succeeded);
    }
    assert!(fixture.pool.high_water() <= 1);
}

#[tokio::test]
async fn test_operator_cancel_stops_running_steps() {
    let fixture = Fixture::new(
        &descriptors(&[project("F", "concat"), project("G", "concat")]),
        "  *) sleep 30 ;;",
        2,
    );

    let cancel = fixture.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let result = fixture.run(true, &["F", "G"]).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.cancelled);
    assert!(result.failed_projects().is_empty());
    assert_eq!(result.cancelled_projects(), vec!["F", "G"]);
    assert_eq!(result.exit_code(false), EXIT_CANCELLED);
    assert_eq!(result.exit_code(true), 1);
    assert_eq!(fixture.pool.held(), 0);
    assert!(fixture.pool.is_shut_down());
}

#[tokio::test]
async fn test_rwsig_signer_runs_futility() {
    let descriptor = format!(
        "{}    signer: rwsig\n    signing_key: key.pem\n",
        project("H", "raw")
    );
    let fixture = Fixture::new(&descriptors(&[descriptor]), "", 2);
    std::fs::write(fixture.path().join("program/key.pem"), "key").unwrap();

    let futility = fixture.path().join("futility");
    std::fs::write(
        &futility,
        "#!/bin/sh\nfor image; do :; done\nprintf '%s' '-signed' >> \"$image\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&futility, std::fs::Permissions::from_mode(0o755)).unwrap();
    let tools = ToolPaths::from_parts(
        &BTreeMap::from([("futility".to_string(), futility)]),
        Vec::new(),
    );

    let ids = fixture.registry.resolve(&["H"], false).unwrap();
    let result = fixture.pipeline(false, tools).run(&ids).await;

    assert!(result.succeeded(), "{result}");
    assert_eq!(
        std::fs::read(fixture.output("H", "ec.bin")).unwrap(),
        b"singleimage-signed"
    );
    let h = result.project("H").unwrap();
    assert_eq!(h.artifacts[0].size, "singleimage-signed".len() as u64);
}

#[tokio::test]
async fn test_missing_tool_is_a_launch_error() {
    let fixture = Fixture::new(&descriptors(&[project("I", "raw")]), "", 2);
    let tools = ToolPaths::from_parts(
        &BTreeMap::from([("sh".to_string(), PathBuf::from("/nonexistent/sh"))]),
        Vec::new(),
    );

    let ids = fixture.registry.resolve(&["I"], false).unwrap();
    let result = fixture.pipeline(false, tools).run(&ids).await;

    let i = result.project("I").unwrap();
    assert_eq!(i.state, ProjectState::Failed);
    assert_eq!(i.error_kind, Some(ErrorKind::Launch));
    assert_eq!(fixture.pool.held(), 0);
}

#[tokio::test]
async fn test_list_projects_template() {
    let fixture = Fixture::new(
        &descriptors(&[project("alpha", "raw"), project("beta", "concat")]),
        "",
        1,
    );

    let all = render_all(&fixture.registry, &[], "{name}\\t{board}\\t{packer}\\n").unwrap();
    assert_eq!(all, "alpha\tnpcx9\traw\nbeta\tnpcx9\tconcat\n");

    let one = render_all(&fixture.registry, &["b*".to_string()], "{name}:{program}").unwrap();
    assert_eq!(one, "beta:program");

    assert!(render_all(&fixture.registry, &["zeta".to_string()], "{name}").is_err());
}
