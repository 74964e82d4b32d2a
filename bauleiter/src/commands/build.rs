//! `bauleiter build`

use super::BuildArgs;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::{BuildPipeline, PipelineOptions};
use crate::result::RunResult;
use crate::settings::{Settings, ToolPaths};
use crate::signals::cancel_on_signal;
use crate::steps::StepExecutor;
use convenient_jobserver::JobTokenPool;
use convenient_process::{LogMultiplexer, TracingSink};
use convenient_project::find_projects;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolve, build, report. Returns the process exit code.
pub async fn execute(mut settings: Settings, args: &BuildArgs) -> BuildResult<i32> {
    if args.keep_going {
        settings.keep_going = true;
    }

    // Selection problems abort before anything runs.
    let registry = Arc::new(find_projects(&settings.search_dirs)?);
    let ids = registry.resolve(&args.selectors, args.all)?;
    info!("Selected {} of {} projects", ids.len(), registry.len());

    let tools = ToolPaths::from_settings(&settings);
    let pool = JobTokenPool::from_mode(settings.jobserver.into(), settings.jobs)?;
    let mux = LogMultiplexer::new(TracingSink, settings.classifier()?);

    let cancel = CancellationToken::new();
    // Stays installed through reporting; a second interrupt exits the process.
    if let Err(e) = cancel_on_signal(cancel.clone()) {
        warn!("Cannot install signal handlers: {}", e);
    }
    let executor = StepExecutor::new(pool, tools, settings.timeout(), cancel);

    let mut options = PipelineOptions::from_settings(&settings);
    options.clobber = args.clobber;
    options.delete_intermediates = args.delete_intermediates;
    options.toolchain = args.toolchain.clone();

    let result = BuildPipeline::new(registry, executor, mux, options)
        .run(&ids)
        .await;

    finish(&result, args, &settings)
}

fn finish(result: &RunResult, args: &BuildArgs, settings: &Settings) -> BuildResult<i32> {
    eprintln!();
    eprintln!("{result}");
    if let Some(path) = &args.report {
        result.write_report(path).map_err(BuildError::io(path))?;
        info!("Report written to {}", path.display());
    }
    Ok(result.exit_code(settings.cancelled_is_failure))
}
