use anyhow::Result;
use std::path::Path;

use crate::commands::CommandReport;
use crate::tidy::config::load_config;
use crate::tidy::engine::{PipelineEngine, RunOutcome};
use crate::tidy::paths::resolve_paths;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub input_root: String,
    pub output_root: String,
    pub dry_run: bool,
    pub verbose: bool,
}

pub fn run(opts: &StartOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("start");

    let mut config = load_config()?;
    config.dry_run = opts.dry_run;
    config.verbose = opts.verbose;

    let paths = resolve_paths()?;
    let engine = PipelineEngine::new(paths);

    let run = match engine.start_run(
        Path::new(&opts.input_root),
        Path::new(&opts.output_root),
        &config,
    ) {
        Ok(run) => run,
        Err(err) => {
            report.issue(format!("failed to start run: {err:#}"));
            return Ok(report);
        }
    };

    report.detail(format!("run_id={}", run.id));
    report.detail(format!("input_root={}", run.input_root));
    report.detail(format!("output_root={}", run.output_root));
    report.detail(format!("dry_run={}", config.dry_run));

    match engine.execute_from(&run.id, 0)? {
        RunOutcome::Completed => report.detail("outcome=completed"),
        RunOutcome::Paused { next_stage } => {
            report.detail(format!("outcome=paused next_stage={next_stage}"));
        }
        RunOutcome::Cancelled => report.issue("outcome=cancelled"),
        RunOutcome::Failed { stage_index, error } => {
            report.issue(format!("outcome=failed stage={stage_index} error={error}"));
        }
    }

    Ok(report)
}
