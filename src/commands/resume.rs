use anyhow::Result;

use crate::commands::CommandReport;
use crate::tidy::engine::{PipelineEngine, RunOutcome};
use crate::tidy::paths::resolve_paths;

#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub run_id: String,
    pub from_stage: Option<String>,
}

pub fn run(opts: &ResumeOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("resume");

    let engine = PipelineEngine::new(resolve_paths()?);
    let from_stage = match &opts.from_stage {
        Some(stage) => match engine.resolve_stage(stage) {
            Ok(index) => Some(index),
            Err(err) => {
                report.issue(format!("{err:#}"));
                return Ok(report);
            }
        },
        None => None,
    };

    report.detail(format!("run_id={}", opts.run_id));
    match engine.resume(&opts.run_id, from_stage)? {
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
