use anyhow::Result;

use crate::commands::CommandReport;
use crate::tidy::engine::PipelineEngine;
use crate::tidy::paths::resolve_paths;
use crate::tidy::util::truncate_with_ellipsis;

#[derive(Debug, Clone, Default)]
pub struct RunStageOptions {
    pub run_id: String,
    pub stage: String,
    pub force: bool,
}

pub fn run(opts: &RunStageOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("run-stage");

    let engine = PipelineEngine::new(resolve_paths()?);
    let stage_index = match engine.resolve_stage(&opts.stage) {
        Ok(index) => index,
        Err(err) => {
            report.issue(format!("{err:#}"));
            return Ok(report);
        }
    };

    let record = engine.run_stage(&opts.run_id, stage_index, opts.force)?;
    report.detail(format!("run_id={}", opts.run_id));
    report.detail(format!(
        "stage={} index={}",
        record.stage_name, record.stage_index
    ));
    report.detail(format!("status={}", record.status.as_str()));
    report.detail(format!("attempts={}", record.attempts));
    report.detail(format!(
        "items in={} out={} errors={}",
        record.input_items, record.output_items, record.error_count
    ));
    if let Some(error) = &record.error {
        report.issue(format!("error={}", truncate_with_ellipsis(error, 200)));
    }

    Ok(report)
}
