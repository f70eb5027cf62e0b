use anyhow::Result;

use crate::commands::CommandReport;
use crate::tidy::engine::PipelineEngine;
use crate::tidy::paths::resolve_paths;
use crate::tidy::util::truncate_with_ellipsis;

pub fn run(run_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");

    let engine = PipelineEngine::new(resolve_paths()?);
    let (run, stages) = match engine.status(run_id) {
        Ok(pair) => pair,
        Err(err) => {
            report.issue(format!("{err:#}"));
            return Ok(report);
        }
    };

    report.detail(format!("run_id={}", run.id));
    report.detail(format!("status={}", run.status.as_str()));
    report.detail(format!("input_root={}", run.input_root));
    report.detail(format!("output_root={}", run.output_root));
    report.detail(format!(
        "last_completed_stage={}",
        run.last_completed_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".into())
    ));
    if let Some(error) = &run.error {
        report.detail(format!("error={}", truncate_with_ellipsis(error, 200)));
    }

    let total = engine.stage_names().len();
    let completed = stages
        .iter()
        .filter(|s| s.status == crate::tidy::state::StageStatus::Completed)
        .count();
    report.detail(format!("progress={completed}/{total}"));

    for stage in &stages {
        let mut line = format!(
            "stage[{}] {} status={} in={} out={} errors={} attempts={}",
            stage.stage_index,
            stage.stage_name,
            stage.status.as_str(),
            stage.input_items,
            stage.output_items,
            stage.error_count,
            stage.attempts
        );
        if let Some(error) = &stage.error {
            line.push_str(&format!(" error={}", truncate_with_ellipsis(error, 120)));
        }
        report.detail(line);
    }

    Ok(report)
}
