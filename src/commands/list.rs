use anyhow::Result;
use std::str::FromStr;

use crate::commands::CommandReport;
use crate::tidy::paths::resolve_paths;
use crate::tidy::state::{RunFilter, RunStatus, StateStore};

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub fn run(opts: &ListOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("list");

    let status = match &opts.status {
        Some(raw) => match RunStatus::from_str(raw) {
            Ok(status) => Some(status),
            Err(err) => {
                report.issue(format!("{err:#}"));
                return Ok(report);
            }
        },
        None => None,
    };

    let store = StateStore::new(resolve_paths()?);
    let runs = store.list_runs(&RunFilter {
        status,
        limit: opts.limit.or(Some(10)),
    })?;

    report.detail(format!("runs={}", runs.len()));
    for run in &runs {
        report.detail(format!(
            "{} status={} input={} output={} last_completed_stage={}",
            run.id,
            run.status.as_str(),
            run.input_root,
            run.output_root,
            run.last_completed_stage
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".into())
        ));
    }

    Ok(report)
}
