use anyhow::Result;

use crate::commands::CommandReport;
use crate::tidy::config::load_config;
use crate::tidy::monitor::ProcessMonitor;
use crate::tidy::paths::resolve_paths;
use crate::tidy::state::StateStore;

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("cancel-orphans");

    let config = load_config()?;
    let monitor = ProcessMonitor::new(StateStore::new(resolve_paths()?));
    let orphans = monitor.scan_for_orphans(config.pipeline.heartbeat_stale_secs)?;

    report.detail(format!("orphaned_runs={}", orphans.len()));
    for run_id in &orphans {
        report.detail(format!("marked failed: {run_id}"));
    }
    if orphans.is_empty() {
        report.detail("no stale running runs found");
    }

    Ok(report)
}
