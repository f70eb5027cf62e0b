use anyhow::Result;

use crate::commands::CommandReport;
use crate::tidy::monitor::ProcessMonitor;
use crate::tidy::paths::resolve_paths;
use crate::tidy::state::StateStore;

pub fn run(run_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("pause");

    let monitor = ProcessMonitor::new(StateStore::new(resolve_paths()?));
    match monitor.request_pause(run_id) {
        Ok(()) => {
            report.detail(format!("run_id={run_id}"));
            report.detail("pause requested; takes effect at the next stage boundary");
        }
        Err(err) => report.issue(format!("{err:#}")),
    }

    Ok(report)
}
