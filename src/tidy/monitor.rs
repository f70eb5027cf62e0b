use crate::error::RunFailureKind;
use crate::tidy::audit;
use crate::tidy::state::{
    ControlFlags, RunStatus, StageStatus, StateStore, write_json_atomic,
};
use crate::tidy::util::{now_epoch_secs, pid_alive};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

/// Liveness metadata for an actively executing run. Exists only while the
/// owning process runs; a stale record found later marks the run crashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub run_id: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at_epoch_secs: u64,
    pub heartbeat_epoch_secs: u64,
}

/// "Is this pid alive" as an injectable capability, so orphan detection is
/// testable without killing real processes.
pub trait ProcessProbe {
    fn alive(&self, pid: u32) -> bool;
}

pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }
}

/// Held by the engine for the duration of a run. Dropping it releases the
/// fs2 lock; `end_monitoring` also removes the liveness record.
pub struct MonitorHandle {
    run_id: String,
    record_path: PathBuf,
    lock_path: PathBuf,
    _lock: File,
}

impl MonitorHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub struct ProcessMonitor {
    store: StateStore,
    probe: Box<dyn ProcessProbe>,
}

impl ProcessMonitor {
    pub fn new(store: StateStore) -> Self {
        Self::with_probe(store, Box::new(SystemProbe))
    }

    pub fn with_probe(store: StateStore, probe: Box<dyn ProcessProbe>) -> Self {
        Self { store, probe }
    }

    pub fn begin_monitoring(&self, run_id: &str) -> Result<MonitorHandle> {
        let paths = self.store.paths();
        fs::create_dir_all(&paths.processes_dir)
            .with_context(|| format!("failed to create {}", paths.processes_dir.display()))?;

        let lock_path = paths.process_lock_file(run_id);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!("run {run_id} appears to be active in another process")
        })?;

        let now = now_epoch_secs()?;
        let record = ProcessRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            hostname: hostname(),
            started_at_epoch_secs: now,
            heartbeat_epoch_secs: now,
        };
        let record_path = paths.process_file(run_id);
        write_json_atomic(&record_path, &record)?;

        Ok(MonitorHandle {
            run_id: run_id.to_string(),
            record_path,
            lock_path,
            _lock: lock,
        })
    }

    pub fn heartbeat(&self, handle: &MonitorHandle) -> Result<()> {
        let mut record = self.read_process_record(&handle.run_id)?.with_context(|| {
            format!("liveness record for run {} disappeared", handle.run_id)
        })?;
        record.heartbeat_epoch_secs = now_epoch_secs()?;
        write_json_atomic(&handle.record_path, &record)
    }

    pub fn end_monitoring(&self, handle: MonitorHandle) -> Result<()> {
        match fs::remove_file(&handle.record_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to remove {}", handle.record_path.display())
                });
            }
        }
        let _ = fs::remove_file(&handle.lock_path);
        Ok(())
    }

    pub fn read_process_record(&self, run_id: &str) -> Result<Option<ProcessRecord>> {
        let path = self.store.paths().process_file(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let record: ProcessRecord = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// Walk every run stuck in `running` and fail the ones whose holder is
    /// provably gone: no liveness record, a dead pid, or a heartbeat older
    /// than `stale_after_secs`. This is what makes a later resume safe.
    pub fn scan_for_orphans(&self, stale_after_secs: u64) -> Result<Vec<String>> {
        let now = now_epoch_secs()?;
        let running = self.store.list_runs(&crate::tidy::state::RunFilter {
            status: Some(RunStatus::Running),
            limit: None,
        })?;

        let mut orphaned = Vec::new();
        for summary in running {
            let verdict = match self.read_process_record(&summary.id)? {
                None => Some("no liveness record for running run".to_string()),
                Some(record) if !self.probe.alive(record.pid) => {
                    Some(format!("holder pid {} is no longer alive", record.pid))
                }
                Some(record)
                    if now.saturating_sub(record.heartbeat_epoch_secs) > stale_after_secs =>
                {
                    Some(format!(
                        "heartbeat is {}s old (threshold {}s)",
                        now.saturating_sub(record.heartbeat_epoch_secs),
                        stale_after_secs
                    ))
                }
                Some(_) => None,
            };

            let Some(reason) = verdict else {
                continue;
            };

            self.fail_interrupted_stage(&summary.id, &reason)?;
            self.store.update_run_status(
                &summary.id,
                RunStatus::Failed,
                Some(&RunFailureKind::Orphaned.tag(&reason)),
            )?;
            let paths = self.store.paths();
            let _ = fs::remove_file(paths.process_file(&summary.id));
            let _ = fs::remove_file(paths.process_lock_file(&summary.id));
            audit::append_event(paths, &summary.id, "monitor", "orphaned", &reason)?;
            orphaned.push(summary.id);
        }
        Ok(orphaned)
    }

    /// The interrupted stage gets a failed record so resume re-executes
    /// exactly it and nothing before it.
    fn fail_interrupted_stage(&self, run_id: &str, reason: &str) -> Result<()> {
        for mut record in self.store.list_stage_records(run_id)? {
            if record.status == StageStatus::Running {
                record.status = StageStatus::Failed;
                record.completed_at_epoch_secs = Some(now_epoch_secs()?);
                record.error = Some(RunFailureKind::Orphaned.tag(reason));
                record.error_count += 1;
                self.store.write_stage_record(run_id, &record)?;
                break;
            }
        }
        Ok(())
    }

    pub fn request_pause(&self, run_id: &str) -> Result<()> {
        self.store.require_run(run_id)?;
        let mut flags = self.store.read_control(run_id)?;
        flags.pause_requested = true;
        self.store.write_control(run_id, &flags)?;
        audit::append_event(self.store.paths(), run_id, "monitor", "pause_requested", "")?;
        Ok(())
    }

    pub fn request_cancel(&self, run_id: &str) -> Result<()> {
        self.store.require_run(run_id)?;
        let mut flags = self.store.read_control(run_id)?;
        flags.cancel_requested = true;
        self.store.write_control(run_id, &flags)?;
        audit::append_event(self.store.paths(), run_id, "monitor", "cancel_requested", "")?;
        Ok(())
    }

    pub fn clear_flags(&self, run_id: &str) -> Result<()> {
        self.store.write_control(run_id, &ControlFlags::default())
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessMonitor, ProcessProbe, ProcessRecord};
    use crate::tidy::config::TidyConfig;
    use crate::tidy::paths::TidyPaths;
    use crate::tidy::state::{RunStatus, StageRecord, StageStatus, StateStore, write_json_atomic};
    use crate::tidy::util::now_epoch_secs;
    use std::path::Path;

    struct DeadProbe;

    impl ProcessProbe for DeadProbe {
        fn alive(&self, _pid: u32) -> bool {
            false
        }
    }

    struct LiveProbe;

    impl ProcessProbe for LiveProbe {
        fn alive(&self, _pid: u32) -> bool {
            true
        }
    }

    fn test_store(root: &Path) -> StateStore {
        let state_home = root.join("state");
        StateStore::new(TidyPaths {
            runs_dir: state_home.join("runs"),
            stages_dir: state_home.join("stages"),
            processes_dir: state_home.join("processes"),
            control_dir: state_home.join("control"),
            cache_dir: state_home.join("cache"),
            logs_dir: state_home.join("logs"),
            state_home,
        })
    }

    fn running_run_with_dead_holder(store: &StateStore) -> String {
        let run = store
            .create_run(Path::new("/in"), Path::new("/out"), &TidyConfig::default())
            .expect("create run");
        store
            .update_run_status(&run.id, RunStatus::Running, None)
            .expect("set running");

        let now = now_epoch_secs().expect("clock");
        let record = ProcessRecord {
            run_id: run.id.clone(),
            pid: 4_000_000,
            hostname: "test".into(),
            started_at_epoch_secs: now,
            heartbeat_epoch_secs: now,
        };
        write_json_atomic(&store.paths().process_file(&run.id), &record).expect("process record");
        run.id
    }

    #[test]
    fn orphan_scan_fails_runs_with_dead_holders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = test_store(tmp.path());
        let run_id = running_run_with_dead_holder(&store);

        let monitor = ProcessMonitor::with_probe(store.clone(), Box::new(DeadProbe));
        let orphans = monitor.scan_for_orphans(300).expect("scan");
        assert_eq!(orphans, vec![run_id.clone()]);

        let run = store.require_run(&run_id).expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap_or("").starts_with("orphaned:"));
        assert!(!store.paths().process_file(&run_id).exists());
    }

    #[test]
    fn orphan_scan_marks_the_interrupted_stage_failed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = test_store(tmp.path());
        let run_id = running_run_with_dead_holder(&store);

        for (index, name, status) in [
            (0usize, "discover", StageStatus::Completed),
            (1usize, "resolve-dates", StageStatus::Running),
        ] {
            let record = StageRecord {
                stage_index: index,
                stage_name: name.to_string(),
                status,
                started_at_epoch_secs: 1,
                completed_at_epoch_secs: None,
                input_items: 0,
                output_items: 0,
                error_count: 0,
                attempts: 1,
                error: None,
                payload: None,
            };
            store.write_stage_record(&run_id, &record).expect("write");
        }

        let monitor = ProcessMonitor::with_probe(store.clone(), Box::new(DeadProbe));
        monitor.scan_for_orphans(300).expect("scan");

        let stages = store.list_stage_records(&run_id).expect("list");
        assert_eq!(stages[0].status, StageStatus::Completed);
        assert_eq!(stages[1].status, StageStatus::Failed);
        assert!(
            stages[1]
                .error
                .as_deref()
                .unwrap_or("")
                .starts_with("orphaned:")
        );
    }

    #[test]
    fn fresh_heartbeats_survive_the_scan() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = test_store(tmp.path());
        let run_id = running_run_with_dead_holder(&store);

        let monitor = ProcessMonitor::with_probe(store.clone(), Box::new(LiveProbe));
        let orphans = monitor.scan_for_orphans(300).expect("scan");
        assert!(orphans.is_empty());
        assert_eq!(
            store.require_run(&run_id).expect("run").status,
            RunStatus::Running
        );
    }

    #[test]
    fn stale_heartbeats_orphan_even_with_a_live_pid() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = test_store(tmp.path());
        let run_id = running_run_with_dead_holder(&store);

        let mut record = ProcessMonitor::new(store.clone())
            .read_process_record(&run_id)
            .expect("read")
            .expect("present");
        record.heartbeat_epoch_secs = 1;
        write_json_atomic(&store.paths().process_file(&run_id), &record).expect("rewrite");

        let monitor = ProcessMonitor::with_probe(store.clone(), Box::new(LiveProbe));
        let orphans = monitor.scan_for_orphans(300).expect("scan");
        assert_eq!(orphans, vec![run_id]);
    }

    #[test]
    fn begin_monitoring_rejects_a_second_holder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = test_store(tmp.path());
        let monitor = ProcessMonitor::new(store.clone());

        let handle = monitor.begin_monitoring("run1").expect("first holder");
        assert!(monitor.begin_monitoring("run1").is_err());
        monitor.end_monitoring(handle).expect("release");

        let handle2 = monitor.begin_monitoring("run1").expect("after release");
        monitor.end_monitoring(handle2).expect("release again");
    }
}
