use crate::error::{RunFailureKind, StageError};
use crate::tidy::albums::ReconcileAlbumsStage;
use crate::tidy::audit;
use crate::tidy::config::TidyConfig;
use crate::tidy::dates::ResolveDatesStage;
use crate::tidy::dedup::DedupStage;
use crate::tidy::discover::DiscoverStage;
use crate::tidy::exif::{ExifToolClient, WriteMetadataStage};
use crate::tidy::monitor::{MonitorHandle, ProcessMonitor};
use crate::tidy::organize::OrganizeStage;
use crate::tidy::paths::TidyPaths;
use crate::tidy::stage::{Stage, StageContext, StagePayload};
use crate::tidy::state::{
    RunRecord, RunStatus, StageRecord, StageStatus, StateStore,
};
use crate::tidy::timestamps::{PlatformTimestamps, SetTimestampsStage};
use crate::tidy::util::now_epoch_secs;
use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// How a (partial) pipeline execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Paused { next_stage: usize },
    Cancelled,
    Failed { stage_index: usize, error: String },
}

/// Orders and executes stages, enforcing dependency, resume, and
/// idempotence rules. Stage sequencing is strictly single-threaded;
/// parallelism lives inside stage bodies.
pub struct PipelineEngine {
    store: StateStore,
    monitor: ProcessMonitor,
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineEngine {
    pub fn new(paths: TidyPaths) -> Self {
        let exif = ExifToolClient::locate();
        let store = StateStore::new(paths);
        let monitor = ProcessMonitor::new(store.clone());
        Self {
            store,
            monitor,
            stages: vec![
                Box::new(DiscoverStage),
                Box::new(ResolveDatesStage { exif: exif.clone() }),
                Box::new(DedupStage),
                Box::new(WriteMetadataStage { exif }),
                Box::new(ReconcileAlbumsStage),
                Box::new(OrganizeStage),
                Box::new(SetTimestampsStage {
                    service: PlatformTimestamps,
                }),
            ],
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Accepts either a stage name or a numeric index.
    pub fn resolve_stage(&self, stage: &str) -> Result<usize> {
        let trimmed = stage.trim();
        if let Ok(index) = trimmed.parse::<usize>() {
            if index < self.stages.len() {
                return Ok(index);
            }
            bail!(
                "stage index {index} out of range (0..{})",
                self.stages.len() - 1
            );
        }
        self.stages
            .iter()
            .position(|s| s.name() == trimmed)
            .with_context(|| {
                format!(
                    "unknown stage `{trimmed}`; expected one of: {}",
                    self.stage_names().join(", ")
                )
            })
    }

    /// Create a run. Validates preconditions before anything durable is
    /// started so a bad invocation never leaves a half-born run.
    pub fn start_run(
        &self,
        input_root: &Path,
        output_root: &Path,
        config: &TidyConfig,
    ) -> Result<RunRecord> {
        if !input_root.is_dir() {
            bail!(
                "input root is missing or not a directory: {}",
                input_root.display()
            );
        }
        let run = self.store.create_run(input_root, output_root, config)?;
        audit::append_event(
            self.store.paths(),
            &run.id,
            "engine",
            "created",
            &format!(
                "input={} output={}",
                run.input_root, run.output_root
            ),
        )?;
        Ok(run)
    }

    /// Execute stages `from..` under liveness monitoring, observing
    /// pause/cancel flags only at stage boundaries.
    pub fn execute_from(&self, run_id: &str, from: usize) -> Result<RunOutcome> {
        self.store.require_run(run_id)?;
        let handle = self.monitor.begin_monitoring(run_id)?;
        self.store
            .update_run_status(run_id, RunStatus::Running, None)?;
        audit::append_event(
            self.store.paths(),
            run_id,
            "engine",
            "running",
            &format!("from_stage={from}"),
        )?;

        let outcome = self.run_stages_monitored(run_id, from, &handle);
        self.monitor.end_monitoring(handle)?;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // A store or monitor failure must not leave the run stuck
                // in `running`; preserve the error and surface it.
                let tagged = RunFailureKind::StageFailed.tag(&format!("{err:#}"));
                let _ = self
                    .store
                    .update_run_status(run_id, RunStatus::Failed, Some(&tagged));
                return Err(err);
            }
        };

        match &outcome {
            RunOutcome::Completed => {
                self.store
                    .update_run_status(run_id, RunStatus::Completed, None)?;
                audit::append_event(self.store.paths(), run_id, "engine", "completed", "")?;
            }
            RunOutcome::Paused { next_stage } => {
                self.store
                    .update_run_status(run_id, RunStatus::Paused, None)?;
                audit::append_event(
                    self.store.paths(),
                    run_id,
                    "engine",
                    "paused",
                    &format!("next_stage={next_stage}"),
                )?;
            }
            RunOutcome::Cancelled => {
                let error = RunFailureKind::Cancelled.tag("by operator");
                self.store
                    .update_run_status(run_id, RunStatus::Failed, Some(&error))?;
                audit::append_event(self.store.paths(), run_id, "engine", "cancelled", "")?;
            }
            RunOutcome::Failed { stage_index, error } => {
                let tagged = RunFailureKind::StageFailed
                    .tag(&format!("stage {stage_index}: {error}"));
                self.store
                    .update_run_status(run_id, RunStatus::Failed, Some(&tagged))?;
                audit::append_event(self.store.paths(), run_id, "engine", "failed", &tagged)?;
            }
        }
        Ok(outcome)
    }

    fn run_stages_monitored(
        &self,
        run_id: &str,
        from: usize,
        handle: &MonitorHandle,
    ) -> Result<RunOutcome> {
        for index in from..self.stages.len() {
            self.monitor.heartbeat(handle)?;

            let flags = self.store.read_control(run_id)?;
            if flags.cancel_requested {
                return Ok(RunOutcome::Cancelled);
            }
            if flags.pause_requested {
                return Ok(RunOutcome::Paused { next_stage: index });
            }

            let record = self.run_stage_inner(run_id, index, false)?;
            if record.status != StageStatus::Completed {
                return Ok(RunOutcome::Failed {
                    stage_index: index,
                    error: record.error.unwrap_or_else(|| "unknown error".into()),
                });
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Run one stage in isolation (the CLI's re-run-this-stage surface).
    /// Takes the run lock so it cannot race a full execution.
    pub fn run_stage(&self, run_id: &str, stage_index: usize, force: bool) -> Result<StageRecord> {
        self.store.require_run(run_id)?;
        let handle = self.monitor.begin_monitoring(run_id)?;
        let result = self.run_stage_inner(run_id, stage_index, force);
        self.monitor.end_monitoring(handle)?;
        let record = result?;
        if record.status == StageStatus::Failed {
            let error = record.error.clone().unwrap_or_else(|| "unknown error".into());
            self.store.update_run_status(
                run_id,
                RunStatus::Failed,
                Some(&RunFailureKind::StageFailed.tag(&format!("stage {stage_index}: {error}"))),
            )?;
        }
        Ok(record)
    }

    fn run_stage_inner(
        &self,
        run_id: &str,
        stage_index: usize,
        force: bool,
    ) -> Result<StageRecord> {
        let run = self.store.require_run(run_id)?;
        let stage = self
            .stages
            .get(stage_index)
            .with_context(|| format!("no stage at index {stage_index}"))?;

        // Idempotence: a completed stage is a cached no-op unless forced.
        if !force {
            if let Some(existing) = self.store.read_stage_record(run_id, stage_index)? {
                if existing.status == StageStatus::Completed {
                    audit::append_event(
                        self.store.paths(),
                        run_id,
                        stage.name(),
                        "cached",
                        "returning previously completed record",
                    )?;
                    return Ok(existing);
                }
            }
        }

        // Dependency rule: never guess. Each declared dependency must have
        // a completed record, and its payload is the only input handed over.
        let mut inputs: BTreeMap<usize, StagePayload> = BTreeMap::new();
        for dep in stage.dependencies(stage_index) {
            let dep_record = self
                .store
                .read_stage_record(run_id, dep)?
                .filter(|r| r.status == StageStatus::Completed)
                .with_context(|| {
                    format!(
                        "missing dependency: stage {dep} has not completed for run {run_id}"
                    )
                })?;
            let payload = dep_record.payload.with_context(|| {
                format!("stage {dep} completed without a payload for run {run_id}")
            })?;
            inputs.insert(dep, payload);
        }

        let started_at = now_epoch_secs()?;
        let mut record = StageRecord {
            stage_index,
            stage_name: stage.name().to_string(),
            status: StageStatus::Running,
            started_at_epoch_secs: started_at,
            completed_at_epoch_secs: None,
            input_items: 0,
            output_items: 0,
            error_count: 0,
            attempts: 0,
            error: None,
            payload: None,
        };
        self.store.write_stage_record(run_id, &record)?;
        audit::append_event(self.store.paths(), run_id, stage.name(), "started", "")?;

        let ctx = StageContext {
            run: &run,
            config: &run.config,
            paths: self.store.paths(),
            inputs,
        };

        let max_attempts = run.config.pipeline.retry_attempts.max(1);
        let mut last_error: Option<StageError> = None;
        for attempt in 1..=max_attempts {
            record.attempts = attempt;
            match stage.execute(&ctx) {
                Ok(output) => {
                    record.status = StageStatus::Completed;
                    record.completed_at_epoch_secs = Some(now_epoch_secs()?);
                    record.input_items = output.input_items;
                    record.output_items = output.output_items;
                    record.error_count = output.error_count;
                    record.error = None;
                    record.payload = Some(output.payload);
                    self.store.write_stage_record(run_id, &record)?;

                    let mut updated = self.store.require_run(run_id)?;
                    if updated
                        .last_completed_stage
                        .is_none_or(|last| last < stage_index)
                    {
                        updated.last_completed_stage = Some(stage_index);
                        self.store.save_run(&updated)?;
                    }
                    audit::append_event(
                        self.store.paths(),
                        run_id,
                        stage.name(),
                        "completed",
                        &format!(
                            "attempts={} in={} out={} errors={}",
                            record.attempts,
                            record.input_items,
                            record.output_items,
                            record.error_count
                        ),
                    )?;
                    return Ok(record);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    audit::append_event(
                        self.store.paths(),
                        run_id,
                        stage.name(),
                        "retrying",
                        &format!("attempt={attempt} error={err}"),
                    )?;
                    thread::sleep(Duration::from_millis(
                        run.config.pipeline.retry_backoff_ms * u64::from(attempt),
                    ));
                    last_error = Some(err);
                }
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown stage failure".into());
        record.status = StageStatus::Failed;
        record.completed_at_epoch_secs = Some(now_epoch_secs()?);
        record.error_count += 1;
        record.error = Some(error.clone());
        record.payload = None;
        self.store.write_stage_record(run_id, &record)?;
        audit::append_event(self.store.paths(), run_id, stage.name(), "failed", &error)?;
        Ok(record)
    }

    /// Continue a paused or failed run at the first incomplete stage (or an
    /// explicit one). Never resumes a run that is still actively held.
    pub fn resume(&self, run_id: &str, from_stage: Option<usize>) -> Result<RunOutcome> {
        let run = self.store.require_run(run_id)?;
        match run.status {
            RunStatus::Running => bail!(
                "run {run_id} is marked running; if it crashed, run `cancel-orphans` first"
            ),
            RunStatus::Completed => return Ok(RunOutcome::Completed),
            RunStatus::Pending | RunStatus::Paused | RunStatus::Failed => {}
        }

        self.monitor.clear_flags(run_id)?;
        let from = match from_stage {
            Some(index) => {
                if index >= self.stages.len() {
                    bail!(
                        "stage index {index} out of range (0..{})",
                        self.stages.len() - 1
                    );
                }
                index
            }
            None => self.first_incomplete_stage(run_id)?,
        };

        if from >= self.stages.len() {
            self.store
                .update_run_status(run_id, RunStatus::Completed, None)?;
            return Ok(RunOutcome::Completed);
        }

        audit::append_event(
            self.store.paths(),
            run_id,
            "engine",
            "resuming",
            &format!("from_stage={from}"),
        )?;
        self.execute_from(run_id, from)
    }

    fn first_incomplete_stage(&self, run_id: &str) -> Result<usize> {
        for index in 0..self.stages.len() {
            let completed = self
                .store
                .read_stage_record(run_id, index)?
                .is_some_and(|r| r.status == StageStatus::Completed);
            if !completed {
                return Ok(index);
            }
        }
        Ok(self.stages.len())
    }

    pub fn status(&self, run_id: &str) -> Result<(RunRecord, Vec<StageRecord>)> {
        let run = self.store.require_run(run_id)?;
        let stages = self.store.list_stage_records(run_id)?;
        Ok((run, stages))
    }
}
