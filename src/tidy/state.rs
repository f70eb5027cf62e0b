use crate::tidy::config::TidyConfig;
use crate::tidy::paths::TidyPaths;
use crate::tidy::stage::StagePayload;
use crate::tidy::util::now_epoch_secs;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One end-to-end execution against an (input root, output root, config)
/// triple. Owned by the state store; mutated only through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub schema_version: u32,
    pub id: String,
    pub input_root: String,
    pub output_root: String,
    pub config: TidyConfig,
    pub status: RunStatus,
    pub last_completed_stage: Option<usize>,
    pub created_at_epoch_secs: u64,
    pub completed_at_epoch_secs: Option<u64>,
    pub error: Option<String>,
}

/// One execution attempt of one ordered stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_index: usize,
    pub stage_name: String,
    pub status: StageStatus,
    pub started_at_epoch_secs: u64,
    pub completed_at_epoch_secs: Option<u64>,
    pub input_items: usize,
    pub output_items: usize,
    pub error_count: usize,
    pub attempts: u32,
    pub error: Option<String>,
    pub payload: Option<StagePayload>,
}

/// Cooperative pause/cancel flags, observed by the engine only at stage
/// boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlFlags {
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub input_root: String,
    pub output_root: String,
    pub status: RunStatus,
    pub created_at_epoch_secs: u64,
    pub last_completed_stage: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Write `value` as pretty JSON through a sibling temp file and an atomic
/// rename, so a crash mid-write leaves either the old record or none.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    let data = serde_json::to_string_pretty(value)?;
    tmp.write_all(data.as_bytes())
        .and_then(|_| tmp.write_all(b"\n"))
        .with_context(|| format!("failed to write temp record for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp record for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| anyhow::anyhow!("failed to persist {}: {}", path.display(), err.error))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: T = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

/// Durable source of truth for runs, stage records, and control flags.
/// In-memory copies held elsewhere are caches; nothing is durable until it
/// went through a store write.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: TidyPaths,
}

impl StateStore {
    pub fn new(paths: TidyPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &TidyPaths {
        &self.paths
    }

    fn generate_run_id(&self) -> String {
        let base = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        if !self.paths.run_file(&base).exists() {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.paths.run_file(&candidate).exists() {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn create_run(
        &self,
        input_root: &Path,
        output_root: &Path,
        config: &TidyConfig,
    ) -> Result<RunRecord> {
        let record = RunRecord {
            schema_version: 1,
            id: self.generate_run_id(),
            input_root: input_root.display().to_string(),
            output_root: output_root.display().to_string(),
            config: config.clone(),
            status: RunStatus::Pending,
            last_completed_stage: None,
            created_at_epoch_secs: now_epoch_secs()?,
            completed_at_epoch_secs: None,
            error: None,
        };
        self.save_run(&record)?;
        Ok(record)
    }

    pub fn read_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        read_json(&self.paths.run_file(run_id))
    }

    pub fn require_run(&self, run_id: &str) -> Result<RunRecord> {
        self.read_run(run_id)?
            .with_context(|| format!("run not found: {run_id}"))
    }

    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        write_json_atomic(&self.paths.run_file(&record.id), record)
    }

    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<RunRecord> {
        let mut record = self.require_run(run_id)?;
        record.status = status;
        record.error = error.map(ToOwned::to_owned);
        if status.is_terminal() {
            record.completed_at_epoch_secs = Some(now_epoch_secs()?);
        } else {
            record.completed_at_epoch_secs = None;
        }
        self.save_run(&record)?;
        Ok(record)
    }

    pub fn write_stage_record(&self, run_id: &str, record: &StageRecord) -> Result<PathBuf> {
        let path = self
            .paths
            .stage_file(run_id, record.stage_index, &record.stage_name);
        write_json_atomic(&path, record)?;
        Ok(path)
    }

    pub fn read_stage_record(
        &self,
        run_id: &str,
        stage_index: usize,
    ) -> Result<Option<StageRecord>> {
        let dir = self.paths.run_stages_dir(run_id);
        if !dir.exists() {
            return Ok(None);
        }
        let prefix = format!("stage_{stage_index}_");
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                return read_json(&path);
            }
        }
        Ok(None)
    }

    pub fn list_stage_records(&self, run_id: &str) -> Result<Vec<StageRecord>> {
        let dir = self.paths.run_stages_dir(run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<StageRecord>(&path)? {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.stage_index);
        Ok(out)
    }

    pub fn read_control(&self, run_id: &str) -> Result<ControlFlags> {
        Ok(read_json(&self.paths.control_file(run_id))?.unwrap_or_default())
    }

    pub fn write_control(&self, run_id: &str, flags: &ControlFlags) -> Result<()> {
        write_json_atomic(&self.paths.control_file(run_id), flags)
    }

    /// Listing walks the per-run records directly. Runs share no mutable
    /// state, so there is no index file to race over.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>> {
        if !self.paths.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<RunSummary> = Vec::new();
        for entry in fs::read_dir(&self.paths.runs_dir)
            .with_context(|| format!("failed to read {}", self.paths.runs_dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(record) = read_json::<RunRecord>(&path)? else {
                continue;
            };
            if filter.status.is_none_or(|wanted| record.status == wanted) {
                runs.push(RunSummary {
                    id: record.id,
                    input_root: record.input_root,
                    output_root: record.output_root,
                    status: record.status,
                    created_at_epoch_secs: record.created_at_epoch_secs,
                    last_completed_stage: record.last_completed_stage,
                });
            }
        }
        runs.sort_by(|a, b| {
            b.created_at_epoch_secs
                .cmp(&a.created_at_epoch_secs)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }
}
