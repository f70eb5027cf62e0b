use anyhow::Result;
use std::env;
use std::path::PathBuf;

/// Everything durable lives under the state home. One record per run,
/// one record per (run, stage) pair, one liveness record per active run.
#[derive(Debug, Clone)]
pub struct TidyPaths {
    pub state_home: PathBuf,
    pub runs_dir: PathBuf,
    pub stages_dir: PathBuf,
    pub processes_dir: PathBuf,
    pub control_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<TidyPaths> {
    let home = required_home_dir()?;
    let state_home = env_or_default_path("MEDIATIDY_HOME", home.join(".mediatidy"));

    Ok(TidyPaths {
        runs_dir: state_home.join("runs"),
        stages_dir: state_home.join("stages"),
        processes_dir: state_home.join("processes"),
        control_dir: state_home.join("control"),
        cache_dir: state_home.join("cache"),
        logs_dir: state_home.join("logs"),
        state_home,
    })
}

impl TidyPaths {
    pub fn run_file(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    pub fn run_stages_dir(&self, run_id: &str) -> PathBuf {
        self.stages_dir.join(run_id)
    }

    pub fn stage_file(&self, run_id: &str, stage_index: usize, stage_name: &str) -> PathBuf {
        self.run_stages_dir(run_id)
            .join(format!("stage_{stage_index}_{stage_name}.json"))
    }

    pub fn process_file(&self, run_id: &str) -> PathBuf {
        self.processes_dir.join(format!("{run_id}.json"))
    }

    pub fn process_lock_file(&self, run_id: &str) -> PathBuf {
        self.processes_dir.join(format!("{run_id}.lock"))
    }

    pub fn control_file(&self, run_id: &str) -> PathBuf {
        self.control_dir.join(format!("{run_id}.json"))
    }

    pub fn hash_cache_file(&self) -> PathBuf {
        self.cache_dir.join("hashes.json")
    }

    pub fn audit_log_file(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }
}
