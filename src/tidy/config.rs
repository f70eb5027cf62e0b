use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizeOptions {
    pub album_mode: String,
    pub write_metadata: bool,
    pub update_timestamps: bool,
    pub skip_extras: bool,
    pub guess_from_name: bool,
}

impl Default for OrganizeOptions {
    fn default() -> Self {
        Self {
            album_mode: "json".to_string(),
            write_metadata: true,
            update_timestamps: true,
            skip_extras: true,
            guess_from_name: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub max_workers: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub heartbeat_stale_secs: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry_attempts: 3,
            retry_backoff_ms: 250,
            heartbeat_stale_secs: 300,
        }
    }
}

/// Snapshot of the effective configuration. Stored verbatim inside each run
/// record and immutable for that run's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TidyConfig {
    pub organize: OrganizeOptions,
    pub pipeline: PipelineOptions,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTidyConfig {
    organize: Option<OrganizeOptions>,
    pipeline: Option<PipelineOptions>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn validate(cfg: &TidyConfig) -> Result<()> {
    if cfg.organize.album_mode != "json" && cfg.organize.album_mode != "none" {
        return Err(anyhow!("invalid album mode: use `json` or `none`"));
    }
    if cfg.pipeline.max_workers == 0 {
        return Err(anyhow!("invalid worker count: must be >= 1"));
    }
    if cfg.pipeline.retry_attempts == 0 {
        return Err(anyhow!("invalid retry attempts: must be >= 1"));
    }
    if cfg.pipeline.heartbeat_stale_secs < 10 {
        return Err(anyhow!(
            "invalid heartbeat staleness threshold: must be >= 10 seconds"
        ));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("MEDIATIDY_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".mediatidy").join("config.toml"))
}

fn merge_file_config(base: &mut TidyConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialTidyConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse config {}: {err}", path.display()))?;
    if let Some(organize) = parsed.organize {
        base.organize = organize;
    }
    if let Some(pipeline) = parsed.pipeline {
        base.pipeline = pipeline;
    }
    Ok(())
}

pub fn load_config() -> Result<TidyConfig> {
    let mut cfg = TidyConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.organize.album_mode = env_or_string("MEDIATIDY_ALBUM_MODE", &cfg.organize.album_mode);
    cfg.organize.write_metadata =
        env_or_bool("MEDIATIDY_WRITE_METADATA", cfg.organize.write_metadata);
    cfg.organize.update_timestamps = env_or_bool(
        "MEDIATIDY_UPDATE_TIMESTAMPS",
        cfg.organize.update_timestamps,
    );
    cfg.organize.skip_extras = env_or_bool("MEDIATIDY_SKIP_EXTRAS", cfg.organize.skip_extras);
    cfg.organize.guess_from_name =
        env_or_bool("MEDIATIDY_GUESS_FROM_NAME", cfg.organize.guess_from_name);
    cfg.pipeline.max_workers = env_or_usize("MEDIATIDY_MAX_WORKERS", cfg.pipeline.max_workers);
    cfg.pipeline.retry_attempts =
        env_or_u32("MEDIATIDY_RETRY_ATTEMPTS", cfg.pipeline.retry_attempts);
    cfg.pipeline.retry_backoff_ms =
        env_or_u64("MEDIATIDY_RETRY_BACKOFF_MS", cfg.pipeline.retry_backoff_ms);
    cfg.pipeline.heartbeat_stale_secs = env_or_u64(
        "MEDIATIDY_HEARTBEAT_STALE_SECS",
        cfg.pipeline.heartbeat_stale_secs,
    );

    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::{TidyConfig, validate};

    #[test]
    fn defaults_pass_validation() {
        assert!(validate(&TidyConfig::default()).is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = TidyConfig::default();
        cfg.pipeline.max_workers = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unknown_album_mode_rejected() {
        let mut cfg = TidyConfig::default();
        cfg.organize.album_mode = "shortcuts".into();
        assert!(validate(&cfg).is_err());
    }
}
