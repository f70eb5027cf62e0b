use crate::error::StageResult;
use crate::tidy::media::DateSource;
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::util::run_command_with_optional_timeout;
use crate::tidy::warn;
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const EXIFTOOL_TIMEOUT_SECS: u64 = 30;

/// Narrow interface to the embedded-metadata tool. A missing binary degrades
/// to "no embedded metadata" on read; writes are skipped with a warning.
#[derive(Debug, Clone)]
pub struct ExifToolClient {
    bin: Option<PathBuf>,
}

impl ExifToolClient {
    pub fn locate() -> Self {
        if let Ok(custom) = env::var("MEDIATIDY_EXIFTOOL_BIN") {
            let trimmed = custom.trim();
            if !trimmed.is_empty() {
                return Self {
                    bin: Some(PathBuf::from(trimmed)),
                };
            }
        }
        Self {
            bin: which::which("exiftool").ok(),
        }
    }

    pub fn unavailable() -> Self {
        Self { bin: None }
    }

    pub fn available(&self) -> bool {
        self.bin.as_deref().is_some_and(Path::exists)
    }

    /// Total extraction: any failure — missing binary, bad exit, unparsable
    /// output — is "not found", never an error.
    pub fn read_taken_at_epoch(&self, path: &Path) -> Option<i64> {
        let bin = self.bin.as_deref().filter(|b| b.exists())?;
        let mut cmd = Command::new(bin);
        cmd.arg("-j")
            .arg("-d")
            .arg("%s")
            .arg("-DateTimeOriginal")
            .arg("-CreateDate")
            .arg(path);
        let output = run_command_with_optional_timeout(&mut cmd, Some(EXIFTOOL_TIMEOUT_SECS)).ok()?;
        if !output.status.success() {
            return None;
        }
        let parsed: Value = serde_json::from_slice(&output.stdout).ok()?;
        let first = parsed.as_array()?.first()?;
        for field in ["DateTimeOriginal", "CreateDate"] {
            let Some(value) = first.get(field) else {
                continue;
            };
            let epoch = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            if let Some(epoch) = epoch {
                return Some(epoch);
            }
        }
        None
    }

    pub fn write_taken_at_epoch(&self, path: &Path, epoch_secs: i64) -> Result<()> {
        let bin = self
            .bin
            .as_deref()
            .filter(|b| b.exists())
            .context("embedded-metadata tool is not available")?;
        let stamp = Utc
            .timestamp_opt(epoch_secs, 0)
            .single()
            .context("timestamp out of range for metadata write")?
            .format("%Y:%m:%d %H:%M:%S")
            .to_string();

        let mut cmd = Command::new(bin);
        cmd.arg("-overwrite_original")
            .arg(format!("-DateTimeOriginal={stamp}"))
            .arg(format!("-CreateDate={stamp}"))
            .arg(path);
        let output = run_command_with_optional_timeout(&mut cmd, Some(EXIFTOOL_TIMEOUT_SECS))
            .with_context(|| format!("metadata write failed for {}", path.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "metadata tool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Stage 3: stamp resolved dates into representatives whose embedded
/// metadata is missing or weaker. Failures are logged per file and never
/// fail the stage — the organize stage does not depend on them.
pub struct WriteMetadataStage {
    pub exif: ExifToolClient,
}

impl Stage for WriteMetadataStage {
    fn name(&self) -> &'static str {
        "write-metadata"
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let media = ctx.input_media(2)?.to_vec();
        let total = media.len();

        let mut written = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        let enabled =
            ctx.config.organize.write_metadata && !ctx.config.dry_run && self.exif.available();

        for record in &media {
            let resolved_elsewhere = record.representative
                && record.date_source != DateSource::EmbeddedMetadata
                && record.date_source != DateSource::None;
            let Some(epoch) = record.taken_at_epoch_secs.filter(|_| resolved_elsewhere) else {
                skipped += 1;
                continue;
            };
            if !enabled {
                skipped += 1;
                continue;
            }

            match self
                .exif
                .write_taken_at_epoch(Path::new(&record.path), epoch)
            {
                Ok(()) => written += 1,
                Err(err) => {
                    failed += 1;
                    warn::emit(
                        "METADATA_WRITE_FAILED",
                        &ctx.run.id,
                        self.name(),
                        &record.path,
                        "metadata-write-failed",
                        &format!("{err:#}"),
                    );
                }
            }
        }

        Ok(StageOutput {
            payload: StagePayload::MetadataWrite {
                media,
                written,
                skipped,
                failed,
            },
            input_items: total,
            output_items: total,
            error_count: failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ExifToolClient;
    use std::path::Path;

    #[test]
    fn unavailable_client_reads_nothing() {
        let client = ExifToolClient::unavailable();
        assert!(!client.available());
        assert_eq!(client.read_taken_at_epoch(Path::new("/x/a.jpg")), None);
    }

    #[test]
    fn unavailable_client_refuses_writes() {
        let client = ExifToolClient::unavailable();
        assert!(
            client
                .write_taken_at_epoch(Path::new("/x/a.jpg"), 1_000_000)
                .is_err()
        );
    }
}
