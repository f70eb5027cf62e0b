use crate::error::StageResult;
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::util::run_command_with_optional_timeout;
use crate::tidy::warn;
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::process::Command;

const TOUCH_TIMEOUT_SECS: u64 = 10;

/// Platform timestamp-setting service. One narrow call, fire-and-forget
/// from the pipeline's point of view: failures are logged, never fatal.
pub struct PlatformTimestamps;

impl PlatformTimestamps {
    pub fn set_file_timestamp(&self, path: &Path, epoch_secs: i64) -> Result<()> {
        let stamp = Utc
            .timestamp_opt(epoch_secs, 0)
            .single()
            .context("timestamp out of range")?
            .format("%Y%m%d%H%M.%S")
            .to_string();
        let mut cmd = Command::new("touch");
        cmd.arg("-t").arg(&stamp).arg(path);
        let output = run_command_with_optional_timeout(&mut cmd, Some(TOUCH_TIMEOUT_SECS))
            .with_context(|| format!("touch failed for {}", path.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "touch exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Stage 6: align filesystem times of organized files with their resolved
/// capture dates.
pub struct SetTimestampsStage {
    pub service: PlatformTimestamps,
}

impl Stage for SetTimestampsStage {
    fn name(&self) -> &'static str {
        "set-timestamps"
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let media = ctx.input_media(5)?;
        let total = media.len();

        let mut updated = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;

        let enabled = ctx.config.organize.update_timestamps && !ctx.config.dry_run;

        for record in media {
            let Some(epoch) = record.taken_at_epoch_secs.filter(|_| record.representative)
            else {
                skipped += 1;
                continue;
            };
            if !enabled {
                skipped += 1;
                continue;
            }

            match self
                .service
                .set_file_timestamp(Path::new(&record.path), epoch)
            {
                Ok(()) => updated += 1,
                Err(err) => {
                    failed += 1;
                    warn::emit(
                        "TIMESTAMP_SET_FAILED",
                        &ctx.run.id,
                        self.name(),
                        &record.path,
                        "timestamp-left-as-is",
                        &format!("{err:#}"),
                    );
                }
            }
        }

        Ok(StageOutput {
            payload: StagePayload::Timestamps {
                updated,
                failed,
                skipped,
            },
            input_items: total,
            output_items: updated,
            error_count: failed,
        })
    }
}
