use crate::error::StageResult;
use crate::tidy::exif::ExifToolClient;
use crate::tidy::media::{DateSource, MediaRecord};
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::util::now_epoch_secs;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// 1980-01-01T00:00:00Z. Anything earlier predates consumer digital
/// photography and is treated as a parse artifact.
pub const MIN_SANE_EPOCH: i64 = 315_532_800;

/// Timestamps more than a day in the future are clock noise, not captures.
const FUTURE_SLACK_SECS: i64 = 86_400;

static FILENAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // 20210315_143022, IMG_20210315-143022
        Regex::new(r"(\d{4})(\d{2})(\d{2})[_-](\d{2})(\d{2})(\d{2})").unwrap(),
        // 2021-03-15_14-30-22, 2021-03-15 14:30:22
        Regex::new(r"(\d{4})-(\d{2})-(\d{2})[ _](\d{2})[-:](\d{2})[-:](\d{2})").unwrap(),
        // 2021-03-15
        Regex::new(r"(\d{4})-(\d{2})-(\d{2})").unwrap(),
        // bare 20210315
        Regex::new(r"(\d{4})(\d{2})(\d{2})").unwrap(),
    ]
});

static FOLDER_YEAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Photos from ((?:19|20)\d{2})").unwrap());

pub fn is_sane(epoch_secs: i64, now_epoch_secs: i64) -> bool {
    epoch_secs >= MIN_SANE_EPOCH && epoch_secs <= now_epoch_secs + FUTURE_SLACK_SECS
}

fn ymd_hms_epoch(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|dt| dt.and_utc().timestamp())
}

fn capture_u32(captures: &regex::Captures, index: usize) -> Option<u32> {
    captures.get(index)?.as_str().parse().ok()
}

/// Extract a timestamp from a name fragment using the known patterns.
/// Total: returns None for anything that does not parse to a real date.
pub fn epoch_from_name(name: &str) -> Option<i64> {
    for pattern in FILENAME_PATTERNS.iter() {
        let Some(captures) = pattern.captures(name) else {
            continue;
        };
        let year = captures.get(1)?.as_str().parse::<i32>().ok()?;
        let month = capture_u32(&captures, 2)?;
        let day = capture_u32(&captures, 3)?;
        let (hour, minute, second) = if captures.len() > 6 {
            (
                capture_u32(&captures, 4)?,
                capture_u32(&captures, 5)?,
                capture_u32(&captures, 6)?,
            )
        } else {
            (0, 0, 0)
        };
        if let Some(epoch) = ymd_hms_epoch(year, month, day, hour, minute, second) {
            return Some(epoch);
        }
    }
    None
}

fn timestamp_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Takeout sidecars nest timestamps as `{ "timestamp": "1623715200" }`
/// under several keys; the capture time outranks upload bookkeeping.
pub fn sidecar_epoch(sidecar: &Value) -> Option<i64> {
    for key in ["photoTakenTime", "creationTime", "modificationTime"] {
        let Some(node) = sidecar.get(key) else {
            continue;
        };
        if let Some(epoch) = node.get("timestamp").and_then(timestamp_from_value) {
            return Some(epoch);
        }
        if let Some(epoch) = timestamp_from_value(node) {
            return Some(epoch);
        }
    }
    sidecar.get("timestamp").and_then(timestamp_from_value)
}

fn sidecar_epoch_for(record: &MediaRecord) -> Option<i64> {
    let sidecar_path = record.sidecar_path.as_deref()?;
    let raw = fs::read_to_string(sidecar_path).ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    sidecar_epoch(&value)
}

/// A year-bucket folder ("Photos from 2021") dates its contents to Jan 1;
/// a fully dated folder name is taken literally.
pub fn folder_epoch(path: &Path) -> Option<i64> {
    let folder = path.parent()?.file_name()?.to_str()?;
    if let Some(captures) = FOLDER_YEAR_PATTERN.captures(folder) {
        let year = captures.get(1)?.as_str().parse::<i32>().ok()?;
        return ymd_hms_epoch(year, 1, 1, 0, 0, 0);
    }
    epoch_from_name(folder)
}

/// First successful source wins; out-of-bounds values count as "not found"
/// for that source and the resolver keeps going down the list.
pub fn resolve_date(
    record: &MediaRecord,
    exif: &ExifToolClient,
    guess_from_name: bool,
    now_epoch: i64,
) -> Option<(i64, DateSource)> {
    if let Some(epoch) = sidecar_epoch_for(record).filter(|&e| is_sane(e, now_epoch)) {
        return Some((epoch, DateSource::SidecarMetadata));
    }

    if let Some(epoch) = exif
        .read_taken_at_epoch(Path::new(&record.path))
        .filter(|&e| is_sane(e, now_epoch))
    {
        return Some((epoch, DateSource::EmbeddedMetadata));
    }

    if guess_from_name {
        let name = Path::new(&record.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if let Some(epoch) = epoch_from_name(name).filter(|&e| is_sane(e, now_epoch)) {
            return Some((epoch, DateSource::FilenamePattern));
        }
    }

    if let Some(epoch) = folder_epoch(Path::new(&record.path)).filter(|&e| is_sane(e, now_epoch)) {
        return Some((epoch, DateSource::FolderName));
    }

    None
}

/// Stage 1: annotate every discovered record with a resolved timestamp and
/// the source that produced it.
pub struct ResolveDatesStage {
    pub exif: ExifToolClient,
}

impl Stage for ResolveDatesStage {
    fn name(&self) -> &'static str {
        "resolve-dates"
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let mut media = ctx.input_media(0)?.to_vec();
        let total = media.len();
        let now_epoch = now_epoch_secs()
            .map(|n| n as i64)
            .map_err(|err| crate::error::StageError::fatal(format!("{err:#}")))?;

        let mut resolved = 0usize;
        let mut unresolved = 0usize;
        for record in &mut media {
            match resolve_date(record, &self.exif, ctx.config.organize.guess_from_name, now_epoch)
            {
                Some((epoch, source)) => {
                    record.taken_at_epoch_secs = Some(epoch);
                    record.date_source = source;
                    resolved += 1;
                }
                None => {
                    record.taken_at_epoch_secs = None;
                    record.date_source = DateSource::None;
                    unresolved += 1;
                }
            }
        }

        Ok(StageOutput {
            payload: StagePayload::Dates {
                media,
                resolved,
                unresolved,
            },
            input_items: total,
            output_items: total,
            error_count: 0,
        })
    }
}
