use crate::error::{StageError, StageResult};
use crate::tidy::media::{AlbumDescriptor, MediaRecord};
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::warn;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

const MEDIA_EXTENSIONS: &[&str] = &[
    // images
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "heic", "heif", "raw", "cr2",
    "nef", "arw", "dng",
    // videos
    "mp4", "mov", "avi", "mkv", "wmv", "flv", "webm", "m4v", "3gp", "mts", "m2ts",
    // motion photos
    "mv", "mp",
];

const EXTRA_MARKERS: &[&str] = &["-edited", "_edited", "(1)", "(2)", "copy"];

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Edited exports, numbered re-downloads, and manual copies of originals.
fn is_extra(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    EXTRA_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Takeout-style sidecar lookup: `photo.jpg.json` first, `photo.json` second.
fn sidecar_for(path: &Path) -> Option<PathBuf> {
    let appended = PathBuf::from(format!("{}.json", path.display()));
    if appended.is_file() {
        return Some(appended);
    }
    let swapped = path.with_extension("json");
    if swapped.is_file() {
        return Some(swapped);
    }
    None
}

fn sidecar_marks_partner_shared(value: &Value) -> bool {
    value.get("sharedAlbum").is_some()
        || value.get("shareTime").is_some()
        || value
            .get("isPartnerShared")
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

fn descriptor_from_metadata_file(
    run_id: &str,
    metadata_path: &Path,
    folder_media: &[String],
) -> Option<AlbumDescriptor> {
    let raw = match fs::read_to_string(metadata_path) {
        Ok(raw) => raw,
        Err(err) => {
            warn::emit(
                "ALBUM_METADATA_UNREADABLE",
                run_id,
                "discover",
                &metadata_path.display().to_string(),
                "metadata-read-failed",
                &err.to_string(),
            );
            return None;
        }
    };
    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn::emit(
                "ALBUM_METADATA_INVALID",
                run_id,
                "discover",
                &metadata_path.display().to_string(),
                "metadata-parse-failed",
                &err.to_string(),
            );
            return None;
        }
    };

    let title = parsed
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();

    if folder_media.is_empty() {
        return None;
    }

    Some(AlbumDescriptor {
        title,
        member_paths: folder_media.to_vec(),
        partner_shared: sidecar_marks_partner_shared(&parsed),
        origin: metadata_path.display().to_string(),
    })
}

/// Stage 0: walk the input root, classify media vs sidecar metadata, and
/// collect raw album relationship evidence for later reconciliation.
pub struct DiscoverStage;

impl Stage for DiscoverStage {
    fn name(&self) -> &'static str {
        "discover"
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let input_root = Path::new(&ctx.run.input_root);
        if !input_root.is_dir() {
            return Err(StageError::Precondition(format!(
                "input root is not a directory: {}",
                input_root.display()
            )));
        }

        let mut media: Vec<MediaRecord> = Vec::new();
        let mut sidecar_count = 0usize;
        let mut skipped_extras = 0usize;
        let mut error_count = 0usize;
        // folder -> media paths in it, for album-folder descriptors
        let mut folder_media: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        let mut metadata_files: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(input_root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn::emit(
                        "DISCOVERY_WALK_FAILED",
                        &ctx.run.id,
                        self.name(),
                        &err.path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        "walk-entry-failed",
                        &err.to_string(),
                    );
                    error_count += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if path.file_name().and_then(|n| n.to_str()) == Some("metadata.json") {
                metadata_files.push(path.to_path_buf());
                sidecar_count += 1;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                sidecar_count += 1;
                continue;
            }
            if !is_media_file(path) {
                continue;
            }
            if ctx.config.organize.skip_extras && is_extra(path) {
                skipped_extras += 1;
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn::emit(
                        "DISCOVERY_STAT_FAILED",
                        &ctx.run.id,
                        self.name(),
                        &path.display().to_string(),
                        "stat-failed",
                        &err.to_string(),
                    );
                    error_count += 1;
                    continue;
                }
            };
            let modified_epoch_secs = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            let mut record = MediaRecord::new(
                path.display().to_string(),
                metadata.len(),
                modified_epoch_secs,
            );

            if let Some(sidecar) = sidecar_for(path) {
                if let Ok(raw) = fs::read_to_string(&sidecar) {
                    if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                        record.partner_shared = sidecar_marks_partner_shared(&value);
                    }
                }
                record.sidecar_path = Some(sidecar.display().to_string());
            }

            if let Some(parent) = path.parent() {
                folder_media
                    .entry(parent.to_path_buf())
                    .or_default()
                    .push(record.path.clone());
            }
            media.push(record);
        }

        let mut albums: Vec<AlbumDescriptor> = Vec::new();
        for metadata_path in &metadata_files {
            let Some(folder) = metadata_path.parent() else {
                continue;
            };
            let members = folder_media
                .get(folder)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if let Some(descriptor) =
                descriptor_from_metadata_file(&ctx.run.id, metadata_path, members)
            {
                albums.push(descriptor);
            }
        }

        media.sort_by(|a, b| a.path.cmp(&b.path));
        albums.sort_by(|a, b| a.origin.cmp(&b.origin));

        let found = media.len();
        Ok(StageOutput {
            payload: StagePayload::Discovery {
                media,
                albums,
                sidecar_count,
                skipped_extras,
            },
            input_items: found + sidecar_count + skipped_extras,
            output_items: found,
            error_count,
        })
    }
}
