use crate::error::{StageError, StageResult};
use crate::tidy::media::Collection;
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::state::write_json_atomic;
use crate::tidy::warn;
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Rename first; fall back to copy-and-remove when the output root sits on
/// a different filesystem.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    match fs::rename(from, to) {
        Ok(_) => Ok(()),
        Err(rename_err) => {
            if matches!(
                rename_err.kind(),
                ErrorKind::CrossesDevices | ErrorKind::PermissionDenied
            ) {
                fs::copy(from, to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                fs::remove_file(from)
                    .with_context(|| format!("failed to remove {}", from.display()))?;
                Ok(())
            } else {
                Err(rename_err).with_context(|| {
                    format!("failed to move {} to {}", from.display(), to.display())
                })
            }
        }
    }
}

/// `<output>/<YYYY>/<MM>/` for dated records, `<output>/undated/` otherwise.
fn target_dir(output_root: &Path, taken_at_epoch_secs: Option<i64>) -> PathBuf {
    let Some(epoch) = taken_at_epoch_secs else {
        return output_root.join("undated");
    };
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(date) => output_root
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string()),
        None => output_root.join("undated"),
    }
}

/// Append `(1)`, `(2)`, ... before the extension until the name is free
/// both on disk and among targets already claimed this run.
fn disambiguate(target: PathBuf, claimed: &BTreeSet<PathBuf>) -> (PathBuf, bool) {
    if !target.exists() && !claimed.contains(&target) {
        return (target, false);
    }
    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = target
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let dir = target.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}({n}){ext}"));
        if !candidate.exists() && !claimed.contains(&candidate) {
            return (candidate, true);
        }
        n += 1;
    }
}

#[derive(Debug, Serialize)]
struct AlbumManifestEntry<'a> {
    name: &'a str,
    partner_shared: bool,
    members: Vec<&'a str>,
}

fn write_album_manifest(
    output_root: &Path,
    collections: &[Collection],
    organized_paths: &[(String, String)], // (record id, organized path)
) -> Result<()> {
    let path_by_id: std::collections::BTreeMap<&str, &str> = organized_paths
        .iter()
        .map(|(id, path)| (id.as_str(), path.as_str()))
        .collect();

    let manifest: Vec<AlbumManifestEntry> = collections
        .iter()
        .map(|collection| AlbumManifestEntry {
            name: &collection.name,
            partner_shared: collection.partner_shared,
            members: collection
                .members
                .iter()
                .filter_map(|id| path_by_id.get(id.as_str()).copied())
                .collect(),
        })
        .collect();

    write_json_atomic(&output_root.join("albums.json"), &manifest)
}

/// Stage 5: the only stage that mutates the output root. Moves each
/// representative into its dated folder and records the rewritten path.
/// Superseded duplicates stay where they are.
pub struct OrganizeStage;

impl Stage for OrganizeStage {
    fn name(&self) -> &'static str {
        "organize"
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let StagePayload::Albums {
            media, collections, ..
        } = ctx.input(4)?
        else {
            return Err(StageError::fatal("albums payload has unexpected shape"));
        };
        let mut media = media.to_vec();
        let collections = collections.clone();
        let total = media.len();

        let output_root = Path::new(&ctx.run.output_root);
        if !ctx.config.dry_run {
            fs::create_dir_all(output_root).map_err(|err| {
                StageError::transient(format!(
                    "failed to create output root {}: {err}",
                    output_root.display()
                ))
            })?;
        }

        let mut moved = 0usize;
        let mut undated = 0usize;
        let mut collisions = 0usize;
        let mut error_count = 0usize;
        let mut claimed: BTreeSet<PathBuf> = BTreeSet::new();
        let mut organized_paths: Vec<(String, String)> = Vec::new();

        let mut order: Vec<usize> = (0..media.len()).collect();
        order.sort_by(|&a, &b| media[a].path.cmp(&media[b].path));

        for index in order {
            if !media[index].representative {
                continue;
            }
            let record = &media[index];
            if record.taken_at_epoch_secs.is_none() {
                undated += 1;
            }

            let dir = target_dir(output_root, record.taken_at_epoch_secs);
            let file_name = Path::new(&record.path)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "file".into());
            let (target, collided) = disambiguate(dir.join(file_name), &claimed);
            if collided {
                collisions += 1;
            }
            claimed.insert(target.clone());

            if ctx.config.dry_run {
                moved += 1;
                organized_paths.push((record.id.clone(), target.display().to_string()));
                continue;
            }

            match move_file(Path::new(&record.path), &target) {
                Ok(()) => {
                    moved += 1;
                    let new_path = target.display().to_string();
                    organized_paths.push((record.id.clone(), new_path.clone()));
                    media[index].path = new_path;
                }
                Err(err) => {
                    error_count += 1;
                    warn::emit(
                        "ORGANIZE_MOVE_FAILED",
                        &ctx.run.id,
                        self.name(),
                        &record.path,
                        "left-in-place",
                        &format!("{err:#}"),
                    );
                }
            }
        }

        if ctx.config.organize.album_mode == "json" && !ctx.config.dry_run {
            write_album_manifest(output_root, &collections, &organized_paths)
                .map_err(|err| StageError::transient(format!("{err:#}")))?;
        }

        Ok(StageOutput {
            payload: StagePayload::Organize {
                media,
                moved,
                undated,
                collisions,
            },
            input_items: total,
            output_items: total,
            error_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{disambiguate, target_dir};
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[test]
    fn dated_records_land_in_year_month_folders() {
        // 2021-03-15 14:30:22 UTC
        let dir = target_dir(Path::new("/out"), Some(1_615_818_622));
        assert_eq!(dir, PathBuf::from("/out/2021/03"));
    }

    #[test]
    fn undated_records_land_in_undated() {
        assert_eq!(
            target_dir(Path::new("/out"), None),
            PathBuf::from("/out/undated")
        );
    }

    #[test]
    fn collisions_get_numbered_suffixes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let existing = tmp.path().join("a.jpg");
        fs::write(&existing, b"x").expect("write");

        let mut claimed = BTreeSet::new();
        let (first, collided) = disambiguate(existing.clone(), &claimed);
        assert!(collided);
        assert!(first.to_string_lossy().ends_with("a(1).jpg"));

        claimed.insert(first);
        let (second, _) = disambiguate(existing, &claimed);
        assert!(second.to_string_lossy().ends_with("a(2).jpg"));
    }
}
