use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Where a media record's resolved timestamp came from. Ordering of the
/// variants is not meaningful; use `quality_rank` for election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    SidecarMetadata,
    EmbeddedMetadata,
    FilenamePattern,
    FolderName,
    #[default]
    None,
}

impl DateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SidecarMetadata => "sidecar_metadata",
            Self::EmbeddedMetadata => "embedded_metadata",
            Self::FilenamePattern => "filename_pattern",
            Self::FolderName => "folder_name",
            Self::None => "none",
        }
    }

    /// Higher is better. Used by duplicate-representative election so that
    /// the member with the most trustworthy date wins.
    pub fn quality_rank(self) -> u8 {
        match self {
            Self::SidecarMetadata => 4,
            Self::EmbeddedMetadata => 3,
            Self::FilenamePattern => 2,
            Self::FolderName => 1,
            Self::None => 0,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One physical file discovered in the input root. Created by discovery,
/// enriched by later stages, never deleted mid-run — duplicates are marked
/// superseded instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub path: String,
    pub size: u64,
    pub modified_epoch_secs: u64,
    #[serde(default)]
    pub sidecar_path: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub taken_at_epoch_secs: Option<i64>,
    #[serde(default)]
    pub date_source: DateSource,
    #[serde(default)]
    pub duplicate_group: Option<String>,
    #[serde(default = "default_true")]
    pub representative: bool,
    #[serde(default)]
    pub collections: BTreeSet<String>,
    #[serde(default)]
    pub partner_shared: bool,
}

impl MediaRecord {
    pub fn new(path: String, size: u64, modified_epoch_secs: u64) -> Self {
        Self {
            id: record_id(&path),
            path,
            size,
            modified_epoch_secs,
            sidecar_path: None,
            content_hash: None,
            taken_at_epoch_secs: None,
            date_source: DateSource::None,
            duplicate_group: None,
            representative: true,
            collections: BTreeSet::new(),
            partner_shared: false,
        }
    }

    pub fn has_resolved_date(&self) -> bool {
        self.taken_at_epoch_secs.is_some() && self.date_source != DateSource::None
    }
}

/// Stable record identity: hex digest of the canonical discovery path.
/// Survives the path rewrite done by the organize stage.
pub fn record_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Raw sidecar relationship evidence collected during discovery, before
/// reconciliation. Two descriptors may name the same collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumDescriptor {
    pub title: String,
    pub member_paths: Vec<String>,
    #[serde(default)]
    pub partner_shared: bool,
    pub origin: String,
}

/// A reconciled logical grouping. Membership is a pure function of the
/// descriptors plus the post-dedup record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub partner_shared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: String,
    pub size: u64,
    pub members: Vec<String>,
    pub representative: String,
}

#[cfg(test)]
mod tests {
    use super::{DateSource, MediaRecord, record_id};

    #[test]
    fn record_ids_are_stable_and_path_sensitive() {
        let a = record_id("/in/a.jpg");
        assert_eq!(a, record_id("/in/a.jpg"));
        assert_ne!(a, record_id("/in/b.jpg"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn quality_rank_orders_sources() {
        assert!(DateSource::SidecarMetadata.quality_rank() > DateSource::EmbeddedMetadata.quality_rank());
        assert!(DateSource::EmbeddedMetadata.quality_rank() > DateSource::FilenamePattern.quality_rank());
        assert!(DateSource::FilenamePattern.quality_rank() > DateSource::FolderName.quality_rank());
        assert_eq!(DateSource::None.quality_rank(), 0);
    }

    #[test]
    fn new_records_start_unresolved_and_representative() {
        let record = MediaRecord::new("/in/a.jpg".into(), 10, 0);
        assert!(!record.has_resolved_date());
        assert!(record.representative);
        assert!(record.duplicate_group.is_none());
    }
}
