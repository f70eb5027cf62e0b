use crate::error::{StageError, StageResult};
use crate::tidy::config::TidyConfig;
use crate::tidy::media::{AlbumDescriptor, Collection, DuplicateGroup, MediaRecord};
use crate::tidy::paths::TidyPaths;
use crate::tidy::state::RunRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted output of one stage. The tagged form keeps the stage records
/// self-describing so older readers skip fields they do not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Discovery {
        media: Vec<MediaRecord>,
        albums: Vec<AlbumDescriptor>,
        sidecar_count: usize,
        skipped_extras: usize,
    },
    Dates {
        media: Vec<MediaRecord>,
        resolved: usize,
        unresolved: usize,
    },
    Dedup {
        media: Vec<MediaRecord>,
        groups: Vec<DuplicateGroup>,
        hashed: usize,
        cache_hits: usize,
    },
    MetadataWrite {
        media: Vec<MediaRecord>,
        written: usize,
        skipped: usize,
        failed: usize,
    },
    Albums {
        media: Vec<MediaRecord>,
        collections: Vec<Collection>,
        unresolved_members: usize,
    },
    Organize {
        media: Vec<MediaRecord>,
        moved: usize,
        undated: usize,
        collisions: usize,
    },
    Timestamps {
        updated: usize,
        failed: usize,
        skipped: usize,
    },
}

impl StagePayload {
    pub fn media(&self) -> Option<&[MediaRecord]> {
        match self {
            Self::Discovery { media, .. }
            | Self::Dates { media, .. }
            | Self::Dedup { media, .. }
            | Self::MetadataWrite { media, .. }
            | Self::Albums { media, .. }
            | Self::Organize { media, .. } => Some(media),
            Self::Timestamps { .. } => None,
        }
    }
}

/// Everything a stage body is allowed to see: the run's immutable facts and
/// the persisted payloads of its declared dependencies. Never the full run
/// state.
pub struct StageContext<'a> {
    pub run: &'a RunRecord,
    pub config: &'a TidyConfig,
    pub paths: &'a TidyPaths,
    pub inputs: BTreeMap<usize, StagePayload>,
}

impl StageContext<'_> {
    pub fn input(&self, stage_index: usize) -> StageResult<&StagePayload> {
        self.inputs.get(&stage_index).ok_or_else(|| {
            StageError::fatal(format!(
                "dependency payload for stage {stage_index} was not provided"
            ))
        })
    }

    pub fn input_media(&self, stage_index: usize) -> StageResult<&[MediaRecord]> {
        self.input(stage_index)?.media().ok_or_else(|| {
            StageError::fatal(format!(
                "dependency payload for stage {stage_index} carries no media records"
            ))
        })
    }
}

pub struct StageOutput {
    pub payload: StagePayload,
    pub input_items: usize,
    pub output_items: usize,
    pub error_count: usize,
}

/// Uniform stage contract. The engine holds an ordered roster of these and
/// never branches on stage identity beyond invoking it.
pub trait Stage {
    fn name(&self) -> &'static str;

    /// Stage indices whose completed payloads this stage reads. The engine
    /// refuses to run the stage until all of them are `completed`.
    fn dependencies(&self, index: usize) -> Vec<usize> {
        if index == 0 { Vec::new() } else { vec![index - 1] }
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput>;
}
