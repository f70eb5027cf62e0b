use crate::error::{StageError, StageResult};
use crate::tidy::hashing::{HashBatchOutcome, HashCache, HashRequest, hash_batch};
use crate::tidy::media::{DuplicateGroup, MediaRecord};
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::warn;
use std::collections::BTreeMap;

/// Stage 2: content-based duplicate detection. Size grouping first (no
/// hashing for unique sizes), SHA-256 grouping inside each size bucket,
/// then a deterministic representative election per hash group.
pub struct DedupStage;

/// Election order inside a hash group: best date-source quality first,
/// lexicographically smallest path on ties. Re-running on identical input
/// elects the same representative.
fn election_order(a: &MediaRecord, b: &MediaRecord) -> std::cmp::Ordering {
    b.date_source
        .quality_rank()
        .cmp(&a.date_source.quality_rank())
        .then_with(|| a.path.cmp(&b.path))
}

impl Stage for DedupStage {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let mut media = ctx.input_media(1)?.to_vec();
        let total = media.len();
        media.sort_by(|a, b| a.path.cmp(&b.path));

        let mut size_groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (index, record) in media.iter().enumerate() {
            size_groups.entry(record.size).or_default().push(index);
        }

        // Only files sharing a size can be duplicates; everything else
        // skips hashing entirely.
        let mut to_hash: Vec<HashRequest> = Vec::new();
        for indices in size_groups.values().filter(|g| g.len() > 1) {
            for &index in indices {
                let record = &media[index];
                to_hash.push(HashRequest {
                    path: record.path.clone(),
                    size: record.size,
                    modified_epoch_secs: record.modified_epoch_secs,
                });
            }
        }

        let cache_file = ctx.paths.hash_cache_file();
        let mut cache = HashCache::load(&cache_file);
        let HashBatchOutcome {
            hashes,
            failures,
            cache_hits,
            hashed,
        } = hash_batch(&to_hash, &mut cache, ctx.config.pipeline.max_workers)
            .map_err(|err| StageError::fatal(format!("{err:#}")))?;
        cache
            .save(&cache_file)
            .map_err(|err| StageError::transient(format!("{err:#}")))?;

        let mut error_count = 0usize;
        for (path, err) in &failures {
            // An unhashable file cannot be proven duplicate; treat it as
            // unique and keep going.
            error_count += 1;
            warn::emit(
                "HASH_FAILED",
                &ctx.run.id,
                self.name(),
                path,
                "treated-as-unique",
                err,
            );
        }

        let mut groups: Vec<DuplicateGroup> = Vec::new();
        for (size, indices) in &size_groups {
            if indices.len() == 1 {
                let record = &media[indices[0]];
                groups.push(DuplicateGroup {
                    group_id: record.id.clone(),
                    size: *size,
                    members: vec![record.id.clone()],
                    representative: record.id.clone(),
                });
                continue;
            }

            let mut hash_groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for &index in indices {
                match hashes.get(&media[index].path) {
                    Some(hash) => hash_groups.entry(hash.clone()).or_default().push(index),
                    None => {
                        // hashing failed; isolated singleton group
                        let record = &media[index];
                        groups.push(DuplicateGroup {
                            group_id: record.id.clone(),
                            size: *size,
                            members: vec![record.id.clone()],
                            representative: record.id.clone(),
                        });
                    }
                }
            }

            for (hash, mut group_indices) in hash_groups {
                group_indices.sort_by(|&a, &b| election_order(&media[a], &media[b]));
                let representative_id = media[group_indices[0]].id.clone();

                if group_indices.len() == 1 {
                    let record = &mut media[group_indices[0]];
                    record.content_hash = Some(hash.clone());
                    groups.push(DuplicateGroup {
                        group_id: record.id.clone(),
                        size: *size,
                        members: vec![record.id.clone()],
                        representative: representative_id,
                    });
                    continue;
                }

                let mut member_ids = Vec::with_capacity(group_indices.len());
                for &index in &group_indices {
                    let record = &mut media[index];
                    record.content_hash = Some(hash.clone());
                    record.duplicate_group = Some(hash.clone());
                    record.representative = record.id == representative_id;
                    member_ids.push(record.id.clone());
                }
                member_ids.sort();
                groups.push(DuplicateGroup {
                    group_id: hash.clone(),
                    size: *size,
                    members: member_ids,
                    representative: representative_id,
                });
            }
        }

        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));

        Ok(StageOutput {
            payload: StagePayload::Dedup {
                media,
                groups,
                hashed,
                cache_hits,
            },
            input_items: total,
            output_items: total,
            error_count,
        })
    }
}
