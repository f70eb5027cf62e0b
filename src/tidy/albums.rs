use crate::error::StageResult;
use crate::tidy::media::{Collection, MediaRecord};
use crate::tidy::stage::{Stage, StageContext, StageOutput, StagePayload};
use crate::tidy::warn;
use std::collections::BTreeMap;

/// Filesystem-hostile characters are replaced so a collection name can
/// double as a folder or manifest key.
pub fn clean_collection_name(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => cleaned.push('_'),
            _ => cleaned.push(ch),
        }
    }
    let trimmed = cleaned.trim_matches([' ', '.']);
    if trimmed.is_empty() {
        "Unknown Album".to_string()
    } else {
        trimmed.chars().take(100).collect()
    }
}

/// Stage 4: rebuild collection membership from discovery's relationship
/// descriptors over the post-dedup record set. Members resolve by content
/// identity — a superseded duplicate contributes its group representative.
pub struct ReconcileAlbumsStage;

impl Stage for ReconcileAlbumsStage {
    fn name(&self) -> &'static str {
        "reconcile-albums"
    }

    fn dependencies(&self, _index: usize) -> Vec<usize> {
        vec![0, 3]
    }

    fn execute(&self, ctx: &StageContext) -> StageResult<StageOutput> {
        let StagePayload::Discovery { albums, .. } = ctx.input(0)? else {
            return Err(crate::error::StageError::fatal(
                "discovery payload has unexpected shape",
            ));
        };
        let mut media = ctx.input_media(3)?.to_vec();
        let total = media.len();

        // path -> index, and id -> index for representative chasing
        let path_index: BTreeMap<String, usize> = media
            .iter()
            .enumerate()
            .map(|(i, m)| (m.path.clone(), i))
            .collect();
        let id_index: BTreeMap<String, usize> = media
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        // duplicate group -> representative record id
        let group_representative: BTreeMap<String, String> = media
            .iter()
            .filter(|m| m.representative)
            .filter_map(|m| {
                m.duplicate_group
                    .as_ref()
                    .map(|g| (g.clone(), m.id.clone()))
            })
            .collect();

        let mut collections: BTreeMap<String, Collection> = BTreeMap::new();
        let mut unresolved_members = 0usize;

        for descriptor in albums {
            let name = clean_collection_name(&descriptor.title);
            let entry = collections.entry(name.clone()).or_insert_with(|| Collection {
                name,
                members: Default::default(),
                partner_shared: false,
            });
            entry.partner_shared |= descriptor.partner_shared;

            for member_path in &descriptor.member_paths {
                let Some(&index) = path_index.get(member_path) else {
                    unresolved_members += 1;
                    warn::emit(
                        "ALBUM_MEMBER_UNRESOLVED",
                        &ctx.run.id,
                        self.name(),
                        member_path,
                        "member-not-in-record-set",
                        &format!("descriptor origin {}", descriptor.origin),
                    );
                    continue;
                };

                let record = &media[index];
                let canonical_id = match &record.duplicate_group {
                    Some(group) => group_representative
                        .get(group)
                        .cloned()
                        .unwrap_or_else(|| record.id.clone()),
                    None => record.id.clone(),
                };
                entry.members.insert(canonical_id);
            }
        }

        // Annotate membership on the canonical records themselves.
        for collection in collections.values() {
            for member_id in &collection.members {
                if let Some(&index) = id_index.get(member_id) {
                    media[index].collections.insert(collection.name.clone());
                }
            }
        }

        let collections: Vec<Collection> = collections.into_values().collect();

        Ok(StageOutput {
            payload: StagePayload::Albums {
                media,
                collections,
                unresolved_members,
            },
            input_items: total,
            output_items: total,
            error_count: unresolved_members,
        })
    }
}
