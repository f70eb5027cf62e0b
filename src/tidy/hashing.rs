use crate::tidy::state::write_json_atomic;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

const HASH_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub size: u64,
    pub modified_epoch_secs: u64,
    pub sha256: String,
}

/// Content-hash cache keyed by (path, size, mtime). Any change to size or
/// mtime misses the cache, so invalidation is automatic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashCache {
    pub schema_version: u32,
    pub entries: BTreeMap<String, HashCacheEntry>,
}

impl HashCache {
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::default();
        };
        // A corrupt cache is only a performance loss, never an error.
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn lookup(&self, path: &str, size: u64, modified_epoch_secs: u64) -> Option<&str> {
        self.entries
            .get(path)
            .filter(|e| e.size == size && e.modified_epoch_secs == modified_epoch_secs)
            .map(|e| e.sha256.as_str())
    }

    pub fn insert(&mut self, path: String, size: u64, modified_epoch_secs: u64, sha256: String) {
        self.entries.insert(
            path,
            HashCacheEntry {
                size,
                modified_epoch_secs,
                sha256,
            },
        );
    }
}

/// Streamed SHA-256 so multi-gigabyte videos never load into memory whole.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug)]
pub struct HashRequest {
    pub path: String,
    pub size: u64,
    pub modified_epoch_secs: u64,
}

#[derive(Debug, Default)]
pub struct HashBatchOutcome {
    /// path -> hex digest, for every request that could be served.
    pub hashes: BTreeMap<String, String>,
    /// paths that could not be read; callers decide how lenient to be.
    pub failures: Vec<(String, String)>,
    pub cache_hits: usize,
    pub hashed: usize,
}

/// Hash a batch, serving from `cache` where possible. Per-file work fans out
/// over a bounded rayon pool; the result merge stays on the caller's thread
/// so outcomes are deterministic regardless of completion order.
pub fn hash_batch(
    requests: &[HashRequest],
    cache: &mut HashCache,
    max_workers: usize,
) -> Result<HashBatchOutcome> {
    let mut outcome = HashBatchOutcome::default();

    let mut pending: Vec<&HashRequest> = Vec::new();
    for request in requests {
        match cache.lookup(&request.path, request.size, request.modified_epoch_secs) {
            Some(hash) => {
                outcome.hashes.insert(request.path.clone(), hash.to_string());
                outcome.cache_hits += 1;
            }
            None => pending.push(request),
        }
    }

    if pending.is_empty() {
        return Ok(outcome);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_workers.max(1))
        .build()
        .context("failed to build hashing thread pool")?;
    // par_iter + collect preserves request order, so the merge below is
    // deterministic no matter how the pool schedules the work.
    let results: Vec<Result<String>> = pool.install(|| {
        pending
            .par_iter()
            .map(|request| hash_file(Path::new(&request.path)))
            .collect()
    });

    for (request, result) in pending.iter().zip(results) {
        match result {
            Ok(hash) => {
                cache.insert(
                    request.path.clone(),
                    request.size,
                    request.modified_epoch_secs,
                    hash.clone(),
                );
                outcome.hashes.insert(request.path.clone(), hash);
                outcome.hashed += 1;
            }
            Err(err) => {
                outcome
                    .failures
                    .push((request.path.clone(), format!("{err:#}")));
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::{HashCache, HashRequest, hash_batch, hash_file};
    use std::fs;

    #[test]
    fn hash_file_matches_known_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("hello.txt");
        fs::write(&path, b"hello world").expect("write");
        assert_eq!(
            hash_file(&path).expect("hash"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn batch_serves_from_cache_on_matching_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("a.bin");
        fs::write(&path, b"aaaa").expect("write");
        let request = HashRequest {
            path: path.display().to_string(),
            size: 4,
            modified_epoch_secs: 1000,
        };

        let mut cache = HashCache::default();
        let first = hash_batch(std::slice::from_ref(&request), &mut cache, 2).expect("batch");
        assert_eq!(first.hashed, 1);
        assert_eq!(first.cache_hits, 0);

        let second = hash_batch(std::slice::from_ref(&request), &mut cache, 2).expect("batch");
        assert_eq!(second.hashed, 0);
        assert_eq!(second.cache_hits, 1);
        assert_eq!(first.hashes, second.hashes);
    }

    #[test]
    fn batch_misses_cache_when_mtime_changes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("a.bin");
        fs::write(&path, b"aaaa").expect("write");

        let mut cache = HashCache::default();
        cache.insert(path.display().to_string(), 4, 1000, "stale".into());
        let request = HashRequest {
            path: path.display().to_string(),
            size: 4,
            modified_epoch_secs: 2000,
        };

        let outcome = hash_batch(&[request], &mut cache, 1).expect("batch");
        assert_eq!(outcome.cache_hits, 0);
        assert_eq!(outcome.hashed, 1);
        assert_ne!(
            outcome.hashes.values().next().map(String::as_str),
            Some("stale")
        );
    }

    #[test]
    fn unreadable_files_are_reported_not_fatal() {
        let mut cache = HashCache::default();
        let outcome = hash_batch(
            &[HashRequest {
                path: "/nonexistent/definitely/missing.bin".into(),
                size: 1,
                modified_epoch_secs: 0,
            }],
            &mut cache,
            1,
        )
        .expect("batch");
        assert!(outcome.hashes.is_empty());
        assert_eq!(outcome.failures.len(), 1);
    }
}
