// Point-query engine
// Routes k-mers to shards by id range and checks containment in parallel,
// preserving caller input order in the results

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use tracing::info;

use kbit_common::{dna, KbitError, Result};

use crate::manifest::ShardManifest;
use crate::shard::load_shard;

/// One point-query request.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub shards_dir: PathBuf,
    /// Hard-require this k; mismatch with the manifest is fatal.
    pub k: Option<u8>,
    pub threads: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            shards_dir: PathBuf::new(),
            k: None,
            threads: 4,
        }
    }
}

/// Check membership of each k-mer; `hits[i]` answers `kmers[i]`.
pub fn run_point_query(config: &QueryConfig, kmers: &[String]) -> Result<Vec<bool>> {
    let manifest = ShardManifest::load(&config.shards_dir)?;
    let k = manifest.k;
    if let Some(required) = config.k {
        if required != k {
            return Err(KbitError::IndexParse(format!(
                "index k={k} does not match requested k={required}"
            )));
        }
    }

    // Encode everything up front; any malformed input aborts the request
    // before a single shard is opened.
    let mut ids = Vec::with_capacity(kmers.len());
    for kmer in kmers {
        ids.push(dna::encode_kmer(kmer, k as usize)?);
    }

    // Group query positions by owning shard.
    let mut by_shard: Vec<Vec<usize>> = vec![Vec::new(); manifest.num_shards as usize];
    for (pos, &id) in ids.iter().enumerate() {
        let shard = manifest.find_shard(id).ok_or_else(|| {
            KbitError::IndexParse(format!("id {id} outside every shard range"))
        })?;
        by_shard[shard].push(pos);
    }

    let hits = Mutex::new(vec![false; ids.len()]);
    let next_shard = AtomicUsize::new(0);
    let threads = config
        .threads
        .clamp(1, manifest.num_shards.max(1) as usize);

    thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            handles.push(scope.spawn(|| -> Result<()> {
                loop {
                    let shard = next_shard.fetch_add(1, Ordering::Relaxed);
                    if shard >= by_shard.len() {
                        return Ok(());
                    }
                    let positions = &by_shard[shard];
                    if positions.is_empty() {
                        continue;
                    }

                    let loaded = load_shard(&manifest.shard_path(shard))?;
                    let local: Vec<(usize, bool)> = positions
                        .iter()
                        .map(|&pos| (pos, loaded.bitmap.contains(ids[pos])))
                        .collect();

                    // Positions are disjoint across shards; the lock is
                    // only held for the copy, never across I/O.
                    let mut hits = hits.lock().expect("hits lock poisoned");
                    for (pos, hit) in local {
                        hits[pos] = hit;
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("query worker panicked")?;
        }
        Ok(())
    })?;

    info!(queries = kmers.len(), threads, "point query complete");
    Ok(hits.into_inner().expect("hits lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use roaring::RoaringTreemap;
    use serde_json::json;

    use crate::shard::write_shard;

    fn build_shard_set(dir: &std::path::Path, k: u8, num_shards: u32, present: &[u64]) {
        let total = kbit_common::universe_size(k);
        let width = total.div_ceil(num_shards as u64);
        let mut entries = Vec::new();
        for i in 0..num_shards {
            let start = i as u64 * width;
            let end = (start + width).min(total);
            let file = format!("shard_{i:04}.kbit");
            let mut bm = RoaringTreemap::new();
            for &id in present.iter().filter(|&&id| id >= start && id < end) {
                bm.insert(id);
            }
            write_shard(&dir.join(&file), k, 0, &bm).unwrap();
            entries.push(json!({ "file": file, "start": start, "end": end }));
        }
        let doc = json!({ "num_shards": num_shards, "k": k, "shards": entries });
        std::fs::write(dir.join("index.json"), doc.to_string()).unwrap();
    }

    #[test]
    fn test_single_shard_membership() {
        let dir = tempfile::tempdir().unwrap();
        build_shard_set(dir.path(), 2, 1, &[0, 5]);

        let config = QueryConfig {
            shards_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let kmers = ["AA", "AC", "CC"].map(String::from);
        let hits = run_point_query(&config, &kmers).unwrap();
        assert_eq!(hits, vec![true, false, true]);
    }

    #[test]
    fn test_multi_shard_preserves_input_order() {
        let dir = tempfile::tempdir().unwrap();
        // Present ids scattered across 4 shards of a k=3 universe
        build_shard_set(dir.path(), 3, 4, &[1, 17, 33, 63]);

        let config = QueryConfig {
            shards_dir: dir.path().to_path_buf(),
            threads: 3,
            ..Default::default()
        };
        let kmers: Vec<String> = (0..64u64)
            .map(|v| kbit_common::decode_kmer(v, 3))
            .collect();
        let hits = run_point_query(&config, &kmers).unwrap();
        for (v, &hit) in hits.iter().enumerate().map(|(i, h)| (i as u64, h)) {
            assert_eq!(hit, [1u64, 17, 33, 63].contains(&v), "id {v}");
        }
    }

    #[test]
    fn test_wrong_length_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        build_shard_set(dir.path(), 2, 1, &[]);

        let config = QueryConfig {
            shards_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let kmers = ["AAA".to_string()];
        assert!(matches!(
            run_point_query(&config, &kmers),
            Err(KbitError::LengthMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_invalid_base_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        build_shard_set(dir.path(), 2, 1, &[]);

        let config = QueryConfig {
            shards_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(matches!(
            run_point_query(&config, &["AN".to_string()]),
            Err(KbitError::InvalidBase('N'))
        ));
    }

    #[test]
    fn test_k_requirement() {
        let dir = tempfile::tempdir().unwrap();
        build_shard_set(dir.path(), 2, 1, &[]);

        let config = QueryConfig {
            shards_dir: dir.path().to_path_buf(),
            k: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            run_point_query(&config, &[]),
            Err(KbitError::IndexParse(_))
        ));
    }
}
