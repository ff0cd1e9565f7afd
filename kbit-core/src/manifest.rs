// Shard set manifest
// index.json: shard file names plus contiguous [start, end) id ranges
// partitioning [0, 4^k)

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use kbit_common::{universe_size, KbitError, Result};

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    num_shards: Option<u32>,
    k: Option<u8>,
    total_bits: Option<u64>,
    #[serde(default)]
    shards: Vec<ShardEntryDoc>,
}

#[derive(Debug, Deserialize)]
struct ShardEntryDoc {
    file: String,
    start: Option<u64>,
    end: Option<u64>,
}

/// One shard's file name and owned id range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    pub file: String,
    pub start: u64,
    pub end: u64,
}

/// Parsed and normalized shard index.
#[derive(Debug, Clone)]
pub struct ShardManifest {
    pub num_shards: u32,
    pub k: u8,
    pub total_bits: u64,
    pub shards: Vec<ShardEntry>,
    dir: PathBuf,
}

impl ShardManifest {
    /// Load `<dir>/index.json` and normalize it: synthesize shard file names
    /// when the entry list disagrees with `num_shards`, and synthesize
    /// equal-width ranges when any entry omits start/end.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("index.json");
        let text = fs::read_to_string(&path)
            .map_err(|e| KbitError::IndexParse(format!("{}: {e}", path.display())))?;
        let doc: ManifestDoc = serde_json::from_str(&text)
            .map_err(|e| KbitError::IndexParse(format!("{}: {e}", path.display())))?;

        let k = doc.k.ok_or(KbitError::ManifestIncomplete("k"))?;
        let num_shards = match doc.num_shards {
            Some(n) if n > 0 => n,
            _ if !doc.shards.is_empty() => doc.shards.len() as u32,
            _ => return Err(KbitError::ManifestIncomplete("num_shards")),
        };
        let total_bits = doc.total_bits.unwrap_or_else(|| universe_size(k));

        // File names: take the listed entries when they agree with
        // num_shards, otherwise fall back to the conventional names.
        let mut entries: Vec<(String, Option<u64>, Option<u64>)> =
            if doc.shards.len() == num_shards as usize {
                doc.shards
                    .into_iter()
                    .map(|s| (s.file, s.start, s.end))
                    .collect()
            } else {
                (0..num_shards)
                    .map(|i| (format!("shard_{i:04}.kbit"), None, None))
                    .collect()
            };

        // Ranges: keep explicit start/end only if every entry has them;
        // otherwise cover [0, total_bits) with equal-width slices.
        let all_explicit = entries.iter().all(|(_, s, e)| s.is_some() && e.is_some());
        if !all_explicit {
            let width = total_bits.div_ceil(num_shards as u64);
            for (i, entry) in entries.iter_mut().enumerate() {
                let start = i as u64 * width;
                entry.1 = Some(start.min(total_bits));
                entry.2 = Some((start + width).min(total_bits));
            }
        }

        let shards = entries
            .into_iter()
            .map(|(file, s, e)| ShardEntry {
                file,
                start: s.unwrap(),
                end: e.unwrap(),
            })
            .collect();

        Ok(ShardManifest {
            num_shards,
            k,
            total_bits,
            shards,
            dir: dir.to_path_buf(),
        })
    }

    /// Binary-search the shard whose [start, end) contains `id`.
    pub fn find_shard(&self, id: u64) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.shards.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let s = &self.shards[mid];
            if id < s.start {
                hi = mid;
            } else if id >= s.end {
                lo = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// Absolute path of shard `i`'s bitmap file.
    pub fn shard_path(&self, i: usize) -> PathBuf {
        self.dir.join(&self.shards[i].file)
    }

    /// The owned range of shard `i`.
    pub fn range(&self, i: usize) -> (u64, u64) {
        (self.shards[i].start, self.shards[i].end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_index(dir: &Path, doc: &serde_json::Value) {
        let mut f = fs::File::create(dir.join("index.json")).unwrap();
        write!(f, "{doc}").unwrap();
    }

    #[test]
    fn test_explicit_ranges() {
        let dir = tempfile::tempdir().unwrap();
        write_index(
            dir.path(),
            &json!({
                "num_shards": 2,
                "k": 2,
                "shards": [
                    { "file": "a.kbit", "start": 0, "end": 9 },
                    { "file": "b.kbit", "start": 9, "end": 16 },
                ],
            }),
        );
        let m = ShardManifest::load(dir.path()).unwrap();
        assert_eq!(m.num_shards, 2);
        assert_eq!(m.k, 2);
        assert_eq!(m.total_bits, 16);
        assert_eq!(m.range(0), (0, 9));
        assert_eq!(m.range(1), (9, 16));
        assert_eq!(m.find_shard(8), Some(0));
        assert_eq!(m.find_shard(9), Some(1));
        assert_eq!(m.find_shard(16), None);
    }

    #[test]
    fn test_synthesized_ranges_cover_universe() {
        let dir = tempfile::tempdir().unwrap();
        write_index(
            dir.path(),
            &json!({
                "num_shards": 3,
                "k": 3,
                "shards": [
                    { "file": "x.kbit" },
                    { "file": "y.kbit" },
                    { "file": "z.kbit" },
                ],
            }),
        );
        let m = ShardManifest::load(dir.path()).unwrap();
        // Every id belongs to exactly one shard
        for id in 0..64u64 {
            let hits = (0..3)
                .filter(|&i| {
                    let (s, e) = m.range(i);
                    id >= s && id < e
                })
                .count();
            assert_eq!(hits, 1, "id {id}");
        }
        assert_eq!(m.range(2).1, 64);
    }

    #[test]
    fn test_synthesized_file_names() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), &json!({ "num_shards": 2, "k": 2 }));
        let m = ShardManifest::load(dir.path()).unwrap();
        assert_eq!(m.shards[0].file, "shard_0000.kbit");
        assert_eq!(m.shards[1].file, "shard_0001.kbit");
    }

    #[test]
    fn test_missing_k_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), &json!({ "num_shards": 2 }));
        assert!(matches!(
            ShardManifest::load(dir.path()),
            Err(KbitError::ManifestIncomplete("k"))
        ));
    }

    #[test]
    fn test_missing_everything_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), &json!({ "k": 2 }));
        assert!(matches!(
            ShardManifest::load(dir.path()),
            Err(KbitError::ManifestIncomplete("num_shards"))
        ));
    }

    #[test]
    fn test_unreadable_index_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.json"), "{ not json").unwrap();
        assert!(matches!(
            ShardManifest::load(dir.path()),
            Err(KbitError::IndexParse(_))
        ));
    }
}
