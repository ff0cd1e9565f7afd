// Per-shard GC histograms
// H[g] counts the ids in a shard's range with exactly g G/C bases; used as
// a skip oracle when the GC window can rule a whole shard out

use std::fs;
use std::path::Path;

use serde::Deserialize;

use kbit_common::{KbitError, Result};

#[derive(Debug, Deserialize)]
struct HistDoc {
    k: u8,
    num_shards: Option<u32>,
    #[serde(default)]
    shards: Vec<HistRecordDoc>,
}

#[derive(Debug, Deserialize)]
struct HistRecordDoc {
    shard: u32,
    gc_hist: Vec<u64>,
}

/// Loaded histogram table, one (k+1)-bucket vector per shard. Records may
/// appear in any order; shards without a record keep a zero vector.
#[derive(Debug, Clone)]
pub struct GcHistograms {
    pub k: u8,
    hists: Vec<Vec<u64>>,
}

impl GcHistograms {
    /// Load the histogram JSON and check its k against the manifest's.
    pub fn load(path: &Path, index_k: u8) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| KbitError::IndexParse(format!("{}: {e}", path.display())))?;
        let doc: HistDoc = serde_json::from_str(&text)
            .map_err(|e| KbitError::IndexParse(format!("{}: {e}", path.display())))?;

        if doc.k != index_k {
            return Err(KbitError::HistogramMismatch {
                hist_k: doc.k,
                index_k,
            });
        }

        let buckets = doc.k as usize + 1;
        let mut hists = vec![vec![0u64; buckets]; doc.num_shards.unwrap_or(0) as usize];
        for rec in doc.shards {
            let idx = rec.shard as usize;
            if idx >= hists.len() {
                hists.resize(idx + 1, vec![0u64; buckets]);
            }
            for (b, &count) in rec.gc_hist.iter().take(buckets).enumerate() {
                hists[idx][b] = count;
            }
        }

        Ok(GcHistograms { k: doc.k, hists })
    }

    /// True when shard `i` cannot contribute any id inside the GC window:
    /// it has a populated histogram, yet every populated bucket falls
    /// outside [lo_pct, hi_pct]. An all-zero vector means "no information"
    /// (unlisted shards default to zeros) and never skips.
    pub fn shard_excluded(&self, i: usize, lo_pct: u8, hi_pct: u8) -> bool {
        let Some(hist) = self.hists.get(i) else {
            return false;
        };
        let mut any_count = false;
        for (g, &count) in hist.iter().enumerate() {
            if count == 0 {
                continue;
            }
            any_count = true;
            let gc = g as u64 * 100;
            if gc >= lo_pct as u64 * self.k as u64 && gc <= hi_pct as u64 * self.k as u64 {
                return false;
            }
        }
        any_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load_doc(doc: &serde_json::Value, index_k: u8) -> Result<GcHistograms> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc_hist.json");
        fs::write(&path, doc.to_string()).unwrap();
        GcHistograms::load(&path, index_k)
    }

    #[test]
    fn test_load_and_order_independence() {
        let h = load_doc(
            &json!({
                "k": 2,
                "num_shards": 3,
                "shards": [
                    { "shard": 2, "gc_hist": [4, 0, 0] },
                    { "shard": 0, "gc_hist": [0, 2, 2] },
                ],
            }),
            2,
        )
        .unwrap();
        // Shard 0: buckets 1 and 2 populated -> passes a 50..100 window
        assert!(!h.shard_excluded(0, 50, 100));
        // Shard 1 has no record -> zero vector -> never skipped
        assert!(!h.shard_excluded(1, 50, 100));
        // Shard 2: only bucket 0 (0% GC) populated -> excluded by 50..100
        assert!(h.shard_excluded(2, 50, 100));
        assert!(!h.shard_excluded(2, 0, 100));
    }

    #[test]
    fn test_k_mismatch() {
        let err = load_doc(&json!({ "k": 3, "shards": [] }), 2).unwrap_err();
        assert!(matches!(
            err,
            KbitError::HistogramMismatch { hist_k: 3, index_k: 2 }
        ));
    }

    #[test]
    fn test_out_of_range_shard_grows_table() {
        let h = load_doc(
            &json!({
                "k": 2,
                "shards": [{ "shard": 5, "gc_hist": [1, 0, 0] }],
            }),
            2,
        )
        .unwrap();
        assert!(h.shard_excluded(5, 50, 100));
        assert!(!h.shard_excluded(4, 50, 100));
        assert!(!h.shard_excluded(17, 50, 100));
    }
}
