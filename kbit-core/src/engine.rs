// Streaming enumeration engine
// Window of concurrently open shard lanes, round-robin burst emission,
// deterministic shard scheduling and resumable paging

use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{debug, info};

use kbit_common::{KbitError, Result};

use crate::cursor::{LaneRecord, StreamCursor};
use crate::filter::{build_patterns, FilterSet};
use crate::gc_hist::GcHistograms;
use crate::lane::{Lane, LaneState};
use crate::manifest::ShardManifest;
use crate::perm;
use crate::shard::load_shard;

/// Expansion from a longer construct length is only offered on this base.
const EXPANSION_BASE_K: u8 = 18;

/// One streaming request.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub shards_dir: PathBuf,
    pub gc_hist_path: Option<PathBuf>,
    pub construct_k: Option<u8>,
    pub substring: Option<String>,
    pub reverse_complement: bool,
    pub gc_min: u8,
    pub gc_max: u8,
    pub limit: u64,
    pub threads: usize,
    pub window: u16,
    pub burst: u16,
    pub cursor: Option<String>,
    pub random_access: bool,
    pub ra_seed: Option<u64>,
    pub refill_chunk: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            shards_dir: PathBuf::new(),
            gc_hist_path: None,
            construct_k: None,
            substring: None,
            reverse_complement: false,
            gc_min: 0,
            gc_max: 100,
            limit: 200,
            threads: 4,
            window: 16,
            burst: 1,
            cursor: None,
            random_access: false,
            ra_seed: None,
            refill_chunk: 256,
        }
    }
}

/// One page of results plus the state needed to fetch the next.
#[derive(Debug)]
pub struct Page {
    pub values: Vec<u64>,
    pub kout: u8,
    pub has_more: bool,
    /// `None` exactly when `has_more` is false.
    pub cursor: Option<String>,
}

struct Scheduler<'a> {
    manifest: &'a ShardManifest,
    perm: Vec<u32>,
    next_perm_pos: u32,
    gc_hist: Option<&'a GcHistograms>,
    gc_window: Option<(u8, u8)>,
}

impl Scheduler<'_> {
    /// Open the next schedulable shard as a fresh lane, skipping shards the
    /// GC histogram proves empty for the current window.
    fn pull(&mut self, expand: bool) -> Result<Option<Lane>> {
        while (self.next_perm_pos as usize) < self.perm.len() {
            let perm_pos = self.next_perm_pos;
            self.next_perm_pos += 1;
            let shard_idx = self.perm[perm_pos as usize];

            if let (Some(hist), Some((lo, hi))) = (self.gc_hist, self.gc_window) {
                if hist.shard_excluded(shard_idx as usize, lo, hi) {
                    debug!(shard = shard_idx, "gc histogram excludes shard, skipping");
                    continue;
                }
            }

            let loaded = load_shard(&self.manifest.shard_path(shard_idx as usize))?;
            return Ok(Some(Lane::new(
                perm_pos,
                shard_idx,
                self.manifest.range(shard_idx as usize),
                loaded.bitmap,
                LaneState::fresh(expand),
            )));
        }
        Ok(None)
    }

    /// Reopen the shard a cursor lane was scanning, with its saved state.
    fn revive(&self, rec: &LaneRecord, expand: bool) -> Result<Option<Lane>> {
        if rec.perm_pos as usize >= self.perm.len() {
            return Ok(None);
        }
        let shard_idx = self.perm[rec.perm_pos as usize];
        match rec.state {
            LaneState::Scan { .. } if expand => return Err(KbitError::CursorMismatch("lane mode")),
            LaneState::Expand { .. } if !expand => {
                return Err(KbitError::CursorMismatch("lane mode"))
            }
            _ => {}
        }
        let loaded = load_shard(&self.manifest.shard_path(shard_idx as usize))?;
        Ok(Some(Lane::new(
            rec.perm_pos,
            shard_idx,
            self.manifest.range(shard_idx as usize),
            loaded.bitmap,
            rec.state,
        )))
    }
}

/// Run one page of the streaming enumeration.
pub fn run_stream(config: &StreamConfig) -> Result<Page> {
    let manifest = ShardManifest::load(&config.shards_dir)?;
    let k0 = manifest.k;
    let kout = resolve_kout(k0, config.construct_k)?;
    let expand = kout > k0;
    let window_cfg = config.window.max(1);
    let burst_cfg = config.burst.max(1);

    let gc_hist = match &config.gc_hist_path {
        Some(path) => Some(GcHistograms::load(path, k0)?),
        None => None,
    };

    let patterns = match &config.substring {
        Some(sub) if !sub.is_empty() => build_patterns(sub, kout, config.reverse_complement)?,
        _ => Vec::new(),
    };
    let filters = FilterSet::new(config.gc_min, config.gc_max, patterns);

    // Resolve seed, permutation and prior lane state. A cursor's seed wins
    // over a freshly passed one so the shard order stays stable across pages.
    let parsed_cursor = match &config.cursor {
        Some(token) => {
            let c = StreamCursor::decode(token)?;
            c.validate(
                manifest.num_shards,
                k0,
                kout,
                window_cfg,
                burst_cfg,
                config.random_access,
            )?;
            Some(c)
        }
        None => None,
    };

    let seed = if config.random_access {
        let raw = match &parsed_cursor {
            Some(c) => c.seed,
            None => config.ra_seed.unwrap_or_else(perm::entropy_seed),
        };
        if raw == 0 {
            1
        } else {
            raw
        }
    } else {
        0
    };

    let permutation = if config.random_access {
        perm::fisher_yates(manifest.num_shards, seed)
    } else {
        perm::identity(manifest.num_shards)
    };

    let mut scheduler = Scheduler {
        manifest: &manifest,
        perm: permutation,
        next_perm_pos: parsed_cursor.as_ref().map_or(0, |c| c.next_perm_pos),
        gc_hist: gc_hist.as_ref(),
        // The oracle only applies at the base length; expansion can pull
        // candidates back into the window through the flanks.
        gc_window: (!expand && filters.gc_active()).then_some((config.gc_min, config.gc_max)),
    };

    // Populate the window: revive cursor lanes, then pull fresh shards.
    let window = window_cfg as usize;
    let mut slots: Vec<Option<Lane>> = Vec::with_capacity(window);
    for i in 0..window {
        let revived = parsed_cursor
            .as_ref()
            .and_then(|c| c.lanes.get(i).copied().flatten());
        match revived {
            Some(rec) => slots.push(scheduler.revive(&rec, expand)?),
            None => slots.push(None),
        }
    }
    for slot in slots.iter_mut() {
        if slot.is_none() {
            *slot = scheduler.pull(expand)?;
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.clamp(1, window.max(1)))
        .build()
        .map_err(|e| KbitError::Io(std::io::Error::other(e)))?;

    let limit = config.limit as usize;
    let refill_chunk = config.refill_chunk.max(1) as usize;
    let mut out: Vec<u64> = Vec::with_capacity(limit);

    // Visit-driven round-robin: `visit` is the slot whose turn is next.
    // Emission depends only on lane states, the schedule and `burst`, never
    // on how refill batched the work, so a resumed run replays the exact
    // interleave of an uninterrupted one.
    let mut visit = 0usize;
    while out.len() < limit {
        if visit == 0 {
            if slots.iter().all(|s| s.is_none()) {
                break;
            }
            // Prefetch: refill drained lanes in parallel. Lanes are
            // disjoint, so this is a plain parallel-for with no cross-lane
            // communication. Purely a batching optimization; a visit
            // refills on demand when the prefetch missed.
            pool.install(|| {
                slots.par_iter_mut().for_each(|slot| {
                    if let Some(lane) = slot {
                        if lane.pending() == 0 && !lane.exhausted {
                            lane.refill(refill_chunk, &filters, k0, kout);
                        }
                    }
                })
            });
        }

        let slot = &mut slots[visit];
        visit = (visit + 1) % window;
        let Some(lane) = slot else { continue };

        let mut took = 0u16;
        while took < burst_cfg && out.len() < limit {
            if lane.pending() == 0 {
                if lane.exhausted {
                    break;
                }
                lane.refill(refill_chunk, &filters, k0, kout);
                if lane.pending() == 0 {
                    break;
                }
            }
            out.push(lane.pop().expect("pending was checked"));
            took += 1;
        }

        if !lane.live() {
            // Shard fully consumed: release it and pull the next permuted
            // position into the same visit slot.
            *slot = scheduler.pull(expand)?;
        }
    }

    // Permissive: a lane that still holds a shard counts as "more" even if
    // every remaining candidate would be filtered out. Callers tolerate a
    // final empty page.
    let has_more = slots.iter().flatten().any(|l| l.live())
        || (scheduler.next_perm_pos as usize) < scheduler.perm.len();

    let cursor = has_more.then(|| {
        StreamCursor {
            random_access: config.random_access,
            k0,
            kout,
            num_shards: manifest.num_shards,
            seed: if config.random_access { seed } else { 0 },
            next_perm_pos: scheduler.next_perm_pos,
            window: window_cfg,
            burst: burst_cfg,
            // Serialize slots in visit order, next-to-visit first, so a
            // resumed engine starting at its slot 0 continues the rotation.
            lanes: (0..window)
                .map(|i| {
                    let slot = &slots[(visit + i) % window];
                    slot.as_ref().filter(|l| l.live()).map(|l| LaneRecord {
                        perm_pos: l.perm_pos,
                        state: l.state,
                    })
                })
                .collect(),
        }
        .encode()
    });

    info!(
        returned = out.len(),
        has_more,
        kout,
        window = window_cfg,
        burst = burst_cfg,
        "stream page complete"
    );

    Ok(Page {
        values: out,
        kout,
        has_more,
        cursor,
    })
}

/// Decide the output length and reject unsupported expansions.
fn resolve_kout(k0: u8, construct_k: Option<u8>) -> Result<u8> {
    let kout = construct_k.unwrap_or(k0);
    if kout > 32 {
        return Err(KbitError::UnsupportedExpansion(format!(
            "construct_k={kout} exceeds the 32-base packing limit"
        )));
    }
    if kout < k0 {
        return Err(KbitError::UnsupportedExpansion(format!(
            "construct_k={kout} is shorter than the base k={k0}"
        )));
    }
    if kout > EXPANSION_BASE_K && k0 != EXPANSION_BASE_K {
        return Err(KbitError::UnsupportedExpansion(format!(
            "construct_k>{EXPANSION_BASE_K} requires base k={EXPANSION_BASE_K} shards, got k={k0}"
        )));
    }
    if k0 < EXPANSION_BASE_K && kout != k0 {
        return Err(KbitError::UnsupportedExpansion(format!(
            "expansion is disabled for base k={k0}"
        )));
    }
    Ok(kout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_kout() {
        assert_eq!(resolve_kout(2, None).unwrap(), 2);
        assert_eq!(resolve_kout(2, Some(2)).unwrap(), 2);
        assert_eq!(resolve_kout(18, Some(20)).unwrap(), 20);
        assert!(resolve_kout(16, Some(18)).is_err());
        assert!(resolve_kout(16, Some(20)).is_err());
        assert!(resolve_kout(18, Some(33)).is_err());
        assert!(resolve_kout(18, Some(17)).is_err());
    }
}
