// Lane scanner
// A lane owns one open shard and produces its absent ids lazily, in
// shard-local order, with a resumable checkpoint per produced value

use std::collections::VecDeque;

use roaring::RoaringTreemap;

use crate::expand::{compose, ExpandState};
use crate::filter::FilterSet;

/// Resume state of a lane, as captured by a cursor.
///
/// `Scan` drives same-length enumeration: the next id examined is
/// `after + 1` (or the range start when not yet started). `Expand` drives
/// kout > k0 enumeration: `parent` is the last anchor touched and `child`,
/// when set, the next unvisited flank combination of that anchor; `child`
/// absent means the anchor's block is complete and scanning continues at
/// `parent + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Scan {
        after: Option<u64>,
    },
    Expand {
        parent: Option<u64>,
        child: Option<ExpandState>,
    },
}

impl LaneState {
    /// Fresh state for a lane that has not produced anything.
    pub fn fresh(expand: bool) -> Self {
        if expand {
            LaneState::Expand {
                parent: None,
                child: None,
            }
        } else {
            LaneState::Scan { after: None }
        }
    }
}

/// A scanning lane bound to one shard.
///
/// The buffer holds produced values paired with the checkpoint that resumes
/// the stream immediately after each value; popping installs the paired
/// checkpoint, so the lane's `state` always describes the last value handed
/// out. Refill only runs on a drained buffer, where `state` and the internal
/// scan position coincide.
pub struct Lane {
    pub perm_pos: u32,
    pub shard_idx: u32,
    pub start: u64,
    pub end: u64,
    pub bitmap: RoaringTreemap,
    pub state: LaneState,
    pub exhausted: bool,
    buf: VecDeque<(u64, LaneState)>,
}

impl Lane {
    pub fn new(
        perm_pos: u32,
        shard_idx: u32,
        range: (u64, u64),
        bitmap: RoaringTreemap,
        state: LaneState,
    ) -> Self {
        Lane {
            perm_pos,
            shard_idx,
            start: range.0,
            end: range.1,
            bitmap,
            state,
            exhausted: false,
            buf: VecDeque::new(),
        }
    }

    /// Number of produced-but-unemitted values.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Whether this lane can still contribute to the page.
    pub fn live(&self) -> bool {
        !self.exhausted || !self.buf.is_empty()
    }

    /// Pop one value and advance the lane's resume state past it.
    pub fn pop(&mut self) -> Option<u64> {
        let (v, checkpoint) = self.buf.pop_front()?;
        self.state = checkpoint;
        Some(v)
    }

    /// Produce up to `target` filtered values into the buffer, resuming from
    /// the current state. Sets `exhausted` when the shard has nothing left.
    pub fn refill(&mut self, target: usize, filters: &FilterSet, k0: u8, kout: u8) {
        debug_assert!(self.buf.is_empty());
        if self.exhausted {
            return;
        }
        if kout == k0 {
            self.refill_scan(target, filters, kout);
        } else {
            self.refill_expand(target, filters, k0, kout);
        }
    }

    fn refill_scan(&mut self, target: usize, filters: &FilterSet, kout: u8) {
        let LaneState::Scan { after } = self.state else {
            unreachable!("scan refill on an expand lane");
        };
        let mut v = match after {
            None => self.start,
            Some(a) => a + 1,
        };
        while v < self.end && self.buf.len() < target {
            if !self.bitmap.contains(v) && filters.accepts(v, kout) {
                self.buf.push_back((v, LaneState::Scan { after: Some(v) }));
            }
            v += 1;
        }
        if v == self.end {
            self.exhausted = true;
        }
    }

    fn refill_expand(&mut self, target: usize, filters: &FilterSet, k0: u8, kout: u8) {
        let d = kout - k0;
        let LaneState::Expand { parent, child } = self.state else {
            unreachable!("expand refill on a scan lane");
        };
        let mut parent = parent;
        let mut child = child;

        while self.buf.len() < target {
            // Resolve the anchor to work on: resume mid-block, or advance
            // to the next absent id at or after the last finished anchor.
            let b = match (parent, child) {
                (Some(p), Some(_)) => p,
                (Some(p), None) => match self.next_absent(p + 1) {
                    Some(b) => b,
                    None => {
                        self.exhausted = true;
                        return;
                    }
                },
                (None, _) => match self.next_absent(self.start) {
                    Some(b) => b,
                    None => {
                        self.exhausted = true;
                        return;
                    }
                },
            };

            let mut st = child.unwrap_or_else(|| ExpandState::first(d));
            loop {
                let v = compose(b, k0, d, &st);
                let mut next = st;
                let has_next = next.advance(d);
                if filters.accepts(v, kout) {
                    let checkpoint = LaneState::Expand {
                        parent: Some(b),
                        child: has_next.then_some(next),
                    };
                    self.buf.push_back((v, checkpoint));
                }
                if !has_next {
                    // Anchor block finished; the outer loop moves on.
                    parent = Some(b);
                    child = None;
                    break;
                }
                st = next;
                if self.buf.len() >= target {
                    parent = Some(b);
                    child = Some(st);
                    break;
                }
            }
        }
        let _ = (parent, child); // scan position converges with the last checkpoint
    }

    /// First id >= `from` in the shard's range that is not present.
    fn next_absent(&self, from: u64) -> Option<u64> {
        let mut b = from;
        while b < self.end && self.bitmap.contains(b) {
            b += 1;
        }
        (b < self.end).then_some(b)
    }
}
