// BCW2 cursor codec
// Self-describing binary resume state for the streaming engine, carried as
// an unpadded base64url token

use kbit_common::{
    b64url_decode, b64url_encode, push_u16_le, push_u32_le, push_u64_le, ByteReader, KbitError,
    Result,
};

use crate::expand::ExpandState;
use crate::lane::LaneState;

const MAGIC: [u8; 4] = *b"BCW2";
const FLAG_RANDOM_ACCESS: u8 = 0x01;

/// Sentinel for "not started" on the wire; in memory these are `None`.
const NOT_STARTED: u64 = u64::MAX;

/// One serialized lane slot. `None` marks an inactive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneRecord {
    pub perm_pos: u32,
    pub state: LaneState,
}

/// Complete mid-scan engine state.
///
/// `lanes` always has exactly `window` entries, one per slot, in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    pub random_access: bool,
    pub k0: u8,
    pub kout: u8,
    pub num_shards: u32,
    pub seed: u64,
    pub next_perm_pos: u32,
    pub window: u16,
    pub burst: u16,
    pub lanes: Vec<Option<LaneRecord>>,
}

impl StreamCursor {
    /// Serialize and base64url-encode.
    pub fn encode(&self) -> String {
        let mut b = Vec::with_capacity(32 + self.lanes.len() * 36);
        b.extend_from_slice(&MAGIC);
        b.push(if self.random_access {
            FLAG_RANDOM_ACCESS
        } else {
            0
        });
        b.push(self.k0);
        b.push(self.kout);
        b.push(self.kout - self.k0);
        push_u32_le(&mut b, self.num_shards);
        push_u64_le(&mut b, self.seed);
        push_u32_le(&mut b, self.next_perm_pos);
        push_u16_le(&mut b, self.window);
        push_u16_le(&mut b, self.burst);
        push_u16_le(&mut b, self.lanes.len() as u16);

        for lane in &self.lanes {
            let Some(rec) = lane else {
                b.push(0);
                continue;
            };
            b.push(1);
            push_u32_le(&mut b, rec.perm_pos);
            match rec.state {
                LaneState::Scan { after } => {
                    b.push(0);
                    push_u64_le(&mut b, after.unwrap_or(NOT_STARTED));
                }
                LaneState::Expand { parent, child } => {
                    b.push(1);
                    push_u64_le(&mut b, parent.unwrap_or(NOT_STARTED));
                    b.push(child.is_some() as u8);
                    if let Some(st) = child {
                        b.push(st.l);
                        push_u64_le(&mut b, st.left_idx);
                        push_u64_le(&mut b, st.right_idx);
                    }
                }
            }
        }
        b64url_encode(&b)
    }

    /// Decode a token. Any malformed or truncated input is `BadCursor`;
    /// shape disagreements are left to [`StreamCursor::validate`].
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = b64url_decode(token).ok_or(KbitError::BadCursor)?;
        let mut r = ByteReader::new(&bytes);

        let magic = r.take(4).ok_or(KbitError::BadCursor)?;
        if magic != MAGIC {
            return Err(KbitError::BadCursor);
        }
        let flags = r.read_u8().ok_or(KbitError::BadCursor)?;
        let k0 = r.read_u8().ok_or(KbitError::BadCursor)?;
        let kout = r.read_u8().ok_or(KbitError::BadCursor)?;
        let d = r.read_u8().ok_or(KbitError::BadCursor)?;
        if kout < k0 || kout - k0 != d {
            return Err(KbitError::BadCursor);
        }
        let num_shards = r.read_u32_le().ok_or(KbitError::BadCursor)?;
        let seed = r.read_u64_le().ok_or(KbitError::BadCursor)?;
        let next_perm_pos = r.read_u32_le().ok_or(KbitError::BadCursor)?;
        let window = r.read_u16_le().ok_or(KbitError::BadCursor)?;
        let burst = r.read_u16_le().ok_or(KbitError::BadCursor)?;
        let lane_count = r.read_u16_le().ok_or(KbitError::BadCursor)?;

        let expand = kout > k0;
        let mut lanes = Vec::with_capacity(lane_count as usize);
        for _ in 0..lane_count {
            let active = r.read_u8().ok_or(KbitError::BadCursor)?;
            if active == 0 {
                lanes.push(None);
                continue;
            }
            let perm_pos = r.read_u32_le().ok_or(KbitError::BadCursor)?;
            let mode = r.read_u8().ok_or(KbitError::BadCursor)?;
            let state = match mode {
                0 if !expand => {
                    let after = r.read_u64_le().ok_or(KbitError::BadCursor)?;
                    LaneState::Scan {
                        after: (after != NOT_STARTED).then_some(after),
                    }
                }
                1 if expand => {
                    let parent = r.read_u64_le().ok_or(KbitError::BadCursor)?;
                    let child_present = r.read_u8().ok_or(KbitError::BadCursor)?;
                    let child = if child_present != 0 {
                        let l = r.read_u8().ok_or(KbitError::BadCursor)?;
                        let left_idx = r.read_u64_le().ok_or(KbitError::BadCursor)?;
                        let right_idx = r.read_u64_le().ok_or(KbitError::BadCursor)?;
                        Some(ExpandState {
                            l,
                            left_idx,
                            right_idx,
                        })
                    } else {
                        None
                    };
                    LaneState::Expand {
                        parent: (parent != NOT_STARTED).then_some(parent),
                        child,
                    }
                }
                _ => return Err(KbitError::BadCursor),
            };
            lanes.push(Some(LaneRecord { perm_pos, state }));
        }

        Ok(StreamCursor {
            random_access: flags & FLAG_RANDOM_ACCESS != 0,
            k0,
            kout,
            num_shards,
            seed,
            next_perm_pos,
            window,
            burst,
            lanes,
        })
    }

    /// Reject a cursor that disagrees with the current request's shape.
    pub fn validate(
        &self,
        num_shards: u32,
        k0: u8,
        kout: u8,
        window: u16,
        burst: u16,
        random_access: bool,
    ) -> Result<()> {
        if self.num_shards != num_shards {
            return Err(KbitError::CursorMismatch("num_shards"));
        }
        if self.k0 != k0 || self.kout != kout {
            return Err(KbitError::CursorMismatch("k"));
        }
        if self.window != window {
            return Err(KbitError::CursorMismatch("window"));
        }
        if self.burst != burst {
            return Err(KbitError::CursorMismatch("burst"));
        }
        if self.random_access != random_access {
            return Err(KbitError::CursorMismatch("random_access"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cursor() -> StreamCursor {
        StreamCursor {
            random_access: true,
            k0: 18,
            kout: 20,
            num_shards: 64,
            seed: 12345,
            next_perm_pos: 9,
            window: 4,
            burst: 2,
            lanes: vec![
                Some(LaneRecord {
                    perm_pos: 3,
                    state: LaneState::Expand {
                        parent: Some(77),
                        child: Some(ExpandState {
                            l: 1,
                            left_idx: 2,
                            right_idx: 3,
                        }),
                    },
                }),
                None,
                Some(LaneRecord {
                    perm_pos: 8,
                    state: LaneState::Expand {
                        parent: None,
                        child: None,
                    },
                }),
                Some(LaneRecord {
                    perm_pos: 5,
                    state: LaneState::Expand {
                        parent: Some(80),
                        child: None,
                    },
                }),
            ],
        }
    }

    #[test]
    fn test_roundtrip_expand() {
        let c = sample_cursor();
        let token = c.encode();
        let parsed = StreamCursor::decode(&token).unwrap();
        assert_eq!(parsed, c);
        // Idempotence of the token itself
        assert_eq!(parsed.encode(), token);
    }

    #[test]
    fn test_roundtrip_scan_mode() {
        let c = StreamCursor {
            random_access: false,
            k0: 2,
            kout: 2,
            num_shards: 4,
            seed: 0,
            next_perm_pos: 2,
            window: 2,
            burst: 1,
            lanes: vec![
                Some(LaneRecord {
                    perm_pos: 0,
                    state: LaneState::Scan { after: Some(3) },
                }),
                Some(LaneRecord {
                    perm_pos: 1,
                    state: LaneState::Scan { after: None },
                }),
            ],
        };
        assert_eq!(StreamCursor::decode(&c.encode()).unwrap(), c);
    }

    #[test]
    fn test_bad_tokens() {
        assert!(matches!(
            StreamCursor::decode("not base64url!"),
            Err(KbitError::BadCursor)
        ));
        assert!(matches!(
            StreamCursor::decode(""),
            Err(KbitError::BadCursor)
        ));
        // Valid encoding, wrong magic
        let token = b64url_encode(b"XXXX12345678901234567890123456");
        assert!(matches!(
            StreamCursor::decode(&token),
            Err(KbitError::BadCursor)
        ));
        // Truncated mid-structure
        let good = sample_cursor().encode();
        let cut = &good[..good.len() - 4];
        assert!(matches!(
            StreamCursor::decode(cut),
            Err(KbitError::BadCursor)
        ));
    }

    #[test]
    fn test_validate_mismatches() {
        let c = sample_cursor();
        assert!(c.validate(64, 18, 20, 4, 2, true).is_ok());
        assert!(matches!(
            c.validate(63, 18, 20, 4, 2, true),
            Err(KbitError::CursorMismatch("num_shards"))
        ));
        assert!(matches!(
            c.validate(64, 18, 21, 4, 2, true),
            Err(KbitError::CursorMismatch("k"))
        ));
        assert!(matches!(
            c.validate(64, 18, 20, 8, 2, true),
            Err(KbitError::CursorMismatch("window"))
        ));
        assert!(matches!(
            c.validate(64, 18, 20, 4, 1, true),
            Err(KbitError::CursorMismatch("burst"))
        ));
        assert!(matches!(
            c.validate(64, 18, 20, 4, 2, false),
            Err(KbitError::CursorMismatch("random_access"))
        ));
    }
}
