// Dense bitmap generator
// Produces a 4^k-bit vector with an exact target population, streamed to
// disk through rotating buffers on a producer/writer thread pair

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::bounded;
use tracing::info;

use kbit_common::{universe_size, KbitError, KbitHeader, Result, FLAG_DENSE, HEADER_LEN};

use crate::perm::entropy_seed;
use crate::rng::{bounded as bounded_sample, Xoshiro256StarStar};

const NUM_BUFFERS: usize = 3;
const MIN_BUF_BYTES: usize = 1 << 20;

/// One generation request.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// K-mer length, 1..=31.
    pub k: u8,
    /// Target population as a percentage of 4^k, 0..=100.
    pub percent: f64,
    pub out: PathBuf,
    /// Sampling seed; drawn from entropy when absent.
    pub seed: Option<u64>,
    /// I/O buffer size; clamped to at least 1 MiB, rounded to 8 bytes.
    pub buf_bytes: usize,
    /// Emit a progress line every this many MiB written.
    pub status_step_mib: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            k: 0,
            percent: 0.0,
            out: PathBuf::new(),
            seed: None,
            buf_bytes: 64 << 20,
            status_step_mib: 128,
        }
    }
}

/// Final accounting of a completed run.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorReport {
    pub total_bits: u64,
    pub ones: u64,
    pub payload_len: u64,
    pub seed: u64,
}

struct IoBuffer {
    data: Vec<u8>,
    used: usize,
}

/// Generate the bit vector and write a complete KBITv1 file (flags=1).
///
/// The selection walk draws one bounded sample per remaining bit position:
/// the bit is set when the sample falls below the count of ones still
/// needed, which yields a uniform subset of exactly `ones` set bits.
pub fn generate(config: &GeneratorConfig) -> Result<GeneratorReport> {
    let k = config.k;
    let seed = config.seed.unwrap_or_else(entropy_seed);
    let total_bits = universe_size(k);
    let payload_len = total_bits.div_ceil(8);
    let ones_target = ((config.percent * total_bits as f64 / 100.0).round() as u64).min(total_bits);

    let buf_bytes = config.buf_bytes.max(MIN_BUF_BYTES) / 8 * 8;

    info!(
        k,
        total_bits,
        ones = ones_target,
        percent = config.percent,
        payload_len,
        seed,
        "generating dense bitmap"
    );

    let mut file = File::create(&config.out)?;
    file.write_all(&[0u8; HEADER_LEN])?;

    // Rotating buffers: the producer owns a buffer while filling it, the
    // writer while draining it; the two bounded channels carry ownership
    // back and forth.
    let (full_tx, full_rx) = bounded::<IoBuffer>(NUM_BUFFERS);
    let (free_tx, free_rx) = bounded::<IoBuffer>(NUM_BUFFERS);
    for _ in 0..NUM_BUFFERS {
        free_tx
            .send(IoBuffer {
                data: vec![0u8; buf_bytes],
                used: 0,
            })
            .expect("priming an empty channel cannot fail");
    }

    let bytes_written = Arc::new(AtomicU64::new(0));
    let writer_progress = Arc::clone(&bytes_written);

    let writer = thread::spawn(move || -> std::io::Result<File> {
        for mut buf in full_rx {
            file.write_all(&buf.data[..buf.used])?;
            writer_progress.fetch_add(buf.used as u64, Ordering::Relaxed);
            buf.used = 0;
            // The producer may already be gone while we drain the channel.
            let _ = free_tx.send(buf);
        }
        Ok(file)
    });

    // Producer: emit LSB-first bits packed into little-endian words.
    let started = Instant::now();
    let mut next_status_mark = config.status_step_mib.max(1) << 20;
    let mut rng = Xoshiro256StarStar::new(seed);
    let mut remaining = total_bits;
    let mut needed = ones_target;
    let mut payload_emitted = 0u64;

    let mut current = Some(free_rx.recv().expect("buffers were primed"));

    'produce: while remaining > 0 {
        let bits_here = remaining.min(64) as u32;
        let mut word = 0u64;
        for b in 0..bits_here {
            if needed > 0 {
                let pick = bounded_sample(rng.next_u64(), remaining);
                if pick < needed {
                    word |= 1u64 << b;
                    needed -= 1;
                }
            }
            remaining -= 1;
        }

        // The final word may be partial; emit only its covered bytes so the
        // file ends exactly at 64 + payload_len.
        let word_bytes = (bits_here as usize).div_ceil(8);
        let le = word.to_le_bytes();
        let mut src = &le[..word_bytes];
        while !src.is_empty() {
            let buf = current.as_mut().expect("producer holds a buffer");
            if buf.used == buf.data.len() {
                // A closed channel means the writer bailed on an I/O error;
                // stop producing and surface it from the join below.
                if full_tx.send(current.take().expect("just checked")).is_err() {
                    break 'produce;
                }
                match free_rx.recv() {
                    Ok(b) => current = Some(b),
                    Err(_) => break 'produce,
                }
                continue;
            }
            let space = buf.data.len() - buf.used;
            let chunk = space.min(src.len());
            buf.data[buf.used..buf.used + chunk].copy_from_slice(&src[..chunk]);
            buf.used += chunk;
            src = &src[chunk..];
        }
        payload_emitted += word_bytes as u64;

        let written = bytes_written.load(Ordering::Relaxed);
        if written >= next_status_mark {
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                written_mib = written >> 20,
                percent = written as f64 / payload_len as f64 * 100.0,
                rate_mib_s = (written >> 20) as f64 / elapsed.max(1e-9),
                "progress"
            );
            next_status_mark += config.status_step_mib.max(1) << 20;
        }
    }

    if let Some(buf) = current.take() {
        if buf.used > 0 {
            let _ = full_tx.send(buf);
        }
    }
    drop(full_tx);

    let mut file = writer.join().expect("writer thread panicked")?;
    if payload_emitted != payload_len {
        // Unreachable unless the writer failed, which the join just caught.
        return Err(KbitError::Io(std::io::Error::other(
            "payload generation stopped early",
        )));
    }

    // Rewrite the placeholder header with final values.
    let header = KbitHeader {
        total_bits,
        ones: ones_target,
        k: k as u64,
        seed,
        flags: FLAG_DENSE,
        payload_len,
    };
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.write())?;
    file.sync_all()?;

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        written_mib = payload_len >> 20,
        elapsed_s = elapsed,
        avg_rate_mib_s = (payload_len >> 20) as f64 / elapsed.max(1e-9),
        "done"
    );

    if needed != 0 {
        return Err(KbitError::OnesMismatch(needed));
    }

    Ok(GeneratorReport {
        total_bits,
        ones: ones_target,
        payload_len,
        seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn popcount(bytes: &[u8]) -> u64 {
        bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    fn run(k: u8, percent: f64, seed: u64) -> (KbitHeader, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dense.kbit");
        let report = generate(&GeneratorConfig {
            k,
            percent,
            out: path.clone(),
            seed: Some(seed),
            buf_bytes: 1 << 20,
            ..Default::default()
        })
        .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = KbitHeader::read(&bytes).unwrap();
        assert_eq!(report.ones, header.ones);
        (header, bytes[HEADER_LEN..].to_vec())
    }

    #[test]
    fn test_exact_population_small() {
        let (header, payload) = run(2, 50.0, 7);
        assert_eq!(header.total_bits, 16);
        assert_eq!(header.ones, 8);
        assert_eq!(header.k, 2);
        assert_eq!(header.flags, FLAG_DENSE);
        assert_eq!(header.payload_len, 2);
        assert_eq!(payload.len(), 2);
        assert_eq!(popcount(&payload), 8);
    }

    #[test]
    fn test_exact_population_multiword() {
        // k=5 -> 1024 bits across 16 words
        let (header, payload) = run(5, 33.0, 99);
        assert_eq!(header.total_bits, 1024);
        assert_eq!(header.ones, 338); // round(0.33 * 1024)
        assert_eq!(payload.len(), 128);
        assert_eq!(popcount(&payload), 338);
    }

    #[test]
    fn test_extremes() {
        let (header, payload) = run(3, 0.0, 1);
        assert_eq!(header.ones, 0);
        assert_eq!(popcount(&payload), 0);

        let (header, payload) = run(3, 100.0, 1);
        assert_eq!(header.ones, 64);
        assert_eq!(popcount(&payload), 64);
    }

    #[test]
    fn test_deterministic_per_seed() {
        let (_, a) = run(4, 25.0, 1234);
        let (_, b) = run(4, 25.0, 1234);
        let (_, c) = run(4, 25.0, 1235);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
