// Shard scheduling order
// Deterministic Fisher-Yates permutation driven by splitmix64

use rand::Rng;

use crate::rng::splitmix64;

/// Shuffle of [0..n) fully determined by (n, seed). A seed of zero is
/// remapped to one so the splitmix64 state keeps progressing.
pub fn fisher_yates(n: u32, seed: u64) -> Vec<u32> {
    let mut p: Vec<u32> = (0..n).collect();
    let mut state = if seed == 0 { 1 } else { seed };
    let mut i = n;
    while i > 1 {
        state = splitmix64(state);
        let j = (state % i as u64) as usize;
        p.swap(i as usize - 1, j);
        i -= 1;
    }
    p
}

/// The identity schedule used when random access is off.
pub fn identity(n: u32) -> Vec<u32> {
    (0..n).collect()
}

/// Draw a permutation seed from platform entropy, mixed once.
pub fn entropy_seed() -> u64 {
    let mut rng = rand::thread_rng();
    let s1: u64 = rng.gen();
    let s2: u64 = rng.gen();
    splitmix64(s1 ^ (s2 << 1))
}
