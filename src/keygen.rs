//! Deterministic key and value generation.
//!
//! Keys and values are pure functions of a seed: re-running a generation pass
//! with the same seed reproduces the same bytes, which is what lets a get be
//! validated against what an earlier (possibly different) process set. The
//! value's seed is derived from the key's own bytes, so an expected value can
//! always be recomputed from nothing but the key.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate the key for `index` in a keyspace rooted at `seed`.
///
/// The generator is re-seeded with `seed + index` for every key, so keys can
/// be produced individually and in any order.
pub fn key_for(seed: i64, index: usize, len: usize, prefix: &str) -> String {
    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(index as i64) as u64);
    let mut key = String::with_capacity(prefix.len() + len);
    key.push_str(prefix);
    for _ in 0..len {
        key.push(LETTERS[rng.gen_range(0..LETTERS.len())] as char);
    }
    key
}

/// Seed for a key's value: the low 64 bits of the key read as a big-endian
/// integer.
pub fn value_seed(key: &str) -> u64 {
    key.bytes().fold(0u64, |acc, b| (acc << 8) | u64::from(b))
}

/// Generate the value bytes for `key`. Depends only on the key and the size.
pub fn value_for(key: &str, size: usize) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(value_seed(key));
    (0..size).map(|_| LETTERS[rng.gen_range(0..LETTERS.len())]).collect()
}
