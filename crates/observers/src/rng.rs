//! Seeded randomness shared by every validating node.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

pub type StorageRng = ChaCha20Rng;

/// ChaCha20 seeded with BLAKE3(`seed` || `salt`).
pub fn seeded_rng(seed: &[u8], salt: &[u8]) -> StorageRng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed);
    hasher.update(salt);
    ChaCha20Rng::from_seed(*hasher.finalize().as_bytes())
}

/// Uniform-ish index in `0..bound` as `next_u32() % bound`. `bound` must be positive.
pub fn next_index(rng: &mut StorageRng, bound: usize) -> usize {
    (rng.next_u32() as usize) % bound
}

/// Choose `count` elements of `source` keeping their relative order (selection sampling).
pub fn sample<T: Clone>(source: &[T], count: usize, rng: &mut StorageRng) -> Vec<T> {
    let mut needed = count.min(source.len());
    let mut out = Vec::with_capacity(needed);
    for (i, item) in source.iter().enumerate() {
        if needed == 0 {
            break;
        }
        let remaining = source.len() - i;
        if next_index(rng, remaining) < needed {
            out.push(item.clone());
            needed -= 1;
        }
    }
    out
}

/// Fisher-Yates shuffle.
pub fn shuffle<T>(items: &mut [T], rng: &mut StorageRng) {
    for i in (1..items.len()).rev() {
        let j = next_index(rng, i + 1);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = seeded_rng(b"block", b"drive");
        let mut b = seeded_rng(b"block", b"drive");
        let mut c = seeded_rng(b"block", b"other");
        let xs: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        let zs: Vec<u32> = (0..8).map(|_| c.next_u32()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs, zs);
    }

    proptest! {
        #[test]
        fn sample_is_ordered_subset(len in 0usize..50, count in 0usize..60, seed in any::<u64>()) {
            let source: Vec<usize> = (0..len).collect();
            let mut rng = seeded_rng(&seed.to_le_bytes(), b"sample");
            let picked = sample(&source, count, &mut rng);
            prop_assert_eq!(picked.len(), count.min(len));
            prop_assert!(picked.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn shuffle_is_permutation(len in 0usize..50, seed in any::<u64>()) {
            let mut items: Vec<usize> = (0..len).collect();
            let mut rng = seeded_rng(&seed.to_le_bytes(), b"shuffle");
            shuffle(&mut items, &mut rng);
            items.sort_unstable();
            prop_assert_eq!(items, (0..len).collect::<Vec<_>>());
        }
    }
}
