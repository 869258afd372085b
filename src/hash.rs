//! Hashing primitives. BLAKE3 is an external primitive the core only wraps:
//! [`Blake3Hasher`] is a thin adapter from the `Hasher`/`IncrementalHasher`
//! contracts onto the `blake3` crate, the same crate the teacher uses in
//! `engine::hashing::hash_file`.

use crate::catalog::Fingerprint;

/// Pure, stateless hashing of a byte slice.
pub trait Hasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> Fingerprint;
    fn incremental(&self) -> Box<dyn IncrementalHasher>;
}

/// Stateful incremental hasher for streaming large files.
pub trait IncrementalHasher: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finalize(self: Box<Self>) -> Fingerprint;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    fn hash(&self, bytes: &[u8]) -> Fingerprint {
        Fingerprint(*blake3::hash(bytes).as_bytes())
    }

    fn incremental(&self) -> Box<dyn IncrementalHasher> {
        Box::new(Blake3Incremental(blake3::Hasher::new()))
    }
}

struct Blake3Incremental(blake3::Hasher);

impl IncrementalHasher for Blake3Incremental {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self: Box<Self>) -> Fingerprint {
        Fingerprint(*self.0.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_stable_hash() {
        let h = Blake3Hasher;
        let a = h.hash(b"");
        let b = h.hash(b"");
        assert_eq!(a, b);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let h = Blake3Hasher;
        let data = b"the quick brown fox jumps over the lazy dog";
        let one_shot = h.hash(data);

        let mut inc = h.incremental();
        inc.update(&data[..10]);
        inc.update(&data[10..]);
        let incremental = inc.finalize();

        assert_eq!(one_shot, incremental);
    }

    #[test]
    fn distinct_inputs_hash_differently() {
        let h = Blake3Hasher;
        assert_ne!(h.hash(b"a"), h.hash(b"b"));
    }
}
