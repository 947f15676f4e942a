// Hash functions for segment indexing
// sdbm string hash with an incremental form for rolling prefix hashes

/// sdbm string hash over raw bytes.
///
/// `hash = c + (hash << 6) + (hash << 16) - hash` with wrapping 64-bit
/// arithmetic. The incremental [`SdbmHash::step`] lets callers extend a
/// prefix hash one symbol at a time, so hashing `s[..k+1]` costs one step
/// once `s[..k]` is known.
#[derive(Debug, Clone, Copy)]
pub struct SdbmHash;

impl SdbmHash {
    /// Hash of the empty string
    pub const SEED: u64 = 0;

    #[inline]
    pub fn step(hash: u64, symbol: u8) -> u64 {
        (symbol as u64)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash)
    }

    #[inline]
    pub fn hash(bytes: &[u8]) -> u64 {
        bytes.iter().fold(Self::SEED, |hash, &symbol| Self::step(hash, symbol))
    }

    /// Hashes of every non-empty prefix, shortest first.
    pub fn prefixes(bytes: &[u8]) -> SdbmPrefixes<'_> {
        SdbmPrefixes {
            bytes,
            position: 0,
            hash: Self::SEED,
        }
    }
}

/// Iterator returned by [`SdbmHash::prefixes`]
#[derive(Debug, Clone)]
pub struct SdbmPrefixes<'a> {
    bytes: &'a [u8],
    position: usize,
    hash: u64,
}

impl Iterator for SdbmPrefixes<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let symbol = *self.bytes.get(self.position)?;
        self.hash = SdbmHash::step(self.hash, symbol);
        self.position += 1;
        Some(self.hash)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.bytes.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SdbmPrefixes<'_> {}
