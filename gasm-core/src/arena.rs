// Construct arenas
// Per-unique-segment chain records, linked by arena index

use gasm_common::TVar;

use crate::error::{AssemblyError, Result};

/// One unique segment's position in the chain being assembled.
///
/// `start` and `end` are only authoritative at chain endpoints: a tail's
/// `start` names its chain's head and a head's `end` names its tail.
/// Interior entries keep whatever they last held.
pub struct ConstructEntry {
    /// Representative input index, `None` until claimed during index build
    pub segment: TVar<Option<usize>>,
    /// Hash of the suffix matched in the current pass
    pub end_hash: TVar<u64>,
    /// Still the head of its chain
    pub is_start: TVar<bool>,
    pub start: TVar<usize>,
    pub end: TVar<usize>,
    /// Successor in the chain
    pub next: TVar<Option<usize>>,
    /// Symbols shared with the predecessor
    pub overlap: TVar<usize>,
    /// Assembled length of the chain (meaningful at the head)
    pub length: TVar<usize>,
}

/// Matching state kept apart from [`ConstructEntry`] so the pass walk only
/// touches the fields it needs.
pub struct EndInfoEntry {
    /// Still the tail of its chain
    pub is_end: TVar<bool>,
    /// Distance to the next entry that may still be a tail
    pub jump_to_next: TVar<usize>,
}

/// Parallel arenas of [`ConstructEntry`] and [`EndInfoEntry`], allocated once
/// per run.
pub struct ConstructArena {
    entries: Box<[ConstructEntry]>,
    end_info: Box<[EndInfoEntry]>,
}

impl ConstructArena {
    /// Allocate `capacity` singleton chains of `segment_length` symbols.
    pub fn new(capacity: usize, segment_length: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|_| AssemblyError::AllocationFailure {
                what: "construct entries",
                requested: capacity,
            })?;
        let mut end_info = Vec::new();
        end_info
            .try_reserve_exact(capacity)
            .map_err(|_| AssemblyError::AllocationFailure {
                what: "end info entries",
                requested: capacity,
            })?;

        for index in 0..capacity {
            entries.push(ConstructEntry {
                segment: TVar::new(None),
                end_hash: TVar::new(0),
                is_start: TVar::new(true),
                start: TVar::new(index),
                end: TVar::new(index),
                next: TVar::new(None),
                overlap: TVar::new(0),
                length: TVar::new(segment_length),
            });
            end_info.push(EndInfoEntry {
                is_end: TVar::new(true),
                jump_to_next: TVar::new(1),
            });
        }

        Ok(ConstructArena {
            entries: entries.into_boxed_slice(),
            end_info: end_info.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &ConstructEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn end_info(&self, index: usize) -> &EndInfoEntry {
        &self.end_info[index]
    }
}

impl std::fmt::Debug for ConstructArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstructArena").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_start_as_singleton_chains() {
        let arena = ConstructArena::new(3, 8).unwrap();
        assert_eq!(arena.len(), 3);
        for index in 0..3 {
            let entry = arena.entry(index);
            assert_eq!(entry.segment.load_direct(), None);
            assert!(entry.is_start.load_direct());
            assert_eq!(entry.start.load_direct(), index);
            assert_eq!(entry.end.load_direct(), index);
            assert_eq!(entry.next.load_direct(), None);
            assert_eq!(entry.length.load_direct(), 8);
            assert!(arena.end_info(index).is_end.load_direct());
            assert_eq!(arena.end_info(index).jump_to_next.load_direct(), 1);
        }
    }

    #[test]
    fn test_empty_arena() {
        let arena = ConstructArena::new(0, 4).unwrap();
        assert!(arena.is_empty());
    }
}
