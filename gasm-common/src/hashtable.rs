// Chained hash table over an index arena
// Buckets link slot indices; keys and links are transactional words

use std::collections::TryReserveError;

use crate::stm::{direct, try_vars, Access, TVar, TxResult};

/// Hash table mapping 64-bit keys to slot indices `0..capacity`.
///
/// The table is intrusive: each slot owns its key and its `next` link, and
/// each bucket keeps head, tail and length. A slot can be linked into at most
/// one bucket at a time. Bucket selection is `key % num_buckets` and the
/// bucket count is fixed at construction.
///
/// Two insertion styles share the same storage:
/// - [`insert`](Self::insert) appends at the bucket tail and allows equal
///   keys, so a bucket scan yields entries in insertion order.
/// - [`insert_unique`](Self::insert_unique) and
///   [`insert_unique_by`](Self::insert_unique_by) give set semantics,
///   optionally with a caller-supplied equality on the slot's payload.
///
/// All methods taking an [`Access`] run inside a transaction or directly.
/// Methods without one are for quiescent use only.
pub struct HashIndexTable {
    heads: Box<[TVar<Option<usize>>]>,
    tails: Box<[TVar<Option<usize>>]>,
    lens: Box<[TVar<usize>]>,
    keys: Box<[TVar<u64>]>,
    next: Box<[TVar<Option<usize>>]>,
    linked: Box<[TVar<bool>]>,
}

impl HashIndexTable {
    /// Create a table with `num_buckets` buckets (at least one) for slots
    /// `0..capacity`.
    ///
    /// # Panics
    ///
    /// If the tables cannot be allocated; see [`try_new`](Self::try_new).
    pub fn new(num_buckets: usize, capacity: usize) -> Self {
        match Self::try_new(num_buckets, capacity) {
            Ok(table) => table,
            Err(err) => panic!("hash table with {num_buckets} buckets and {capacity} slots: {err}"),
        }
    }

    /// Like [`new`](Self::new), but reports allocation failure.
    pub fn try_new(num_buckets: usize, capacity: usize) -> Result<Self, TryReserveError> {
        let num_buckets = num_buckets.max(1);
        Ok(HashIndexTable {
            heads: try_vars(num_buckets, None)?,
            tails: try_vars(num_buckets, None)?,
            lens: try_vars(num_buckets, 0)?,
            keys: try_vars(capacity, 0)?,
            next: try_vars(capacity, None)?,
            linked: try_vars(capacity, false)?,
        })
    }

    #[inline]
    pub fn num_buckets(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn bucket_of(&self, key: u64) -> usize {
        (key % self.heads.len() as u64) as usize
    }

    pub fn find<'env, A: Access<'env>>(
        &'env self,
        access: &mut A,
        key: u64,
    ) -> TxResult<Option<usize>> {
        self.find_by(access, key, |_| true)
    }

    /// First slot in insertion order with `key` whose payload satisfies
    /// `matches`.
    pub fn find_by<'env, A, F>(
        &'env self,
        access: &mut A,
        key: u64,
        mut matches: F,
    ) -> TxResult<Option<usize>>
    where
        A: Access<'env>,
        F: FnMut(usize) -> bool,
    {
        let mut cursor = access.read(&self.heads[self.bucket_of(key)])?;
        while let Some(slot) = cursor {
            if access.read(&self.keys[slot])? == key && matches(slot) {
                return Ok(Some(slot));
            }
            cursor = access.read(&self.next[slot])?;
        }
        Ok(None)
    }

    pub fn contains<'env, A: Access<'env>>(&'env self, access: &mut A, key: u64) -> TxResult<bool> {
        Ok(self.find(access, key)?.is_some())
    }

    /// Append `slot` under `key`. Fails only if `slot` is out of range or
    /// already linked.
    pub fn insert<'env, A: Access<'env>>(
        &'env self,
        access: &mut A,
        key: u64,
        slot: usize,
    ) -> TxResult<bool> {
        if slot >= self.capacity() || access.read(&self.linked[slot])? {
            return Ok(false);
        }

        let bucket = self.bucket_of(key);
        access.write(&self.keys[slot], key)?;
        access.write(&self.next[slot], None)?;
        access.write(&self.linked[slot], true)?;

        match access.read(&self.tails[bucket])? {
            Some(tail) => access.write(&self.next[tail], Some(slot))?,
            None => access.write(&self.heads[bucket], Some(slot))?,
        }
        access.write(&self.tails[bucket], Some(slot))?;
        let len = access.read(&self.lens[bucket])?;
        access.write(&self.lens[bucket], len + 1)?;
        Ok(true)
    }

    /// Insert unless an entry with `key` already exists.
    pub fn insert_unique<'env, A: Access<'env>>(
        &'env self,
        access: &mut A,
        key: u64,
        slot: usize,
    ) -> TxResult<bool> {
        self.insert_unique_by(access, key, slot, |_| true)
    }

    /// Insert unless an entry with `key` whose payload satisfies `same`
    /// already exists. Colliding keys with different payloads coexist.
    pub fn insert_unique_by<'env, A, F>(
        &'env self,
        access: &mut A,
        key: u64,
        slot: usize,
        same: F,
    ) -> TxResult<bool>
    where
        A: Access<'env>,
        F: FnMut(usize) -> bool,
    {
        if self.find_by(access, key, same)?.is_some() {
            return Ok(false);
        }
        self.insert(access, key, slot)
    }

    /// Unlink the first entry with `key`, returning its slot.
    pub fn remove<'env, A: Access<'env>>(
        &'env self,
        access: &mut A,
        key: u64,
    ) -> TxResult<Option<usize>> {
        let bucket = self.bucket_of(key);
        let mut prev: Option<usize> = None;
        let mut cursor = access.read(&self.heads[bucket])?;

        while let Some(slot) = cursor {
            let following = access.read(&self.next[slot])?;
            if access.read(&self.keys[slot])? == key {
                match prev {
                    Some(prev) => access.write(&self.next[prev], following)?,
                    None => access.write(&self.heads[bucket], following)?,
                }
                if following.is_none() {
                    access.write(&self.tails[bucket], prev)?;
                }
                let len = access.read(&self.lens[bucket])?;
                access.write(&self.lens[bucket], len - 1)?;
                access.write(&self.next[slot], None)?;
                access.write(&self.linked[slot], false)?;
                return Ok(Some(slot));
            }
            prev = Some(slot);
            cursor = following;
        }
        Ok(None)
    }

    pub fn bucket_len<'env, A: Access<'env>>(
        &'env self,
        access: &mut A,
        bucket: usize,
    ) -> TxResult<usize> {
        access.read(&self.lens[bucket])
    }

    /// Number of linked entries. Quiescent use only.
    pub fn len(&self) -> usize {
        direct(|access| {
            let mut total = 0;
            for bucket in 0..self.num_buckets() {
                total += self.bucket_len(access, bucket)?;
            }
            Ok(total)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots in `bucket`, in insertion order. Quiescent use only.
    pub fn bucket_slots(&self, bucket: usize) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut cursor = self.heads[bucket].load_direct();
        while let Some(slot) = cursor {
            slots.push(slot);
            cursor = self.next[slot].load_direct();
        }
        slots
    }

    /// Slots stored under exactly `key`, in insertion order, read without a
    /// transaction. Valid once the table is no longer being modified.
    pub fn matching(&self, key: u64) -> Matching<'_> {
        Matching {
            table: self,
            key,
            cursor: self.heads[self.bucket_of(key)].load_direct(),
        }
    }
}

impl std::fmt::Debug for HashIndexTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndexTable")
            .field("num_buckets", &self.num_buckets())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Iterator returned by [`HashIndexTable::matching`]
pub struct Matching<'a> {
    table: &'a HashIndexTable,
    key: u64,
    cursor: Option<usize>,
}

impl Iterator for Matching<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while let Some(slot) = self.cursor {
            self.cursor = self.table.next[slot].load_direct();
            if self.table.keys[slot].load_direct() == self.key {
                return Some(slot);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stm::direct;
    use crate::tm::{HybridTm, Transaction};

    #[test]
    fn test_multimap_keeps_insertion_order() {
        let table = HashIndexTable::new(4, 16);
        direct(|a| {
            assert!(table.insert(a, 9, 3)?);
            assert!(table.insert(a, 5, 1)?); // same bucket as 9
            assert!(table.insert(a, 9, 7)?);
            assert!(table.insert(a, 2, 0)?);
            Ok(())
        });
        assert_eq!(table.bucket_slots(1), vec![3, 1, 7]);
        assert_eq!(table.matching(9).collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(table.len(), 4);
        assert_eq!(direct(|a| table.find(a, 9)), Some(3));
    }

    #[test]
    fn test_insert_rejects_linked_or_out_of_range_slot() {
        let table = HashIndexTable::new(2, 4);
        direct(|a| {
            assert!(table.insert(a, 1, 2)?);
            assert!(!table.insert(a, 3, 2)?);
            assert!(!table.insert(a, 3, 4)?);
            Ok(())
        });
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_set_semantics() {
        let table = HashIndexTable::new(8, 8);
        direct(|a| {
            assert!(table.insert_unique(a, 42, 0)?);
            assert!(!table.insert_unique(a, 42, 1)?);
            assert!(table.contains(a, 42)?);
            assert!(!table.contains(a, 43)?);
            Ok(())
        });
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_unique_by_separates_colliding_payloads() {
        let payloads = ["acgt", "tgca", "acgt"];
        let table = HashIndexTable::new(1, 3);
        direct(|a| {
            for (slot, payload) in payloads.iter().enumerate() {
                // Every payload hashes to the same key
                table.insert_unique_by(a, 7, slot, |other| payloads[other] == *payload)?;
            }
            Ok(())
        });
        assert_eq!(table.bucket_slots(0), vec![0, 1]);
    }

    #[test]
    fn test_remove_relinks_bucket() {
        let table = HashIndexTable::new(1, 4);
        direct(|a| {
            for slot in 0..4 {
                table.insert(a, slot as u64, slot)?;
            }
            assert_eq!(table.remove(a, 3)?, Some(3)); // tail
            assert_eq!(table.remove(a, 0)?, Some(0)); // head
            assert_eq!(table.remove(a, 9)?, None);
            assert!(table.insert(a, 5, 3)?);
            Ok(())
        });
        assert_eq!(table.bucket_slots(0), vec![1, 2, 3]);
        assert_eq!(table.len(), 3);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_try_new_rejects_oversized_tables() {
        assert!(HashIndexTable::try_new(usize::MAX / 64, 4).is_err());
        assert!(HashIndexTable::try_new(4, usize::MAX / 64).is_err());
        let table = HashIndexTable::try_new(0, 2).unwrap();
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.capacity(), 2);
    }

    #[test]
    fn test_concurrent_unique_inserts() {
        const THREADS: usize = 4;
        const KEYS: usize = 256;

        let tm = HybridTm::default();
        let table = HashIndexTable::new(32, THREADS * KEYS);
        let inserted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..THREADS {
                let (tm, table, inserted) = (&tm, &table, &inserted);
                scope.spawn(move || {
                    for key in 0..KEYS {
                        let slot = worker * KEYS + key;
                        if tm.run(|tx| table.insert_unique(tx, key as u64, slot)) {
                            inserted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(inserted.into_inner(), KEYS);
        assert_eq!(table.len(), KEYS);
        for key in 0..KEYS as u64 {
            assert_eq!(table.matching(key).count(), 1);
        }
    }
}
