//! Word-based software transactional memory.
//!
//! Every piece of shared mutable state the assembler touches from more than
//! one thread lives in a [`TVar`]: one 64-bit value guarded by a versioned
//! lock word. Code that mutates shared state is written once against the
//! [`Access`] trait and runs either speculatively through a [`Txn`] or with
//! plain loads and stores through [`Direct`] when a barrier already
//! guarantees exclusive access.
//!
//! ## Protocol
//!
//! The lock word holds `version << 1 | locked`. A global version clock is
//! sampled when a transaction begins (`read_version`). Reads are validated
//! seqlock-style: the lock word is sampled before and after loading the
//! value, and the read aborts if the cell is locked, changed during the load,
//! or carries a version newer than `read_version`. Writes are buffered until
//! commit. Commit locks the write set, advances the clock, revalidates the
//! read set and publishes the buffered values under the new version.
//!
//! All data is stored in atomics. There is no `unsafe` in this module.

use std::collections::hash_map::Entry;
use std::collections::TryReserveError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use crossbeam_utils::CachePadded;

const LOCKED: u64 = 1;

static GLOBAL_CLOCK: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));

#[inline]
fn is_locked(word: u64) -> bool {
    word & LOCKED != 0
}

#[inline]
fn version_of(word: u64) -> u64 {
    word >> 1
}

/// Why a speculative attempt stopped before committing.
///
/// Neither variant escapes [`Transaction::run`](crate::tm::Transaction::run):
/// both make the region start over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// Another thread committed a conflicting update
    Conflict,
    /// The region asked to be re-executed via [`Txn::restart`]
    Restart,
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Abort::Conflict => write!(f, "transaction conflict"),
            Abort::Restart => write!(f, "explicit restart"),
        }
    }
}

pub type TxResult<T> = Result<T, Abort>;

/// Values that fit in one transactional word.
pub trait Word: Copy {
    fn into_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

impl Word for u64 {
    #[inline]
    fn into_word(self) -> u64 {
        self
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        word
    }
}

impl Word for usize {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        word as usize
    }
}

impl Word for u32 {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        word as u32
    }
}

impl Word for bool {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        word != 0
    }
}

/// `None` is encoded as `u64::MAX`, so `Some(usize::MAX)` is not representable.
impl Word for Option<usize> {
    #[inline]
    fn into_word(self) -> u64 {
        match self {
            Some(index) => index as u64,
            None => u64::MAX,
        }
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        if word == u64::MAX {
            None
        } else {
            Some(word as usize)
        }
    }
}

/// Untyped storage behind a [`TVar`]
#[derive(Debug)]
struct VersionedWord {
    lock: AtomicU64,
    value: AtomicU64,
}

impl VersionedWord {
    #[inline]
    fn address(&self) -> usize {
        self as *const VersionedWord as usize
    }
}

/// A transactional variable holding one [`Word`].
pub struct TVar<T> {
    cell: VersionedWord,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Word> TVar<T> {
    pub fn new(value: T) -> Self {
        TVar {
            cell: VersionedWord {
                lock: AtomicU64::new(0),
                value: AtomicU64::new(value.into_word()),
            },
            _marker: PhantomData,
        }
    }

    /// Plain load, valid only while no transaction can be writing this cell.
    #[inline]
    pub fn load_direct(&self) -> T {
        T::from_word(self.cell.value.load(Ordering::Acquire))
    }

    /// Plain store, valid only while no other thread accesses this cell.
    ///
    /// Publishes a fresh version so a transaction that sampled the clock
    /// earlier cannot validate against the overwritten value.
    pub fn store_direct(&self, value: T) {
        let current = self.cell.lock.load(Ordering::Relaxed);
        self.cell.lock.store(current | LOCKED, Ordering::Relaxed);
        let version = GLOBAL_CLOCK.fetch_add(1, Ordering::AcqRel) + 1;
        self.cell.value.store(value.into_word(), Ordering::Release);
        self.cell.lock.store(version << 1, Ordering::Release);
    }
}

/// `count` cells holding `value`, reserving the whole array up front so an
/// oversized request is reported instead of aborting the process.
pub fn try_vars<T: Word>(count: usize, value: T) -> Result<Box<[TVar<T>]>, TryReserveError> {
    let mut cells = Vec::new();
    cells.try_reserve_exact(count)?;
    cells.extend((0..count).map(|_| TVar::new(value)));
    Ok(cells.into_boxed_slice())
}

impl<T: Word + Default> Default for TVar<T> {
    fn default() -> Self {
        TVar::new(T::default())
    }
}

impl<T: Word + fmt::Debug> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TVar").field(&self.load_direct()).finish()
    }
}

/// Read/write barrier over [`TVar`]s borrowed for `'env`.
pub trait Access<'env> {
    fn read<T: Word>(&mut self, var: &'env TVar<T>) -> TxResult<T>;
    fn write<T: Word>(&mut self, var: &'env TVar<T>, value: T) -> TxResult<()>;
}

/// Non-speculative access: plain loads and stores that never abort.
///
/// Use only under a single-thread guarantee (before workers start, between
/// barriers on the leader, or after the pool has joined).
#[derive(Debug, Default, Clone, Copy)]
pub struct Direct;

impl<'env> Access<'env> for Direct {
    #[inline]
    fn read<T: Word>(&mut self, var: &'env TVar<T>) -> TxResult<T> {
        Ok(var.load_direct())
    }

    #[inline]
    fn write<T: Word>(&mut self, var: &'env TVar<T>, value: T) -> TxResult<()> {
        var.store_direct(value);
        Ok(())
    }
}

/// Run `body` with [`Direct`] access.
///
/// Direct access never aborts, so an `Err` here means the body restarted
/// itself outside of a transaction, which is a logic error in the caller.
pub fn direct<T>(body: impl FnOnce(&mut Direct) -> TxResult<T>) -> T {
    match body(&mut Direct) {
        Ok(value) => value,
        Err(abort) => unreachable!("non-speculative access aborted: {abort}"),
    }
}

/// One speculative attempt.
///
/// A `Txn` is reused across retries of the same region: [`Txn::reset`]
/// drops the read and write sets and samples a new read version.
pub struct Txn<'env> {
    read_version: u64,
    reads: Vec<&'env VersionedWord>,
    writes: Vec<(&'env VersionedWord, u64)>,
    write_slots: AHashMap<usize, usize>,
}

impl<'env> Txn<'env> {
    pub fn begin() -> Self {
        Txn {
            read_version: GLOBAL_CLOCK.load(Ordering::Acquire),
            reads: Vec::new(),
            writes: Vec::new(),
            write_slots: AHashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.write_slots.clear();
        self.read_version = GLOBAL_CLOCK.load(Ordering::Acquire);
    }

    /// Abandon this attempt and re-run the region from the start.
    pub fn restart<T>(&self) -> TxResult<T> {
        Err(Abort::Restart)
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    fn read_word(&mut self, cell: &'env VersionedWord) -> TxResult<u64> {
        if let Some(&slot) = self.write_slots.get(&cell.address()) {
            return Ok(self.writes[slot].1);
        }

        let before = cell.lock.load(Ordering::Acquire);
        if is_locked(before) || version_of(before) > self.read_version {
            return Err(Abort::Conflict);
        }
        let value = cell.value.load(Ordering::Acquire);
        let after = cell.lock.load(Ordering::Acquire);
        if before != after {
            return Err(Abort::Conflict);
        }

        self.reads.push(cell);
        Ok(value)
    }

    fn write_word(&mut self, cell: &'env VersionedWord, word: u64) {
        match self.write_slots.entry(cell.address()) {
            Entry::Occupied(slot) => self.writes[*slot.get()].1 = word,
            Entry::Vacant(slot) => {
                slot.insert(self.writes.len());
                self.writes.push((cell, word));
            }
        }
    }

    /// Try to publish the buffered writes atomically.
    ///
    /// On `Err` nothing was published and the caller must [`reset`](Self::reset)
    /// before re-running the region.
    pub fn commit(&mut self) -> TxResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }

        for (acquired, (cell, _)) in self.writes.iter().enumerate() {
            let current = cell.lock.load(Ordering::Relaxed);
            if is_locked(current)
                || cell
                    .lock
                    .compare_exchange(current, current | LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
            {
                self.release(acquired);
                return Err(Abort::Conflict);
            }
        }

        let write_version = GLOBAL_CLOCK.fetch_add(1, Ordering::AcqRel) + 1;

        // Nobody else committed since we began: the read set is still current.
        if write_version != self.read_version + 1 {
            for cell in &self.reads {
                let word = cell.lock.load(Ordering::Acquire);
                let owned = self.write_slots.contains_key(&cell.address());
                if (is_locked(word) && !owned) || version_of(word) > self.read_version {
                    self.release(self.writes.len());
                    return Err(Abort::Conflict);
                }
            }
        }

        for (cell, word) in &self.writes {
            cell.value.store(*word, Ordering::Release);
            cell.lock.store(write_version << 1, Ordering::Release);
        }
        Ok(())
    }

    fn release(&self, acquired: usize) {
        for (cell, _) in &self.writes[..acquired] {
            cell.lock.fetch_and(!LOCKED, Ordering::Release);
        }
    }
}

impl<'env> Access<'env> for Txn<'env> {
    #[inline]
    fn read<T: Word>(&mut self, var: &'env TVar<T>) -> TxResult<T> {
        self.read_word(&var.cell).map(T::from_word)
    }

    #[inline]
    fn write<T: Word>(&mut self, var: &'env TVar<T>, value: T) -> TxResult<()> {
        self.write_word(&var.cell, value.into_word());
        Ok(())
    }
}

impl fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("read_version", &self.read_version)
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_encodings() {
        assert_eq!(Option::<usize>::from_word(None::<usize>.into_word()), None);
        assert_eq!(Option::<usize>::from_word(Some(7usize).into_word()), Some(7));
        assert!(bool::from_word(true.into_word()));
        assert_eq!(u32::from_word(42u32.into_word()), 42);
    }

    #[test]
    fn test_commit_publishes_writes() {
        let x = TVar::new(1u64);
        let mut txn = Txn::begin();
        let value = txn.read(&x).unwrap();
        txn.write(&x, value + 1).unwrap();
        assert_eq!(x.load_direct(), 1);
        txn.commit().unwrap();
        assert_eq!(x.load_direct(), 2);
    }

    #[test]
    fn test_read_own_write() {
        let x = TVar::new(Some(3usize));
        let mut txn = Txn::begin();
        txn.write(&x, None).unwrap();
        assert_eq!(txn.read(&x), Ok(None));
        assert_eq!(x.load_direct(), Some(3));
    }

    #[test]
    fn test_stale_read_set_aborts_commit() {
        let x = TVar::new(1u64);
        let y = TVar::new(0u64);

        let mut first = Txn::begin();
        assert_eq!(first.read(&x), Ok(1));

        let mut second = Txn::begin();
        second.write(&x, 5).unwrap();
        second.commit().unwrap();

        first.write(&y, 1).unwrap();
        assert_eq!(first.commit(), Err(Abort::Conflict));
        assert_eq!(y.load_direct(), 0);
        assert_eq!(x.load_direct(), 5);
    }

    #[test]
    fn test_read_newer_than_snapshot_aborts() {
        let x = TVar::new(false);
        let mut reader = Txn::begin();

        let mut writer = Txn::begin();
        writer.write(&x, true).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.read(&x), Err(Abort::Conflict));
        reader.reset();
        assert_eq!(reader.read(&x), Ok(true));
    }

    #[test]
    fn test_read_only_commit_always_succeeds() {
        let x = TVar::new(9usize);
        let mut txn = Txn::begin();
        assert_eq!(txn.read(&x), Ok(9));
        assert!(txn.is_read_only());
        assert_eq!(txn.commit(), Ok(()));
    }

    #[test]
    fn test_restart_is_reported() {
        let txn = Txn::begin();
        assert_eq!(txn.restart::<()>(), Err(Abort::Restart));
    }

    #[test]
    fn test_try_vars_reports_oversized_requests() {
        let cells = try_vars(3, Some(2usize)).unwrap();
        assert_eq!(cells.len(), 3);
        assert!(cells.iter().all(|cell| cell.load_direct() == Some(2)));
        assert!(try_vars(usize::MAX / 8, 0u64).is_err());
    }

    #[test]
    fn test_direct_store_invalidates_older_snapshot() {
        let x = TVar::new(0u32);
        let mut txn = Txn::begin();
        x.store_direct(4);
        assert_eq!(txn.read(&x), Err(Abort::Conflict));
        assert_eq!(direct(|access| access.read(&x)), 4);
    }
}
