// Growable circular queue over transactional words
// Every operation runs either inside a transaction or with direct access

use std::collections::TryReserveError;
use std::sync::OnceLock;

use rand::Rng;

use crate::stm::{direct, try_vars, Abort, Access, TVar, TxResult, Word};

/// Buffer generations a queue can grow through (capacity doubles each time)
const MAX_GENERATIONS: usize = 48;

/// Unbounded FIFO queue backed by a circular buffer that doubles when full.
///
/// # Layout
///
/// `pop` is the slot *before* the next element to pop and `push` is the next
/// free slot, so the queue is empty when `(pop + 1) % capacity == push`. A
/// push that would make `push` catch up with `pop` grows the buffer first,
/// so at most `capacity - 2` elements are stored before growing.
///
/// # Growth
///
/// Buffers are allocated per generation (`initial_capacity << generation`)
/// and live as long as the queue. A push that grows the queue inside a
/// transaction copies the live elements into the next generation's buffer;
/// if that transaction aborts, the buffer simply stays unused and the retry
/// writes into the same one. References handed out to a transaction can
/// therefore never dangle.
///
/// # Examples
///
/// ```
/// use gasm_common::ConcurrentQueue;
///
/// let queue = ConcurrentQueue::<u64>::new(2);
/// assert!(queue.push_plain(10));
/// assert!(queue.push_plain(20));
/// assert!(queue.push_plain(30));
/// assert_eq!(queue.len_plain(), 3);
/// assert!(queue.capacity_plain() > 3);
/// assert_eq!(queue.pop_plain(), Some(10));
/// ```
pub struct ConcurrentQueue<T: Word> {
    pop: TVar<usize>,
    push: TVar<usize>,
    capacity: TVar<usize>,
    generation: TVar<usize>,
    initial_capacity: usize,
    buffers: Box<[OnceLock<Box<[TVar<T>]>>]>,
}

impl<T: Word> ConcurrentQueue<T> {
    /// Create a queue; capacities below 2 are raised to 2.
    ///
    /// # Panics
    ///
    /// If the first buffer cannot be allocated; see [`try_new`](Self::try_new).
    pub fn new(initial_capacity: usize) -> Self {
        match Self::try_new(initial_capacity) {
            Ok(queue) => queue,
            Err(err) => panic!("queue with capacity {initial_capacity}: {err}"),
        }
    }

    /// Like [`new`](Self::new), but reports allocation failure.
    pub fn try_new(initial_capacity: usize) -> Result<Self, TryReserveError> {
        let capacity = initial_capacity.max(2);
        let buffers: Box<[OnceLock<Box<[TVar<T>]>>]> =
            (0..MAX_GENERATIONS).map(|_| OnceLock::new()).collect();
        // Freshly created, cannot already be set
        let _ = buffers[0].set(try_vars(capacity, T::from_word(0))?);

        Ok(ConcurrentQueue {
            pop: TVar::new(capacity - 1),
            push: TVar::new(0),
            capacity: TVar::new(capacity),
            generation: TVar::new(0),
            initial_capacity: capacity,
            buffers,
        })
    }

    fn slots(&self, generation: usize) -> TxResult<&[TVar<T>]> {
        self.buffers
            .get(generation)
            .and_then(OnceLock::get)
            .map(|buffer| &buffer[..])
            .ok_or(Abort::Conflict)
    }

    /// Buffer for `generation`, allocating it on first use.
    /// Returns `None` if the capacity overflows or the allocation fails.
    fn grow_into(&self, generation: usize) -> Option<&[TVar<T>]> {
        let cell = self.buffers.get(generation)?;
        if let Some(buffer) = cell.get() {
            return Some(&buffer[..]);
        }

        let capacity = u32::try_from(generation)
            .ok()
            .and_then(|shift| self.initial_capacity.checked_mul(1usize.checked_shl(shift)?))?;
        let buffer = try_vars(capacity, T::from_word(0)).ok()?;

        // Another thread may have won the race; either buffer is equivalent.
        let _ = cell.set(buffer);
        cell.get().map(|buffer| &buffer[..])
    }

    /// Append `value`. Returns `false` only if the queue was full and could
    /// not grow.
    pub fn push<'env, A: Access<'env>>(&'env self, access: &mut A, value: T) -> TxResult<bool> {
        let pop = access.read(&self.pop)?;
        let mut push = access.read(&self.push)?;
        let capacity = access.read(&self.capacity)?;
        let generation = access.read(&self.generation)?;
        let mut slots = self.slots(generation)?;
        let mut new_push = (push + 1) % capacity;

        if new_push == pop {
            let next_generation = generation + 1;
            let Some(grown) = self.grow_into(next_generation) else {
                return Ok(false);
            };
            let new_capacity = grown.len();

            let mut dst = 0;
            let mut src = (pop + 1) % capacity;
            while src != push {
                let element = access.read(&slots[src])?;
                access.write(&grown[dst], element)?;
                dst += 1;
                src = (src + 1) % capacity;
            }

            access.write(&self.generation, next_generation)?;
            access.write(&self.capacity, new_capacity)?;
            access.write(&self.pop, new_capacity - 1)?;
            slots = grown;
            push = dst;
            new_push = dst + 1;
        }

        access.write(&slots[push], value)?;
        access.write(&self.push, new_push)?;
        Ok(true)
    }

    /// Remove the oldest element, or `None` when empty. Never blocks.
    pub fn pop<'env, A: Access<'env>>(&'env self, access: &mut A) -> TxResult<Option<T>> {
        let pop = access.read(&self.pop)?;
        let push = access.read(&self.push)?;
        let capacity = access.read(&self.capacity)?;
        let generation = access.read(&self.generation)?;

        let new_pop = (pop + 1) % capacity;
        if new_pop == push {
            return Ok(None);
        }
        let value = access.read(&self.slots(generation)?[new_pop])?;
        access.write(&self.pop, new_pop)?;
        Ok(Some(value))
    }

    pub fn is_empty<'env, A: Access<'env>>(&'env self, access: &mut A) -> TxResult<bool> {
        let pop = access.read(&self.pop)?;
        let push = access.read(&self.push)?;
        let capacity = access.read(&self.capacity)?;
        Ok((pop + 1) % capacity == push)
    }

    pub fn len<'env, A: Access<'env>>(&'env self, access: &mut A) -> TxResult<usize> {
        let pop = access.read(&self.pop)?;
        let push = access.read(&self.push)?;
        let capacity = access.read(&self.capacity)?;
        Ok((push + capacity - pop - 1) % capacity)
    }

    /// Drop every element. Capacity is kept.
    pub fn clear<'env, A: Access<'env>>(&'env self, access: &mut A) -> TxResult<()> {
        let capacity = access.read(&self.capacity)?;
        access.write(&self.pop, capacity - 1)?;
        access.write(&self.push, 0)
    }

    /// Uniformly permute the live elements (Fisher-Yates over logical
    /// positions, wrapping around the end of the buffer).
    pub fn shuffle<'env, A, R>(&'env self, access: &mut A, rng: &mut R) -> TxResult<()>
    where
        A: Access<'env>,
        R: Rng + ?Sized,
    {
        let pop = access.read(&self.pop)?;
        let push = access.read(&self.push)?;
        let capacity = access.read(&self.capacity)?;
        let generation = access.read(&self.generation)?;
        let slots = self.slots(generation)?;

        let len = (push + capacity - pop - 1) % capacity;
        let first = (pop + 1) % capacity;
        for i in (1..len).rev() {
            let j = rng.gen_range(0..=i);
            if i == j {
                continue;
            }
            let a = &slots[(first + i) % capacity];
            let b = &slots[(first + j) % capacity];
            let value_a = access.read(a)?;
            let value_b = access.read(b)?;
            access.write(a, value_b)?;
            access.write(b, value_a)?;
        }
        Ok(())
    }

    pub fn push_plain(&self, value: T) -> bool {
        direct(|access| self.push(access, value))
    }

    pub fn pop_plain(&self) -> Option<T> {
        direct(|access| self.pop(access))
    }

    pub fn is_empty_plain(&self) -> bool {
        direct(|access| self.is_empty(access))
    }

    pub fn len_plain(&self) -> usize {
        direct(|access| self.len(access))
    }

    pub fn clear_plain(&self) {
        direct(|access| self.clear(access))
    }

    pub fn shuffle_plain<R: Rng + ?Sized>(&self, rng: &mut R) {
        direct(|access| self.shuffle(access, rng))
    }

    /// Current buffer capacity.
    pub fn capacity_plain(&self) -> usize {
        self.capacity.load_direct()
    }
}

impl<T: Word> std::fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("pop", &self.pop.load_direct())
            .field("push", &self.push.load_direct())
            .field("capacity", &self.capacity.load_direct())
            .field("generation", &self.generation.load_direct())
            .finish()
    }
}
