//! Worker identity, explicit worker contexts, and per-worker slot storage.
//!
//! The runtime has no ambient thread-local worker state. A fixed pool is
//! described by [`WorkerSet`], which mints exactly one [`WorkerCtx`] per
//! index; every per-worker operation takes the context explicitly, so all
//! components are testable single-threaded with synthetic contexts.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{Result, SkeinError};

/// Next unissued ownership token. Process-wide so contexts minted from
/// different sets can never carry the same token: a colliding token would let
/// a foreign iteration re-acquire a record the owner still holds.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Logical worker index inside one [`WorkerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

/// Descriptor of a fixed pool of workers.
///
/// Consuming the set with [`WorkerSet::contexts`] is the only way to mint
/// contexts, which keeps one context per index in circulation.
#[derive(Debug)]
pub struct WorkerSet {
    count: u32,
    token_base: u32,
}

impl WorkerSet {
    /// Describes a pool of `count` workers (`count >= 1`), reserving one
    /// process-unique ownership token per worker.
    pub fn new(count: usize) -> Result<WorkerSet> {
        if count == 0 {
            return Err(SkeinError::InvalidArgument(
                "worker set needs at least one worker".into(),
            ));
        }
        let count = u32::try_from(count)
            .ok()
            .filter(|&c| c < u32::MAX)
            .ok_or_else(|| SkeinError::InvalidArgument("worker count too large".into()))?;
        let base = NEXT_TOKEN.fetch_add(u64::from(count), Ordering::Relaxed);
        if base + u64::from(count) > u64::from(u32::MAX) {
            return Err(SkeinError::InvalidArgument(
                "ownership token space exhausted".into(),
            ));
        }
        Ok(WorkerSet {
            count,
            token_base: base as u32,
        })
    }

    /// Number of workers in the pool.
    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// Mints one context per worker index, consuming the set.
    pub fn contexts(self) -> Vec<WorkerCtx> {
        (0..self.count)
            .map(|i| WorkerCtx {
                id: WorkerId(i),
                workers: self.count,
                token: NonZeroU32::new(self.token_base + i).expect("token counter starts at one"),
            })
            .collect()
    }
}

/// Explicit per-worker context threaded through every core API call.
///
/// Not clonable: APIs that need single-writer access to a worker's slot
/// (insert-bag lanes, iteration scopes) rely on at most one context existing
/// per index of a given set. Keep one set of contexts alive per component
/// wiring.
#[derive(Debug)]
pub struct WorkerCtx {
    id: WorkerId,
    workers: u32,
    token: NonZeroU32,
}

impl WorkerCtx {
    /// This worker's index.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Size of the pool this context belongs to.
    pub fn workers(&self) -> usize {
        self.workers as usize
    }

    /// Nonzero ownership token recorded in guarded-record marks, unique to
    /// this context across every set in the process.
    pub(crate) fn token(&self) -> NonZeroU32 {
        self.token
    }
}

/// One cache-padded slot per worker, indexed by [`WorkerId`].
#[derive(Debug)]
pub struct PerWorker<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerWorker<T> {
    /// Builds one slot per worker of `set`, constructing each with `f`.
    pub fn new(set: &WorkerSet, mut f: impl FnMut(WorkerId) -> T) -> Self {
        let slots = (0..set.count)
            .map(|i| CachePadded::new(f(WorkerId(i))))
            .collect();
        PerWorker { slots }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if there are no slots. Never true for a pool-backed value.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the set this storage was built for.
    pub fn get(&self, id: WorkerId) -> &T {
        &self.slots[id.0 as usize]
    }

    /// Mutable slot for `id`, for quiescent phases.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the set this storage was built for.
    pub fn get_mut(&mut self, id: WorkerId) -> &mut T {
        &mut self.slots[id.0 as usize]
    }

    /// Slots in worker-index order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &**s)
    }

    /// Mutable slots in worker-index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().map(|s| &mut **s)
    }
}
