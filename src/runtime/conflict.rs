//! Optimistic per-record conflict detection.
//!
//! Every guarded record embeds an [`OwnerMark`], an atomic word that is
//! either free or holds the token of the worker whose iteration currently
//! owns the record. An [`Iteration`] is one speculative unit of work: it
//! acquires marks as the records are touched, re-acquiring its own marks as
//! a no-op, and releases everything it holds when it goes out of scope,
//! whether by [`Iteration::commit`], [`Iteration::abort`], or unwinding.
//!
//! Acquisition never blocks. A claim against a record owned by a different
//! iteration spins a short, bounded grace window and then fails with
//! [`ConflictAbort`], which the scheduler driving iterations catches to roll
//! back and retry. The components here never catch it themselves.
//!
//! Exclusivity argument, relied on by every accessor that hands out
//! `&mut T` from a shared container:
//!
//! * across threads, a record is touched only between a winning claim
//!   (compare-and-swap with acquire ordering) and the matching release
//!   (store with release ordering), so successive owners are ordered;
//! * within a thread, returned references borrow the `&mut Iteration`, so a
//!   second access cannot start while one is live, and at most one iteration
//!   exists per worker because it borrows the [`WorkerCtx`] mutably;
//! * tokens are process-unique per context, so a claim can only ever read
//!   back as already-mine for the iteration that actually holds it.
//!
//! Safe accessors always claim before handing out payload; the only way to
//! reach payload without a claim is through the `unsafe` unguarded methods,
//! whose contract shifts the exclusivity argument to the caller's phase
//! structure.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;
use tracing::trace;

use crate::error::ConflictAbort;
use crate::worker::{WorkerCtx, WorkerId};

/// Mark value meaning "no owner".
const FREE: u32 = 0;

/// Bound on the claim retry loop. Conflicts abort rather than block, so this
/// only needs to ride out a release that is already in flight.
const CLAIM_SPINS: usize = 32;

/// Per-acquisition conflict-detection policy.
///
/// Applies only to operations that take no payload reference: explicit
/// [`Iteration::acquire`] calls and edge-handle iteration. Accessors that
/// hand out `&mut` payload always acquire; their unguarded escape hatches
/// are separate `unsafe` methods carrying the phase-exclusivity obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Check for conflicts and record ownership (the default).
    #[default]
    ReadWrite,
    /// Skip conflict detection entirely.
    ///
    /// The caller asserts that phase structure makes the access safe (for
    /// example, a read-only phase, or construction before sharing).
    Unguarded,
}

/// Outcome of one claim attempt.
enum Claim {
    Won,
    Mine,
    Lost,
}

/// Atomic ownership marker embedded in every guarded record.
///
/// Initialized free; holds the owning worker's nonzero token while an
/// iteration has the record acquired.
pub struct OwnerMark {
    owner: AtomicU32,
}

impl OwnerMark {
    /// A free mark.
    pub const fn new() -> OwnerMark {
        OwnerMark {
            owner: AtomicU32::new(FREE),
        }
    }

    /// Diagnostic: whether some iteration currently owns the record.
    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != FREE
    }

    fn claim(&self, token: NonZeroU32) -> Claim {
        let want = token.get();
        for _ in 0..CLAIM_SPINS {
            match self
                .owner
                .compare_exchange_weak(FREE, want, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Claim::Won,
                Err(cur) if cur == want => return Claim::Mine,
                Err(_) => std::hint::spin_loop(),
            }
        }
        Claim::Lost
    }

    fn release(&self) {
        self.owner.store(FREE, Ordering::Release);
    }
}

impl Default for OwnerMark {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OwnerMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerMark")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish()
    }
}

/// Capability trait: any record type exposing its mark participates in the
/// conflict-detection protocol uniformly.
pub trait Lockable {
    /// The record's embedded ownership marker.
    fn owner_mark(&self) -> &OwnerMark;
}

/// One speculative iteration scope for a worker.
///
/// Created from an exclusive borrow of the worker's context, so a worker
/// runs at most one iteration at a time. Holds the ledger of acquired marks
/// and releases all of them when dropped.
pub struct Iteration<'a> {
    ctx: &'a mut WorkerCtx,
    held: SmallVec<[&'a OwnerMark; 8]>,
}

impl<'a> Iteration<'a> {
    /// Opens an iteration scope for the worker behind `ctx`.
    pub fn begin(ctx: &'a mut WorkerCtx) -> Iteration<'a> {
        Iteration {
            ctx,
            held: SmallVec::new(),
        }
    }

    /// The worker this iteration runs on.
    pub fn worker(&self) -> WorkerId {
        self.ctx.id()
    }

    /// Acquires `record` for this iteration under `mode`.
    ///
    /// Re-acquiring a record this iteration already owns is a no-op. A
    /// record owned by another live iteration fails with [`ConflictAbort`]
    /// after a bounded spin.
    pub fn acquire<L>(&mut self, record: &'a L, mode: AccessMode) -> Result<(), ConflictAbort>
    where
        L: Lockable + ?Sized,
    {
        self.acquire_mark(record.owner_mark(), mode)
    }

    pub(crate) fn acquire_mark(
        &mut self,
        mark: &'a OwnerMark,
        mode: AccessMode,
    ) -> Result<(), ConflictAbort> {
        if mode == AccessMode::Unguarded {
            return Ok(());
        }
        match mark.claim(self.ctx.token()) {
            Claim::Won => {
                self.held.push(mark);
                Ok(())
            }
            Claim::Mine => Ok(()),
            Claim::Lost => {
                trace!(worker = self.ctx.id().0, "acquire lost to a concurrent owner");
                Err(ConflictAbort)
            }
        }
    }

    /// Closes the scope after the iteration's effects are final.
    pub fn commit(self) {}

    /// Closes the scope after the caller has discarded tentative effects.
    ///
    /// Identical to dropping the iteration; named for call-site clarity in
    /// schedulers.
    pub fn abort(self) {}
}

impl Drop for Iteration<'_> {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            trace!(
                worker = self.ctx.id().0,
                records = self.held.len(),
                "releasing iteration ownership"
            );
        }
        for mark in self.held.drain(..) {
            mark.release();
        }
    }
}

/// Interior-mutable payload cell for guarded records.
///
/// Access goes through the owning container's API, which either holds the
/// record's mark or an exclusive borrow of the container.
pub(crate) struct RecordCell<T>(UnsafeCell<T>);

// SAFETY: every access path is mediated by an OwnerMark claim or by an
// exclusive borrow of the container holding the cell.
unsafe impl<T: Send> Sync for RecordCell<T> {}

impl<T> RecordCell<T> {
    pub(crate) const fn new(value: T) -> RecordCell<T> {
        RecordCell(UnsafeCell::new(value))
    }

    pub(crate) fn get(&self) -> *mut T {
        self.0.get()
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }

    pub(crate) fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

/// Adapts an arbitrary value into a guarded record for use outside the
/// graph layouts.
pub struct Guarded<T> {
    mark: OwnerMark,
    value: RecordCell<T>,
}

impl<T> Guarded<T> {
    /// Wraps `value` with a free mark.
    pub const fn new(value: T) -> Guarded<T> {
        Guarded {
            mark: OwnerMark::new(),
            value: RecordCell::new(value),
        }
    }

    /// Acquires the record for `it` and returns the payload.
    ///
    /// The reference borrows the iteration, so the payload of another record
    /// cannot be fetched while this one is live; fetch, use, repeat.
    pub fn get<'a, 'i>(&'a self, it: &'i mut Iteration<'a>) -> Result<&'i mut T, ConflictAbort> {
        it.acquire_mark(&self.mark, AccessMode::ReadWrite)?;
        // SAFETY: exclusivity per the module protocol: the mark is ours and
        // the borrow of `it` prevents overlapping references from this
        // thread.
        Ok(unsafe { &mut *self.value.get() })
    }

    /// Payload access that bypasses the mark entirely.
    ///
    /// # Safety
    ///
    /// The caller must guarantee phase-level exclusivity: for the returned
    /// borrow's lifetime, no other reference to this payload may exist and
    /// no other thread may access the record through any path. Nothing here
    /// checks the assertion.
    pub unsafe fn get_unguarded(&self) -> &mut T {
        &mut *self.value.get()
    }

    /// Direct access for quiescent phases.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Unwraps the payload.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> Lockable for Guarded<T> {
    fn owner_mark(&self) -> &OwnerMark {
        &self.mark
    }
}

impl<T> From<T> for Guarded<T> {
    fn from(value: T) -> Self {
        Guarded::new(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded")
            .field("held", &self.mark.is_held())
            .finish_non_exhaustive()
    }
}
