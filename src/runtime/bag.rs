//! Concurrent per-worker output accumulation.
//!
//! An [`InsertBag`] keeps one lane per worker. Appends go to the lane of the
//! calling worker's context and never synchronize with other workers: when
//! the lane's head segment is full (or absent) a page-sized segment is taken
//! from the [`PagePool`] and linked as the new head, and the value is
//! constructed in place at the segment's end cursor. Iteration walks lanes
//! in worker-index order, newest segment first, and is meant for the phase
//! after all producers have finished; the `&mut self` receivers encode that
//! contract in the borrow checker.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::Arc;

use tracing::trace;

use crate::mem::{PagePool, Region, PAGE_SIZE};
use crate::worker::{PerWorker, WorkerCtx, WorkerId, WorkerSet};

/// One page-backed run of elements; lanes link segments newest-first.
struct Segment<T> {
    page: Region,
    len: usize,
    cap: usize,
    next: Option<Box<Segment<T>>>,
    _marker: PhantomData<T>,
}

impl<T> Segment<T> {
    /// Links a fresh segment in front of `next`.
    ///
    /// Allocation failure is fatal here: the hot path has no fallback.
    fn fresh(pool: &PagePool, next: Option<Box<Segment<T>>>) -> Box<Segment<T>> {
        let elem = size_of::<T>();
        let page = if elem > PAGE_SIZE {
            Region::alloc(elem, crate::mem::AllocPolicy::Local)
        } else {
            pool.alloc()
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => panic!("insert bag segment allocation failed: {e}"),
        };
        let cap = if elem == 0 { PAGE_SIZE } else { page.len() / elem };
        trace!(cap, "linked fresh bag segment");
        Box::new(Segment {
            page,
            len: 0,
            cap,
            next,
            _marker: PhantomData,
        })
    }

    fn base(&self) -> *mut T {
        self.page.base().cast()
    }
}

/// Per-worker segment list head.
struct Lane<T> {
    head: UnsafeCell<Option<Box<Segment<T>>>>,
}

// SAFETY: a lane has a single writer (push requires the exclusive context of
// the lane's worker, and contexts are unique per set); readers hold either
// `&mut InsertBag` or that same exclusive context, so reads never overlap a
// write.
unsafe impl<T: Send> Sync for Lane<T> {}

/// Concurrent, per-worker-partitioned, append-only container.
pub struct InsertBag<T: Send> {
    lanes: PerWorker<Lane<T>>,
    pool: Arc<PagePool>,
}

impl<T: Send> InsertBag<T> {
    /// Empty bag with one lane per worker of `set`, drawing segment pages
    /// from `pool`.
    pub fn new(set: &WorkerSet, pool: Arc<PagePool>) -> InsertBag<T> {
        assert!(
            align_of::<T>() <= PAGE_SIZE,
            "element alignment exceeds the segment page"
        );
        InsertBag {
            lanes: PerWorker::new(set, |_| Lane {
                head: UnsafeCell::new(None),
            }),
            pool,
        }
    }

    /// Appends `value` to the calling worker's lane and returns a reference
    /// to the constructed element, stable until the bag is cleared or
    /// dropped.
    ///
    /// Lock-free with respect to all other workers.
    ///
    /// # Panics
    ///
    /// Panics if a fresh segment cannot be allocated.
    pub fn push<'b>(&'b self, ctx: &mut WorkerCtx, value: T) -> &'b T {
        let lane = self.lanes.get(ctx.id());
        // SAFETY: `ctx` is the exclusive context of this lane's worker, so
        // no other call is reading or writing the lane.
        let head = unsafe { &mut *lane.head.get() };
        let seg = match head {
            Some(seg) if seg.len < seg.cap => seg,
            slot => {
                let fresh = Segment::fresh(&self.pool, slot.take());
                slot.insert(fresh)
            }
        };
        let idx = seg.len;
        // SAFETY: `idx < cap`, slot `idx` is within the segment's page and
        // uninitialized.
        unsafe { seg.base().add(idx).write(value) };
        seg.len = idx + 1;
        // SAFETY: slot `idx` was just initialized; segments never move.
        unsafe { &*seg.base().add(idx) }
    }

    /// Global view over all lanes, worker-index order, newest segment first.
    ///
    /// Takes `&mut self`: producers must be done for the phase.
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter {
            lanes: &self.lanes,
            lane: 0,
            seg: None,
            pos: 0,
        }
    }

    /// Like [`InsertBag::iter`], yielding mutable references.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        IterMut {
            lanes: &self.lanes,
            lane: 0,
            seg: None,
            pos: 0,
            _mut: PhantomData,
        }
    }

    /// View over the calling worker's own lane only, newest segment first.
    ///
    /// Borrowing the context keeps the lane's writer out while the iterator
    /// lives; other workers' lanes are untouched.
    pub fn local_iter<'b>(&'b self, ctx: &'b mut WorkerCtx) -> LocalIter<'b, T> {
        let lane = self.lanes.get(ctx.id());
        // SAFETY: exclusive borrow of the lane's writer context for 'b.
        let seg = unsafe { (*lane.head.get()).as_deref() };
        LocalIter {
            seg,
            pos: 0,
            _ctx: PhantomData,
        }
    }

    /// Drops all elements and returns every segment page to the pool.
    pub fn clear(&mut self) {
        let pool = Arc::clone(&self.pool);
        for lane in self.lanes.iter_mut() {
            let mut head = lane.head.get_mut().take();
            while let Some(seg) = head {
                let Segment { page, len, next, .. } = *seg;
                // SAFETY: the first `len` slots of the segment are
                // initialized elements.
                unsafe {
                    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                        page.base().cast::<T>(),
                        len,
                    ))
                };
                pool.recycle(page);
                head = next;
            }
        }
    }
}

impl<T: Send> Drop for InsertBag<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Shared iterator over a quiescent bag.
pub struct Iter<'a, T: Send> {
    lanes: &'a PerWorker<Lane<T>>,
    lane: usize,
    seg: Option<&'a Segment<T>>,
    pos: usize,
}

impl<'a, T: Send> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            if let Some(seg) = self.seg {
                if self.pos < seg.len {
                    let idx = self.pos;
                    self.pos += 1;
                    // SAFETY: `idx < len`, element initialized; the bag is
                    // exclusively borrowed for 'a so no writer is active.
                    return Some(unsafe { &*seg.base().add(idx) });
                }
                self.seg = seg.next.as_deref();
                self.pos = 0;
                continue;
            }
            if self.lane == self.lanes.len() {
                return None;
            }
            let lane = self.lanes.get(WorkerId(self.lane as u32));
            // SAFETY: as above; the exclusive bag borrow covers lane heads.
            self.seg = unsafe { (*lane.head.get()).as_deref() };
            self.lane += 1;
            self.pos = 0;
        }
    }
}

/// Mutable iterator over a quiescent bag.
pub struct IterMut<'a, T: Send> {
    lanes: &'a PerWorker<Lane<T>>,
    lane: usize,
    seg: Option<*mut Segment<T>>,
    pos: usize,
    _mut: PhantomData<&'a mut T>,
}

impl<'a, T: Send> Iterator for IterMut<'a, T> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        loop {
            if let Some(seg) = self.seg {
                // SAFETY: segment pointers stay valid for 'a; the bag is
                // exclusively borrowed and each slot is yielded once.
                let seg = unsafe { &mut *seg };
                if self.pos < seg.len {
                    let idx = self.pos;
                    self.pos += 1;
                    // SAFETY: as above.
                    return Some(unsafe { &mut *seg.base().add(idx) });
                }
                self.seg = seg.next.as_deref_mut().map(|s| s as *mut _);
                self.pos = 0;
                continue;
            }
            if self.lane == self.lanes.len() {
                return None;
            }
            let lane = self.lanes.get(WorkerId(self.lane as u32));
            // SAFETY: exclusive bag borrow; lane heads are quiescent.
            self.seg = unsafe { (*lane.head.get()).as_deref_mut().map(|s| s as *mut _) };
            self.lane += 1;
            self.pos = 0;
        }
    }
}

/// Iterator over one worker's lane.
pub struct LocalIter<'a, T> {
    seg: Option<&'a Segment<T>>,
    pos: usize,
    _ctx: PhantomData<&'a mut WorkerCtx>,
}

impl<'a, T> Iterator for LocalIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            let seg = self.seg?;
            if self.pos < seg.len {
                let idx = self.pos;
                self.pos += 1;
                // SAFETY: `idx < len`; the lane's writer context is borrowed
                // for 'a, so the segment is not being appended to.
                return Some(unsafe { &*seg.base().add(idx) });
            }
            self.seg = seg.next.as_deref();
            self.pos = 0;
        }
    }
}
