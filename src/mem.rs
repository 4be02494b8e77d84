//! Bulk memory: page-aligned regions, typed slabs, and page recycling.
//!
//! Everything in the runtime that holds bulk data (graph arenas, insert-bag
//! segments) allocates through this module rather than the global allocator.
//! Regions are anonymous mappings, so they come back zeroed, page-aligned,
//! and are returned to the OS on drop.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::slice;

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, SkeinError};

/// Allocation quantum for insert-bag segments and the recycling pool.
pub const PAGE_SIZE: usize = 4096;

/// Default number of idle pages a [`PagePool`] retains before freeing.
pub const DEFAULT_IDLE_PAGES: usize = 64;

/// Rounds `value` up to the next multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
pub const fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Placement request for a large region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocPolicy {
    /// No placement preference; pages fault in wherever the first toucher
    /// runs.
    #[default]
    Local,
    /// Request bandwidth-spreading placement for regions every worker scans.
    ///
    /// Anonymous mappings are populated first-touch, so a region built in
    /// parallel by all workers ends up spread across their memory nodes;
    /// this policy is advice recorded on the region, not a hard binding.
    Interleaved,
}

/// Size in bytes of one OS page.
pub fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    PAGE_SIZE
}

/// An owned, page-aligned memory region, zero-initialized when freshly
/// mapped (a [`PagePool`] may hand back a recycled region with old contents).
///
/// The base pointer is stable for the region's lifetime. The region itself
/// performs no access mediation; owners that share a region across threads
/// are responsible for aliasing discipline.
pub struct Region {
    map: MmapMut,
    base: *mut u8,
    policy: AllocPolicy,
}

// SAFETY: the region is plain anonymous memory owned by this value; the raw
// base pointer is dereferenced only by owners that manage aliasing.
unsafe impl Send for Region {}
// SAFETY: as above; `&Region` exposes the base pointer but no accesses.
unsafe impl Sync for Region {}

impl Region {
    /// Allocates a region of at least `len` bytes, rounded up to the OS page
    /// size.
    pub fn alloc(len: usize, policy: AllocPolicy) -> Result<Region> {
        if len == 0 {
            return Err(SkeinError::InvalidArgument(
                "zero-length region requested".into(),
            ));
        }
        let rounded = align_up(len, os_page_size());
        let mut map =
            MmapMut::map_anon(rounded).map_err(|source| SkeinError::Alloc { len, source })?;
        let base = map.as_mut_ptr();
        Ok(Region { map, base, policy })
    }

    /// Length in bytes after page rounding.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if the region holds no bytes. Never true for a live allocation.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Placement policy recorded at allocation time.
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Base pointer, valid for `len()` bytes until the region is dropped.
    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// A typed array carved from one [`Region`].
///
/// Elements are constructed in place at build time and dropped in place when
/// the slab is dropped. Zero-length slabs and zero-sized element types hold
/// no region at all.
pub struct Slab<T> {
    region: Option<Region>,
    len: usize,
    _marker: PhantomData<T>,
}

// SAFETY: a slab is an owned array; thread-safety follows the element type.
unsafe impl<T: Send> Send for Slab<T> {}
// SAFETY: as above.
unsafe impl<T: Sync> Sync for Slab<T> {}

/// Drops the already-initialized prefix if an element initializer panics.
struct InitGuard<T> {
    base: *mut T,
    built: usize,
}

impl<T> Drop for InitGuard<T> {
    fn drop(&mut self) {
        // SAFETY: exactly `built` leading elements were initialized.
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base, self.built)) }
    }
}

impl<T> Slab<T> {
    /// Builds a slab of `len` elements, constructing each with `f(index)`.
    pub fn from_fn(len: usize, policy: AllocPolicy, mut f: impl FnMut(usize) -> T) -> Result<Self> {
        let byte_len = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| SkeinError::InvalidArgument("slab byte length overflows".into()))?;
        let region = if byte_len == 0 {
            None
        } else {
            Some(Region::alloc(byte_len, policy)?)
        };
        let mut slab = Slab {
            region,
            len: 0,
            _marker: PhantomData,
        };
        let base: *mut T = slab.base_ptr();
        debug_assert_eq!(base as usize % std::mem::align_of::<T>().max(1), 0);
        let mut guard = InitGuard { base, built: 0 };
        for i in 0..len {
            let value = f(i);
            // SAFETY: `base` is valid for `len` elements (or dangling for a
            // zero-byte slab, where writes are zero-sized) and slot `i` is
            // uninitialized.
            unsafe { base.add(i).write(value) };
            guard.built = i + 1;
        }
        std::mem::forget(guard);
        slab.len = len;
        Ok(slab)
    }

    /// Builds a slab of `len` default-constructed elements.
    pub fn with_default(len: usize, policy: AllocPolicy) -> Result<Self>
    where
        T: Default,
    {
        Self::from_fn(len, policy, |_| T::default())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the slab holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base_ptr(&self) -> *mut T {
        match &self.region {
            Some(r) => r.base().cast(),
            None => NonNull::dangling().as_ptr(),
        }
    }
}

impl<T> std::ops::Deref for Slab<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` elements were initialized by `from_fn` and stay
        // valid until drop.
        unsafe { slice::from_raw_parts(self.base_ptr(), self.len) }
    }
}

impl<T> std::ops::DerefMut for Slab<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as for `deref`, plus `&mut self` gives exclusivity.
        unsafe { slice::from_raw_parts_mut(self.base_ptr(), self.len) }
    }
}

impl<T> Drop for Slab<T> {
    fn drop(&mut self) {
        // SAFETY: all `len` elements are initialized; the region outlives
        // this call.
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base_ptr(), self.len)) }
    }
}

impl<T: fmt::Debug> fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Recycling pool of [`PAGE_SIZE`] regions for insert-bag segments.
///
/// Explicit process state: components that allocate pages hold a handle to
/// the pool they were given, and the pool frees its idle pages when dropped.
pub struct PagePool {
    idle: Mutex<Vec<Region>>,
    max_idle: usize,
}

impl PagePool {
    /// Pool retaining up to [`DEFAULT_IDLE_PAGES`] idle pages.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_IDLE_PAGES)
    }

    /// Pool retaining up to `max_idle` idle pages before freeing extras.
    pub fn with_capacity(max_idle: usize) -> Self {
        PagePool {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Hands out an idle page or allocates a fresh one.
    ///
    /// Only freshly mapped pages are zeroed; a recycled page keeps whatever
    /// bytes its previous owner left behind.
    pub fn alloc(&self) -> Result<Region> {
        if let Some(region) = self.idle.lock().pop() {
            return Ok(region);
        }
        trace!(bytes = PAGE_SIZE, "page pool allocating fresh page");
        Region::alloc(PAGE_SIZE, AllocPolicy::Local)
    }

    /// Returns a page to the pool; undersized or surplus regions are freed.
    pub fn recycle(&self, region: Region) {
        if region.len() < PAGE_SIZE {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(region);
        }
    }

    /// Number of pages currently held idle.
    pub fn idle_pages(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("idle", &self.idle_pages())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}
