//! Shared-memory runtime core for amorphous data-parallelism.
//!
//! Parallel worklist algorithms over irregular structures need three things
//! this crate supplies: a way for speculative iterations to touch shared
//! records without corrupting each other, a way for workers to agree that a
//! phase has globally run out of work, and storage that many workers can
//! traverse and accumulate into without fighting over locks.
//!
//! * [`runtime::conflict`] — optimistic per-record conflict detection:
//!   iterations acquire records as they go and the loser of a genuine
//!   conflict aborts with [`ConflictAbort`] for the scheduler to retry.
//! * [`runtime::termination`] — Dijkstra dual-ring termination detection.
//! * [`runtime::bag`] — per-worker segmented insert bags with lock-free
//!   append.
//! * [`graph`] — a versioned on-disk graph image and four interchangeable
//!   immutable-topology in-memory layouts.
//! * [`mem`] — the bulk allocator everything above draws regions from.
//! * [`worker`] — explicit worker contexts threaded through every per-worker
//!   API; there is no ambient thread-local worker state.
//!
//! The worklist scheduler that drives iterations, and the algorithms that
//! run inside them, live outside this crate and consume these interfaces.

pub mod error;
pub mod graph;
pub mod logging;
pub mod mem;
pub mod runtime;
pub mod worker;

pub use error::{ConflictAbort, Result, SkeinError};
