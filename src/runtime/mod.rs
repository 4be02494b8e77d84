//! Concurrency substrate: optimistic conflict detection, ring-based
//! termination detection, and per-worker insert bags.

pub mod bag;
pub mod conflict;
pub mod termination;

pub use bag::InsertBag;
pub use conflict::{AccessMode, Guarded, Iteration, Lockable, OwnerMark};
pub use termination::TerminationDetector;
