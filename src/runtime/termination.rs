//! Distributed termination detection (Dijkstra dual-ring coloring).
//!
//! Workers form a logical ring in index order. One token circulates; worker
//! 0 starts out holding a black token and every worker starts dirty, which
//! forces at least one full circuit before termination can be declared.
//! A worker that runs out of deferred work polls [`TerminationDetector::
//! local_termination`]: if it holds the token it forwards it, blackened when
//! the worker did work since it last passed the token; worker 0 instead
//! launches a fresh white token. Termination is declared when worker 0, not
//! dirty itself, receives a token that stayed white for a full circuit.
//!
//! The declaration is sound as long as every path that enqueues new work
//! calls [`TerminationDetector::work_happened`] before making that work
//! visible to other workers: the dirty flag then blackens the next pass and
//! the white circuit restarts.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::worker::{PerWorker, WorkerCtx, WorkerId, WorkerSet};

/// Per-worker token state.
#[derive(Debug)]
struct TokenSlot {
    has_token: AtomicBool,
    token_black: AtomicBool,
    worker_black: AtomicBool,
}

impl TokenSlot {
    fn initial(first: bool) -> TokenSlot {
        TokenSlot {
            has_token: AtomicBool::new(first),
            token_black: AtomicBool::new(first),
            worker_black: AtomicBool::new(true),
        }
    }
}

/// Pollable ring-based quiescence detector for one worker set.
#[derive(Debug)]
pub struct TerminationDetector {
    slots: PerWorker<TokenSlot>,
    done: AtomicBool,
}

impl TerminationDetector {
    /// Detector armed for a phase over the workers of `set`.
    pub fn new(set: &WorkerSet) -> TerminationDetector {
        TerminationDetector {
            slots: PerWorker::new(set, |id| TokenSlot::initial(id == WorkerId(0))),
            done: AtomicBool::new(false),
        }
    }

    /// Marks the calling worker dirty.
    ///
    /// Must be called before newly produced work becomes visible to any
    /// other worker; otherwise a white circuit can complete between the
    /// publication and the mark, declaring termination with work pending.
    pub fn work_happened(&self, ctx: &WorkerCtx) {
        // Only this worker reads the flag back, in program order.
        self.slots
            .get(ctx.id())
            .worker_black
            .store(true, Ordering::Relaxed);
    }

    /// Poll from a worker with no deferred work; forwards the token if the
    /// worker holds it.
    pub fn local_termination(&self, ctx: &WorkerCtx) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let me = ctx.id();
        let slot = self.slots.get(me);
        if !slot.has_token.load(Ordering::Acquire) {
            return;
        }
        let token_black = slot.token_black.load(Ordering::Relaxed);
        let worker_black = slot.worker_black.load(Ordering::Relaxed);
        slot.has_token.store(false, Ordering::Relaxed);
        slot.worker_black.store(false, Ordering::Relaxed);

        let ring = self.slots.len() as u32;
        if me == WorkerId(0) {
            if !token_black && !worker_black {
                debug!("white circuit complete, declaring global termination");
                self.done.store(true, Ordering::Release);
                return;
            }
            // Launch a fresh white circuit.
            self.pass(WorkerId(1 % ring), false);
        } else {
            self.pass(WorkerId((me.0 + 1) % ring), token_black || worker_black);
        }
    }

    fn pass(&self, to: WorkerId, black: bool) {
        let slot = self.slots.get(to);
        slot.token_black.store(black, Ordering::Relaxed);
        // The release store publishes the token color written above.
        slot.has_token.store(true, Ordering::Release);
        trace!(to = to.0, black, "token passed");
    }

    /// True once the current phase has globally terminated.
    pub fn global_termination(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Re-arms the detector for the next phase.
    pub fn reset(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            *slot = TokenSlot::initial(i == 0);
        }
        *self.done.get_mut() = false;
    }
}
