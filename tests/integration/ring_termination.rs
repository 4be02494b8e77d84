//! Termination-detection liveness and deferral under real threads.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use skein::runtime::TerminationDetector;
use skein::worker::WorkerSet;

const WORKERS: usize = 4;
const POLL_LIMIT: Duration = Duration::from_secs(10);

/// Polls until the detector declares termination, failing the test if it
/// takes unreasonably long.
fn poll_until_done(det: &TerminationDetector, ctx: &mut skein::worker::WorkerCtx) {
    let deadline = Instant::now() + POLL_LIMIT;
    while !det.global_termination() {
        det.local_termination(ctx);
        assert!(Instant::now() < deadline, "termination never declared");
        std::hint::spin_loop();
    }
}

#[test]
fn quiescent_workers_terminate() {
    let set = WorkerSet::new(WORKERS).unwrap();
    let det = Arc::new(TerminationDetector::new(&set));
    let barrier = Arc::new(Barrier::new(WORKERS));

    thread::scope(|s| {
        for mut ctx in set.contexts() {
            let det = Arc::clone(&det);
            let barrier = Arc::clone(&barrier);
            s.spawn(move || {
                barrier.wait();
                poll_until_done(&det, &mut ctx);
            });
        }
    });
    assert!(det.global_termination());
}

#[test]
fn workers_with_phased_work_terminate_after_the_last_producer() {
    let set = WorkerSet::new(WORKERS).unwrap();
    let det = Arc::new(TerminationDetector::new(&set));
    let barrier = Arc::new(Barrier::new(WORKERS));
    let produced = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        for mut ctx in set.contexts() {
            let det = Arc::clone(&det);
            let barrier = Arc::clone(&barrier);
            let produced = Arc::clone(&produced);
            s.spawn(move || {
                barrier.wait();
                // Simulate a burst of local work before going quiet.
                for _ in 0..100 * (ctx.id().0 as usize + 1) {
                    det.work_happened(&ctx);
                    produced.fetch_add(1, Ordering::Relaxed);
                }
                poll_until_done(&det, &mut ctx);
            });
        }
    });
    assert!(det.global_termination());
    assert_eq!(produced.load(Ordering::Relaxed), 100 * (1 + 2 + 3 + 4));
}

#[test]
fn late_work_defers_termination_until_the_next_circuit() {
    // Single-threaded ring walk so the deferral is observable step by step.
    let set = WorkerSet::new(3).unwrap();
    let det = TerminationDetector::new(&set);
    let mut ctxs = set.contexts();

    // First circuit flushes the initial black token and initial dirt.
    for ctx in &ctxs {
        det.local_termination(ctx);
    }
    // Worker 0 relaunches white; worker 1 produces before passing.
    det.local_termination(&ctxs[0]);
    det.work_happened(&ctxs[1]);
    det.local_termination(&ctxs[1]);
    det.local_termination(&ctxs[2]);
    det.local_termination(&ctxs[0]);
    assert!(
        !det.global_termination(),
        "the blackened token forces another circuit"
    );

    // A clean circuit then declares.
    det.local_termination(&ctxs[1]);
    det.local_termination(&ctxs[2]);
    det.local_termination(&ctxs[0]);
    assert!(det.global_termination());

    // Reset re-arms the ring for the next phase.
    let mut det = det;
    det.reset();
    assert!(!det.global_termination());
    for _ in 0..3 {
        for ctx in &mut ctxs {
            det.local_termination(ctx);
        }
    }
    assert!(det.global_termination());
}

#[test]
fn detector_declares_exactly_once_per_phase() {
    let set = WorkerSet::new(2).unwrap();
    let det = Arc::new(TerminationDetector::new(&set));
    let barrier = Arc::new(Barrier::new(2));
    let observed = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        for mut ctx in set.contexts() {
            let det = Arc::clone(&det);
            let barrier = Arc::clone(&barrier);
            let observed = Arc::clone(&observed);
            s.spawn(move || {
                barrier.wait();
                let was_done = det.global_termination();
                poll_until_done(&det, &mut ctx);
                if !was_done {
                    observed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    assert!(det.global_termination());
    assert_eq!(observed.load(Ordering::Relaxed), 2);
}
