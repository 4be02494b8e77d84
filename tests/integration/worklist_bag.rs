//! Insert-bag multiset completeness under concurrent producers.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use skein::mem::{PagePool, PAGE_SIZE};
use skein::runtime::InsertBag;
use skein::worker::WorkerSet;

const WORKERS: usize = 4;
const PER_WORKER: usize = 25_000;

#[test]
fn concurrent_pushes_yield_the_exact_multiset() {
    let set = WorkerSet::new(WORKERS).unwrap();
    let pool = Arc::new(PagePool::new());
    let bag: InsertBag<u64> = InsertBag::new(&set, pool);
    let barrier = Barrier::new(WORKERS);

    thread::scope(|s| {
        for mut ctx in set.contexts() {
            let bag = &bag;
            let barrier = &barrier;
            s.spawn(move || {
                let base = ctx.id().0 as u64 * PER_WORKER as u64;
                barrier.wait();
                for k in 0..PER_WORKER as u64 {
                    let stored = bag.push(&mut ctx, base + k);
                    assert_eq!(*stored, base + k);
                }
            });
        }
    });

    let mut bag = bag;
    let seen: Vec<u64> = bag.iter().copied().collect();
    assert_eq!(seen.len(), WORKERS * PER_WORKER, "no omissions");
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "no duplicates");
    assert_eq!(
        unique.len(),
        WORKERS * PER_WORKER,
        "exactly the pushed values"
    );
}

#[test]
fn local_views_partition_the_global_view() {
    let set = WorkerSet::new(3).unwrap();
    let pool = Arc::new(PagePool::new());
    let bag: InsertBag<(u32, u32)> = InsertBag::new(&set, pool);
    let mut ctxs = set.contexts();

    for ctx in &mut ctxs {
        for k in 0..500 {
            bag.push(ctx, (ctx.id().0, k));
        }
    }
    for ctx in &mut ctxs {
        let id = ctx.id().0;
        let local: Vec<(u32, u32)> = bag.local_iter(ctx).copied().collect();
        assert_eq!(local.len(), 500);
        assert!(local.iter().all(|&(owner, _)| owner == id));
    }
    let mut bag = bag;
    assert_eq!(bag.iter().count(), 1500);
}

#[test]
fn clear_drops_everything_and_recycles_pages() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked(#[allow(dead_code)] u64);

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let set = WorkerSet::new(2).unwrap();
    let pool = Arc::new(PagePool::new());
    let mut bag: InsertBag<Tracked> = InsertBag::new(&set, Arc::clone(&pool));
    let mut ctxs = set.contexts();

    let per_page = PAGE_SIZE / std::mem::size_of::<Tracked>();
    let total = per_page * 3 + 17;
    for k in 0..total {
        bag.push(&mut ctxs[k % 2], Tracked(k as u64));
    }
    bag.clear();
    assert_eq!(DROPS.load(Ordering::SeqCst), total);
    assert!(pool.idle_pages() > 0, "segment pages returned to the pool");

    // The cleared bag is reusable and the pool hands pages back out.
    let idle_before = pool.idle_pages();
    for k in 0..per_page * 2 {
        bag.push(&mut ctxs[0], Tracked(k as u64));
    }
    assert!(pool.idle_pages() < idle_before, "pages were reused");
    drop(bag);
    assert_eq!(DROPS.load(Ordering::SeqCst), total + per_page * 2);
}

#[test]
fn iteration_order_is_lane_major_newest_segment_first() {
    let set = WorkerSet::new(2).unwrap();
    let pool = Arc::new(PagePool::new());
    let mut bag: InsertBag<u64> = InsertBag::new(&set, pool);
    let mut ctxs = set.contexts();

    let per_page = PAGE_SIZE / std::mem::size_of::<u64>();
    // Worker 0 fills one page plus a few spilled into a newer segment.
    for k in 0..per_page as u64 + 3 {
        bag.push(&mut ctxs[0], k);
    }
    bag.push(&mut ctxs[1], 9_999);

    let seen: Vec<u64> = bag.iter().copied().collect();
    // Lane 0 first, its newest (partial) segment before the full one.
    assert_eq!(seen[0], per_page as u64);
    assert_eq!(seen[3], 0);
    assert_eq!(*seen.last().unwrap(), 9_999);
}

#[test]
fn iter_mut_lets_a_post_phase_pass_rewrite_results() {
    let set = WorkerSet::new(2).unwrap();
    let pool = Arc::new(PagePool::new());
    let bag: InsertBag<u64> = InsertBag::new(&set, pool);

    thread::scope(|s| {
        for mut ctx in set.contexts() {
            let bag = &bag;
            s.spawn(move || {
                for k in 0..1_000 {
                    bag.push(&mut ctx, k);
                }
            });
        }
    });

    let mut bag = bag;
    for value in bag.iter_mut() {
        *value *= 2;
    }
    let sum: u64 = bag.iter().sum();
    assert_eq!(sum, 2 * 2 * (999 * 1000 / 2));
}
