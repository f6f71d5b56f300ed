//! Scheduler Integration Tests for Fiberio
//!
//! Multi-worker behaviour of the plain scheduler: completion guarantees of
//! `stop`, exclusivity of fiber execution, and the caller-thread mode.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use fiberio::fiber::{self, Fiber, FiberState};
use fiberio::{Parker, Scheduler};

// ============================================================================
// Completion
// ============================================================================

#[test]
fn test_stop_waits_for_pending_work() {
    let scheduler = Scheduler::new(2, false, "drain").unwrap();
    scheduler.start().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let done = Arc::clone(&done);
        scheduler.schedule(move || {
            thread::sleep(Duration::from_millis(5));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.stop();
    assert_eq!(done.load(Ordering::SeqCst), 16);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_tasks_scheduled_from_fibers() {
    let scheduler = Scheduler::new(2, false, "nested").unwrap();
    scheduler.start().unwrap();

    let (tx, rx) = unbounded();
    for i in 0..4 {
        let inner = scheduler.clone();
        let tx = tx.clone();
        scheduler.schedule(move || {
            let tx2 = tx.clone();
            inner.schedule(move || tx2.send(i * 10 + 1).unwrap());
            tx.send(i * 10).unwrap();
        });
    }
    drop(tx);
    scheduler.stop();

    let seen: HashSet<i32> = rx.iter().collect();
    assert_eq!(seen.len(), 8);
}

// ============================================================================
// Exclusivity
// ============================================================================

#[test]
fn test_fiber_never_runs_concurrently_with_itself() {
    let scheduler = Scheduler::new(4, false, "exclusive").unwrap();
    scheduler.start().unwrap();

    let overlap = Arc::new(AtomicBool::new(false));
    let steps = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let running = Arc::new(AtomicBool::new(false));
        let overlap = Arc::clone(&overlap);
        let steps = Arc::clone(&steps);
        scheduler.schedule(move || {
            for _ in 0..50 {
                if running.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                steps.fetch_add(1, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
                fiber::yield_to_ready();
            }
        });
    }
    scheduler.stop();

    assert!(!overlap.load(Ordering::SeqCst));
    assert_eq!(steps.load(Ordering::SeqCst), 8 * 50);
}

#[test]
fn test_scheduled_fiber_resumes_where_it_yielded() {
    let scheduler = Scheduler::new(2, false, "resume").unwrap();
    scheduler.start().unwrap();

    let (tx, rx) = unbounded();
    let fiber = Fiber::new(move || {
        for step in 0..3 {
            tx.send(step).unwrap();
            fiber::yield_to_ready();
        }
    })
    .unwrap();
    let handle = fiber.clone();
    scheduler.schedule_fiber(fiber, Some(1));
    scheduler.stop();

    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(handle.state(), FiberState::Term);
}

// ============================================================================
// Caller thread
// ============================================================================

#[test]
fn test_use_caller_with_extra_workers() {
    let scheduler = Scheduler::new(3, true, "mixed").unwrap();
    scheduler.start().unwrap();

    let (tx, rx) = unbounded();
    for _ in 0..30 {
        let tx = tx.clone();
        scheduler.schedule(move || {
            thread::sleep(Duration::from_millis(1));
            tx.send(Scheduler::<Parker>::current_worker()).unwrap();
        });
    }
    drop(tx);
    scheduler.stop();

    let workers: Vec<_> = rx.iter().collect();
    assert_eq!(workers.len(), 30);
    assert!(workers.iter().all(|w| matches!(w, Some(0..=2))));
}

#[test]
fn test_use_caller_affinity_to_caller_slot() {
    let scheduler = Scheduler::new(2, true, "caller_affinity").unwrap();
    let caller = thread::current().id();
    scheduler.start().unwrap();

    let (tx, rx) = unbounded();
    for _ in 0..5 {
        let tx = tx.clone();
        scheduler.schedule_on(0, move || {
            tx.send(Scheduler::<Parker>::current_worker()).unwrap();
        });
    }
    drop(tx);
    scheduler.stop();

    assert_eq!(rx.iter().collect::<Vec<_>>(), vec![Some(0); 5]);
    assert_eq!(thread::current().id(), caller);
}

#[test]
fn test_stop_without_start() {
    let scheduler = Scheduler::new(1, true, "never_started").unwrap();
    scheduler.stop();
    assert!(scheduler.stopping());
}
