//! I/O Manager Integration Tests for Fiberio
//!
//! Event registration against real pipes and sockets, cancellation, and the
//! interaction between timers and shutdown.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use fiberio::fiber;
use fiberio::{Event, IoManager};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close_pair((r, w): (RawFd, RawFd)) {
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Fiber resumption
// ============================================================================

#[test]
fn test_cancel_all_resumes_blocked_fiber_once() {
    let iom = IoManager::new(2, false, "cancel_all").unwrap();
    let fds = pipe();
    let (r, w) = fds;

    let resumed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resumed);
    let (tx, rx) = unbounded();
    iom.schedule(move || {
        let iom = IoManager::current().unwrap();
        iom.add_event(r, Event::READ).unwrap();
        drop(iom);
        tx.send(()).unwrap();
        fiber::yield_to_hold();
        counter.fetch_add(1, Ordering::SeqCst);
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(iom.pending_events(), 1);
    assert!(iom.cancel_all(r));
    assert!(!iom.cancel_all(r));
    wait_until("resume", || resumed.load(Ordering::SeqCst) == 1);

    // Data arriving later finds no registration.
    assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
    thread::sleep(Duration::from_millis(50));
    iom.stop();
    assert_eq!(resumed.load(Ordering::SeqCst), 1);
    close_pair(fds);
}

#[test]
fn test_fiber_resumed_by_readiness() {
    let iom = IoManager::new(1, false, "readiness").unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    let fd = a.as_raw_fd();

    let (tx, rx) = unbounded();
    iom.schedule(move || {
        let iom = IoManager::current().unwrap();
        iom.add_event(fd, Event::READ).unwrap();
        drop(iom);
        tx.send("registered").unwrap();
        fiber::yield_to_hold();

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        tx.send(if n == 5 && &buf[..5] == b"hello" { "read" } else { "bad read" })
            .unwrap();
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("registered"));
    assert_eq!(unsafe { libc::write(b.as_raw_fd(), b"hello".as_ptr().cast(), 5) }, 5);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("read"));
    iom.stop();
}

// ============================================================================
// Callback registrations
// ============================================================================

#[test]
fn test_del_event_never_fires() {
    let iom = IoManager::new(1, false, "del_event").unwrap();
    let fds = pipe();
    let (r, w) = fds;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    iom.add_event_with(r, Event::READ, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert!(iom.del_event(r, Event::READ));

    assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
    thread::sleep(Duration::from_millis(100));
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    close_pair(fds);
}

#[test]
fn test_read_and_write_on_same_fd() {
    let iom = IoManager::new(1, false, "read_write").unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();

    let (tx, rx) = unbounded();
    let read_tx = tx.clone();
    iom.add_event_with(fd, Event::READ, move || read_tx.send("read").unwrap())
        .unwrap();
    iom.add_event_with(fd, Event::WRITE, move || tx.send("write").unwrap())
        .unwrap();

    // An idle socket is writable straight away; READ stays armed.
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("write"));
    assert_eq!(iom.pending_events(), 1);

    assert_eq!(unsafe { libc::write(b.as_raw_fd(), b"y".as_ptr().cast(), 1) }, 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("read"));
    iom.stop();
    assert_eq!(iom.pending_events(), 0);
}

#[test]
fn test_hangup_fires_read() {
    let iom = IoManager::new(1, false, "hangup").unwrap();
    let (a, b) = UnixStream::pair().unwrap();

    let (tx, rx) = unbounded();
    iom.add_event_with(a.as_raw_fd(), Event::READ, move || tx.send("hup").unwrap())
        .unwrap();
    drop(b);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("hup"));
    iom.stop();
}

// ============================================================================
// Timers and shutdown
// ============================================================================

#[test]
fn test_recurring_timer_until_cancelled() {
    let iom = IoManager::new(1, false, "recurring").unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let timer = iom.add_timer(
        10,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    wait_until("three ticks", || ticks.load(Ordering::SeqCst) >= 3);
    assert!(timer.cancel());
    iom.stop();
    assert!(!iom.timers().has_timer());
}

#[test]
fn test_condition_timer_skipped_when_condition_dropped() {
    let iom = IoManager::new(1, false, "condition").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);

    let condition = Arc::new(());
    iom.add_condition_timer(
        30,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&condition),
        false,
    );
    drop(condition);

    wait_until("timer removal", || !iom.timers().has_timer());
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_waits_for_pending_timer() {
    let iom = IoManager::new(2, false, "timer_drain").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    iom.add_timer(
        50,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    let start = Instant::now();
    iom.stop();
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_use_caller_io_manager() {
    let iom = IoManager::new(1, true, "io_caller").unwrap();
    let (tx, rx) = unbounded();
    iom.add_timer(20, move || tx.send("timer").unwrap(), false);
    iom.stop();
    assert_eq!(rx.try_recv(), Ok("timer"));
}
