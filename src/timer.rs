//! Timers keyed by absolute expiry
//!
//! [`TimerManager`] keeps every pending timer ordered by `(expiry, sequence)`,
//! so timers due at the same millisecond fire in insertion order. The I/O
//! manager asks it how long it may block ([`TimerManager::next_timer_ms`]) and
//! drains due callbacks after every wait ([`TimerManager::list_expired`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::util;

/// A backward clock jump larger than this expires every timer at once.
pub const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Callback run when a timer fires. Recurring timers run it repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Hook invoked when an insertion becomes the soonest timer.
pub type FrontHook = Box<dyn Fn() + Send + Sync + 'static>;

/// Millisecond clock used to compute expiries.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// Wall clock. Can step backwards, which the manager detects.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        util::current_ms()
    }
}

/// Manually driven clock for deterministic timing.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Unique timer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

static TIMER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    fn next() -> Self {
        TimerId(TIMER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct Entry {
    next: u64,
    period: u64,
    recurring: bool,
    seq: u64,
    callback: TimerCallback,
}

impl Entry {
    fn key(&self) -> (u64, u64) {
        (self.next, self.seq)
    }
}

#[derive(Default)]
struct State {
    order: BTreeMap<(u64, u64), TimerId>,
    entries: HashMap<TimerId, Entry>,
    next_seq: u64,
    previous: u64,
}

impl State {
    /// Insert under a fresh sequence number; returns whether it is now first.
    fn insert(&mut self, id: TimerId, mut entry: Entry) -> bool {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        let key = entry.key();
        self.order.insert(key, id);
        self.entries.insert(id, entry);
        self.order.keys().next() == Some(&key)
    }

    fn remove(&mut self, id: TimerId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.key());
        Some(entry)
    }
}

struct Shared {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    rollover_threshold: u64,
    tickled: AtomicBool,
    on_front: Option<FrontHook>,
}

impl Shared {
    fn insert(&self, id: TimerId, entry: Entry) {
        let at_front = {
            let mut state = self.state.write();
            state.insert(id, entry) && !self.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(hook) = &self.on_front {
                hook();
            }
        }
    }
}

/// Ordered collection of timers.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    /// Create a manager on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), ROLLOVER_THRESHOLD_MS, None)
    }

    /// Create a manager on an explicit clock.
    ///
    /// `on_front` runs (outside the lock) when an insertion becomes the
    /// soonest timer, at most once between two calls to
    /// [`TimerManager::next_timer_ms`].
    pub fn with_clock(
        clock: Arc<dyn Clock>,
        rollover_threshold: u64,
        on_front: Option<FrontHook>,
    ) -> Self {
        let previous = clock.now_ms();
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    previous,
                    ..State::default()
                }),
                clock,
                rollover_threshold,
                tickled: AtomicBool::new(false),
                on_front,
            }),
        }
    }

    /// Add a timer firing `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(ms, Arc::new(callback), recurring)
    }

    /// Add a timer whose callback only runs while `condition` is alive.
    ///
    /// The timer keeps no strong reference to the condition object. When it
    /// fires after the object was dropped the callback is skipped, and a
    /// one-shot timer is still removed.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    fn add_callback(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Timer {
        let id = TimerId::next();
        let entry = Entry {
            next: self.shared.clock.now_ms().saturating_add(ms),
            period: ms,
            recurring,
            seq: 0,
            callback,
        };
        self.shared.insert(id, entry);
        Timer {
            id,
            manager: Arc::downgrade(&self.shared),
        }
    }

    /// Milliseconds until the soonest timer, `Some(0)` if one is already due,
    /// `None` when there are no timers.
    pub fn next_timer_ms(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let now = self.shared.clock.now_ms();
        let state = self.shared.state.read();
        state
            .order
            .keys()
            .next()
            .map(|&(next, _)| next.saturating_sub(now))
    }

    /// Remove and return the callbacks of every timer due now.
    ///
    /// Recurring timers are re-inserted one period after the expiry they just
    /// served (skipping whole periods already missed), so processing delay
    /// does not accumulate as drift.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.shared.clock.now_ms();
        {
            let state = self.shared.state.read();
            if state.entries.is_empty() {
                return Vec::new();
            }
        }

        let mut state = self.shared.state.write();
        if state.entries.is_empty() {
            return Vec::new();
        }

        let rollover = self.detect_clock_rollover(&mut state, now);
        let due: Vec<TimerId> = if rollover {
            state.order.values().copied().collect()
        } else {
            state
                .order
                .range(..=(now, u64::MAX))
                .map(|(_, &id)| id)
                .collect()
        };

        let mut callbacks = Vec::with_capacity(due.len());
        for id in due {
            let Some(mut entry) = state.remove(id) else {
                continue;
            };
            callbacks.push(Arc::clone(&entry.callback));
            if entry.recurring {
                entry.next = if rollover || entry.period == 0 {
                    now.saturating_add(entry.period)
                } else {
                    let mut next = entry.next.saturating_add(entry.period);
                    while next <= now {
                        next = next.saturating_add(entry.period);
                    }
                    next
                };
                state.insert(id, entry);
            }
        }
        callbacks
    }

    /// Whether the clock jumped backwards by more than the threshold since the
    /// last poll.
    fn detect_clock_rollover(&self, state: &mut State, now: u64) -> bool {
        let rollover = now < state.previous
            && now < state.previous.saturating_sub(self.shared.rollover_threshold);
        if rollover {
            tracing::warn!(
                target: "fiberio::timer",
                previous = state.previous,
                now,
                "clock moved backwards, expiring all timers"
            );
        }
        state.previous = now;
        rollover
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().entries.is_empty()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a pending timer.
#[derive(Clone)]
pub struct Timer {
    id: TimerId,
    manager: Weak<Shared>,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Remove the timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut state = shared.state.write();
        state.remove(self.id).is_some()
    }

    /// Re-arm one full period from now.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let now = shared.clock.now_ms();
        let at_front = {
            let mut state = shared.state.write();
            let Some(mut entry) = state.remove(self.id) else {
                return false;
            };
            entry.next = now.saturating_add(entry.period);
            state.insert(self.id, entry) && !shared.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(hook) = &shared.on_front {
                hook();
            }
        }
        true
    }

    /// Change the period to `ms`, counted from now or from the original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let now = shared.clock.now_ms();
        let at_front = {
            let mut state = shared.state.write();
            match state.entries.get(&self.id) {
                None => return false,
                Some(entry) if entry.period == ms && !from_now => return true,
                Some(_) => {}
            }
            let Some(mut entry) = state.remove(self.id) else {
                return false;
            };
            let start = if from_now {
                now
            } else {
                entry.next.saturating_sub(entry.period)
            };
            entry.period = ms;
            entry.next = start.saturating_add(ms);
            state.insert(self.id, entry) && !shared.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(hook) = &shared.on_front {
                hook();
            }
        }
        true
    }

    /// Whether the timer is still pending.
    pub fn is_pending(&self) -> bool {
        self.manager
            .upgrade()
            .map(|shared| shared.state.read().entries.contains_key(&self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const BASE: u64 = 10 * ROLLOVER_THRESHOLD_MS;

    fn manual() -> (Arc<ManualClock>, TimerManager) {
        let clock = Arc::new(ManualClock::new(BASE));
        let manager = TimerManager::with_clock(clock.clone(), ROLLOVER_THRESHOLD_MS, None);
        (clock, manager)
    }

    fn fire(callbacks: Vec<TimerCallback>) {
        for cb in callbacks {
            cb();
        }
    }

    #[test]
    fn test_next_timer_ms() {
        let (clock, manager) = manual();
        assert_eq!(manager.next_timer_ms(), None);

        manager.add_timer(100, || {}, false);
        manager.add_timer(50, || {}, false);
        manager.add_timer(200, || {}, false);
        assert_eq!(manager.next_timer_ms(), Some(50));

        clock.advance(80);
        assert_eq!(manager.next_timer_ms(), Some(0));
    }

    #[test]
    fn test_list_expired_only_due() {
        let (clock, manager) = manual();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20, 40] {
            let fired = Arc::clone(&fired);
            manager.add_timer(ms, move || fired.lock().push(ms), false);
        }

        clock.advance(20);
        fire(manager.list_expired());
        assert_eq!(*fired.lock(), vec![10, 20]);
        assert_eq!(manager.len(), 2);

        clock.advance(100);
        fire(manager.list_expired());
        assert_eq!(*fired.lock(), vec![10, 20, 30, 40]);
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_equal_expiry_fires_in_insertion_order() {
        let (clock, manager) = manual();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5 {
            let fired = Arc::clone(&fired);
            manager.add_timer(10, move || fired.lock().push(tag), false);
        }
        clock.advance(10);
        fire(manager.list_expired());
        assert_eq!(*fired.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_timer_never_listed() {
        let (clock, manager) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let timer = manager.add_timer(
            100,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert!(timer.is_pending());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.is_pending());

        clock.advance(1000);
        assert!(manager.list_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_no_drift() {
        let (clock, manager) = manual();
        let timer = manager.add_timer(100, || {}, true);

        // Polled 30ms late: the next expiry stays on the 100ms grid.
        clock.advance(130);
        assert_eq!(manager.list_expired().len(), 1);
        assert_eq!(manager.next_timer_ms(), Some(70));

        // Whole missed periods are skipped rather than replayed.
        clock.advance(370);
        assert_eq!(manager.list_expired().len(), 1);
        assert_eq!(manager.next_timer_ms(), Some(100));

        assert!(timer.cancel());
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_condition_timer() {
        let (clock, manager) = manual();
        let hits = Arc::new(AtomicUsize::new(0));

        let alive = Arc::new(());
        let counter = Arc::clone(&hits);
        manager.add_condition_timer(
            10,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&alive),
            false,
        );

        let dead = Arc::new(());
        let counter = Arc::clone(&hits);
        manager.add_condition_timer(
            10,
            move || {
                counter.fetch_add(100, Ordering::SeqCst);
            },
            Arc::downgrade(&dead),
            false,
        );
        drop(dead);

        clock.advance(10);
        fire(manager.list_expired());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_clock_rollover_expires_everything() {
        let (clock, manager) = manual();
        manager.add_timer(5_000, || {}, false);
        manager.add_timer(60_000, || {}, true);
        assert!(manager.list_expired().is_empty());

        clock.set(BASE - ROLLOVER_THRESHOLD_MS - 1);
        assert_eq!(manager.list_expired().len(), 2);
        // The recurring timer is re-armed relative to the new clock.
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.next_timer_ms(), Some(60_000));
    }

    #[test]
    fn test_small_backward_step_is_not_rollover() {
        let (clock, manager) = manual();
        manager.add_timer(5_000, || {}, false);
        assert!(manager.list_expired().is_empty());

        clock.set(BASE - 1_000);
        assert!(manager.list_expired().is_empty());
        assert!(manager.has_timer());
    }

    #[test]
    fn test_refresh_and_reset() {
        let (clock, manager) = manual();
        let timer = manager.add_timer(100, || {}, false);

        clock.advance(60);
        assert!(timer.refresh());
        assert_eq!(manager.next_timer_ms(), Some(100));

        // Same period, not from now: nothing changes.
        assert!(timer.reset(100, false));
        assert_eq!(manager.next_timer_ms(), Some(100));

        // New period measured from the original start.
        assert!(timer.reset(40, false));
        assert_eq!(manager.next_timer_ms(), Some(40));

        assert!(timer.reset(500, true));
        assert_eq!(manager.next_timer_ms(), Some(500));

        assert!(timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(10, true));
    }

    #[test]
    fn test_front_hook() {
        let clock = Arc::new(ManualClock::new(BASE));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let manager = TimerManager::with_clock(
            clock,
            ROLLOVER_THRESHOLD_MS,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        manager.add_timer(100, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Later timers never trigger it.
        manager.add_timer(200, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A new minimum before the waiter re-polled is coalesced.
        manager.add_timer(50, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        manager.next_timer_ms();
        manager.add_timer(10, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timer_outlives_manager() {
        let (_clock, manager) = manual();
        let timer = manager.add_timer(10, || {}, false);
        drop(manager);
        assert!(!timer.cancel());
        assert!(!timer.is_pending());
    }
}
