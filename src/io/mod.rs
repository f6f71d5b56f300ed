//! I/O manager
//!
//! [`IoManager`] is a [`Scheduler`] whose idle workers block in epoll instead
//! of parking. A fiber (or a callback) is attached to the readiness of an fd
//! with [`IoManager::add_event`]; when the event fires, the registration is
//! removed and its action is scheduled. Registrations are one-shot.
//!
//! The idle loop also drives the [`TimerManager`]: each wait lasts at most
//! until the soonest timer, and expired timer callbacks are scheduled after
//! every wake-up.

mod poller;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Deref};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::fiber::{self, Entry, FiberId};
use crate::scheduler::{Driver, Scheduler, WeakScheduler};
use crate::timer::{SystemClock, Timer, TimerManager};

pub use poller::{Poller, Waker};

/// Readiness event bitmask, using the epoll bit values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    const ERROR_MASK: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

    pub fn from_bits(bits: u32) -> Self {
        Event(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Event) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// This set without the bits of `other`.
    pub fn without(self, other: Event) -> Event {
        Event(self.0 & !other.0)
    }

    fn is_error(self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }
}

impl BitOr for Event {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Event(self.0 | rhs.0)
    }
}

impl BitAnd for Event {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Event(self.0 & rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Event::READ) {
            names.push("READ");
        }
        if self.contains(Event::WRITE) {
            names.push("WRITE");
        }
        if self.is_error() {
            names.push("ERROR");
        }
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// What to do when a registered event fires or is cancelled.
enum Action {
    Resume(FiberId),
    Call(Entry),
}

#[derive(Default)]
struct FdState {
    events: Event,
    read: Option<Action>,
    write: Option<Action>,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut Option<Action> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }
}

/// Scheduler driver backed by epoll.
pub struct IoDriver {
    poller: Poller,
    waker: Arc<Waker>,
    fds: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    timers: TimerManager,
    max_wait_ms: u64,
    max_events: usize,
}

impl IoDriver {
    fn new(config: &RuntimeConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let waker = Arc::new(Waker::new()?);
        poller.register(waker.fd(), Event::READ)?;

        let front = Arc::clone(&waker);
        let timers = TimerManager::with_clock(
            Arc::new(SystemClock),
            config.timer.rollover_threshold_ms,
            Some(Box::new(move || front.wake())),
        );

        let driver = Self {
            poller,
            waker,
            fds: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers,
            max_wait_ms: config.io.max_wait_ms,
            max_events: config.io.max_events.max(1),
        };
        driver.grow(32);
        Ok(driver)
    }

    fn grow(&self, size: usize) {
        let mut fds = self.fds.write();
        let start = fds.len();
        for fd in start..size {
            fds.push(Arc::new(FdContext::new(fd as RawFd)));
        }
    }

    /// Context of `fd`, growing the table to 1.5x the fd when `create` is set.
    fn context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        if let Some(ctx) = self.fds.read().get(index) {
            return Some(Arc::clone(ctx));
        }
        if !create {
            return None;
        }
        self.grow((index * 3 / 2).max(index + 1));
        self.fds.read().get(index).cloned()
    }

    /// Re-arm `fd` with the remaining interest set, or drop it from epoll.
    fn rearm(&self, fd: RawFd, left: Event) -> std::io::Result<()> {
        if left.is_empty() {
            self.poller.deregister(fd)
        } else {
            self.poller.modify(fd, left)
        }
    }

    fn dispatch(&self, scheduler: &Scheduler<IoDriver>, action: Action) {
        match action {
            Action::Resume(id) => {
                if !scheduler.wake(id) {
                    tracing::warn!(target: "fiberio::io", fiber = %id, "event for unknown fiber");
                }
            }
            Action::Call(entry) => scheduler.schedule(entry),
        }
    }

    fn handle_ready(&self, scheduler: &Scheduler<IoDriver>, fd: RawFd, mut raised: Event) {
        let Some(ctx) = self.context(fd, false) else {
            return;
        };

        let mut actions = Vec::with_capacity(2);
        {
            let mut state = ctx.state.lock();
            if raised.is_error() {
                raised |= (Event::READ | Event::WRITE) & state.events;
            }
            let fired = raised & state.events & (Event::READ | Event::WRITE);
            if fired.is_empty() {
                return;
            }

            let left = state.events.without(fired);
            if let Err(e) = self.rearm(ctx.fd, left) {
                tracing::warn!(target: "fiberio::io", fd, "epoll_ctl after {fired:?} failed: {e}");
                return;
            }

            for event in [Event::READ, Event::WRITE] {
                if fired.contains(event) {
                    state.events = state.events.without(event);
                    if let Some(action) = state.slot(event).take() {
                        actions.push(action);
                    }
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        tracing::trace!(target: "fiberio::io", fd, "dispatching {} action(s)", actions.len());
        for action in actions {
            self.dispatch(scheduler, action);
        }
    }
}

impl Driver for IoDriver {
    fn tickle(&self) {
        self.waker.wake();
    }

    fn quiescent(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && !self.timers.has_timer()
    }

    fn idle(&self, scheduler: &Scheduler<Self>) {
        let mut buffer = vec![unsafe { std::mem::zeroed::<libc::epoll_event>() }; self.max_events];
        let mut ready = Vec::with_capacity(self.max_events);

        loop {
            if scheduler.stopping() {
                tracing::debug!(target: "fiberio::io", name = scheduler.name(), "idle stopping exit");
                break;
            }

            let timeout = self
                .timers
                .next_timer_ms()
                .map_or(self.max_wait_ms, |ms| ms.min(self.max_wait_ms));

            ready.clear();
            if let Err(e) = self.poller.poll(&mut buffer, &mut ready, timeout) {
                tracing::error!(target: "fiberio::io", "epoll_wait failed: {e}");
            }

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                scheduler.schedule_all(
                    expired
                        .into_iter()
                        .map(|callback| Box::new(move || callback()) as Entry),
                );
            }

            for &(fd, raised) in &ready {
                if fd == self.waker.fd() {
                    self.waker.drain();
                    continue;
                }
                self.handle_ready(scheduler, fd, raised);
            }

            fiber::yield_to_hold();
        }
    }

    fn io_handle(&self, scheduler: &Scheduler<Self>) -> Option<WeakIoManager> {
        Some(WeakIoManager {
            scheduler: scheduler.downgrade(),
        })
    }
}

static IGNORE_SIGPIPE: Once = Once::new();

fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| {
        use nix::sys::signal::{signal, SigHandler, Signal};
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            tracing::warn!(target: "fiberio::io", "failed to ignore SIGPIPE: {e}");
        }
    });
}

/// Scheduler with epoll-driven idle workers and a timer wheel.
///
/// Cloning yields another handle to the same manager. The manager starts its
/// workers on construction; call [`Scheduler::stop`] (through `Deref`) to shut
/// it down.
#[derive(Clone)]
pub struct IoManager {
    scheduler: Scheduler<IoDriver>,
}

impl Deref for IoManager {
    type Target = Scheduler<IoDriver>;

    fn deref(&self) -> &Self::Target {
        &self.scheduler
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.name())
            .field("id", &self.id())
            .finish()
    }
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        let mut config = RuntimeConfig::default();
        config.scheduler.threads = threads;
        config.scheduler.use_caller = use_caller;
        config.scheduler.name = name.to_string();
        Self::with_config(&config)
    }

    pub fn with_config(config: &RuntimeConfig) -> Result<Self> {
        ignore_sigpipe();
        let driver = IoDriver::new(config)?;
        let scheduler = Scheduler::with_driver(
            driver,
            config.scheduler.threads,
            config.scheduler.use_caller,
            &config.scheduler.name,
            config.fiber.stack_size,
        )?;
        scheduler.start()?;
        Ok(Self { scheduler })
    }

    /// The manager running the current fiber.
    pub fn current() -> Option<IoManager> {
        fiber::context().and_then(|ctx| ctx.io_manager())
    }

    pub fn downgrade(&self) -> WeakIoManager {
        WeakIoManager {
            scheduler: self.scheduler.downgrade(),
        }
    }

    pub fn timers(&self) -> &TimerManager {
        &self.driver().timers
    }

    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers().add_timer(ms, callback, recurring)
    }

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
        self.timers().add_condition_timer(ms, callback, condition, recurring)
    }

    /// Number of armed fd events.
    pub fn pending_events(&self) -> usize {
        self.driver().pending.load(Ordering::Acquire)
    }

    /// Resume the calling fiber once `event` fires on `fd`.
    ///
    /// The caller is expected to suspend with [`fiber::yield_to_hold`] right
    /// after a successful registration.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let id = fiber::current_id().ok_or(Error::NotInFiber)?;
        self.register(fd, event, Action::Resume(id))
    }

    /// Schedule `callback` once `event` fires on `fd`.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, event, Action::Call(Box::new(callback)))
    }

    fn register(&self, fd: RawFd, event: Event, action: Action) -> Result<()> {
        if fd < 0 {
            return Err(Error::BadFd(fd));
        }
        if event != Event::READ && event != Event::WRITE {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)));
        }

        let driver = self.driver();
        let Some(ctx) = driver.context(fd, true) else {
            return Err(Error::BadFd(fd));
        };

        let mut state = ctx.state.lock();
        if state.events.contains(event) {
            return Err(Error::EventExists { fd, event });
        }

        let interest = state.events | event;
        let armed = if state.events.is_empty() {
            driver.poller.register(fd, interest)
        } else {
            driver.poller.modify(fd, interest)
        };
        if let Err(e) = armed {
            tracing::error!(target: "fiberio::io", fd, ?event, "epoll_ctl failed: {e}");
            return Err(Error::Io(e));
        }

        driver.pending.fetch_add(1, Ordering::AcqRel);
        state.events = interest;
        *state.slot(event) = Some(action);
        Ok(())
    }

    /// Disarm `event` on `fd` without running its action.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.disarm(fd, event).is_some()
    }

    /// Disarm `event` on `fd` and run its action as if it had fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        match self.disarm(fd, event) {
            Some(action) => {
                self.driver().dispatch(&self.scheduler, action);
                true
            }
            None => false,
        }
    }

    fn disarm(&self, fd: RawFd, event: Event) -> Option<Action> {
        let driver = self.driver();
        let ctx = driver.context(fd, false)?;
        let mut state = ctx.state.lock();
        if !state.events.contains(event) {
            return None;
        }

        let left = state.events.without(event);
        // A closed fd has already left epoll; the registration is released anyway.
        if let Err(e) = driver.rearm(fd, left) {
            tracing::warn!(target: "fiberio::io", fd, ?event, "epoll_ctl failed: {e}");
        }

        driver.pending.fetch_sub(1, Ordering::AcqRel);
        state.events = left;
        state.slot(event).take()
    }

    /// Disarm every event on `fd`, running the stored actions.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let driver = self.driver();
        let Some(ctx) = driver.context(fd, false) else {
            return false;
        };

        let mut actions = Vec::with_capacity(2);
        {
            let mut state = ctx.state.lock();
            if state.events.is_empty() {
                return false;
            }
            // The fd may already be closed, which also removed it from epoll.
            if let Err(e) = driver.poller.deregister(fd) {
                tracing::warn!(target: "fiberio::io", fd, "epoll_ctl DEL failed: {e}");
            }
            for event in [Event::READ, Event::WRITE] {
                if state.events.contains(event) {
                    if let Some(action) = state.slot(event).take() {
                        actions.push(action);
                    }
                    driver.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
            state.events = Event::NONE;
        }

        for action in actions {
            driver.dispatch(&self.scheduler, action);
        }
        true
    }
}

/// Non-owning [`IoManager`] handle, as carried by a fiber's context.
#[derive(Clone)]
pub struct WeakIoManager {
    scheduler: WeakScheduler<IoDriver>,
}

impl WeakIoManager {
    pub fn upgrade(&self) -> Option<IoManager> {
        self.scheduler
            .upgrade()
            .map(|scheduler| IoManager { scheduler })
    }
}

impl fmt::Debug for WeakIoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakIoManager")
            .field("alive", &self.upgrade().is_some())
            .finish()
    }
}
