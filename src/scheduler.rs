//! Fiber scheduler
//!
//! A [`Scheduler`] multiplexes fibers and plain callbacks over a pool of
//! worker threads. Work items sit in one FIFO queue guarded by a single mutex;
//! every worker repeatedly takes the first item it may run, swaps into it, and
//! requeues it if it yielded as runnable. A worker with nothing to do swaps
//! into its idle fiber, whose behaviour comes from the scheduler's [`Driver`]:
//! [`Parker`] waits on a condition variable, the I/O manager blocks in epoll.
//!
//! Fibers live in an arena owned by the scheduler and keyed by [`FiberId`];
//! the queue and the I/O event table only ever hold ids.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::error::{fatal, Error, Result};
use crate::fiber::{self, Context, Entry, Fiber, FiberId, FiberState};
use crate::hook;
use crate::io::WeakIoManager;

/// Index of a worker slot within its scheduler.
pub type WorkerId = usize;

/// How long a parked worker waits before re-checking the stop condition.
const PARK_INTERVAL: Duration = Duration::from_millis(10);

static SCHEDULER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Role of a thread running the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Thread spawned by [`Scheduler::start`]
    Ordinary,
    /// The constructing thread, scheduling through its root fiber
    Caller,
}

/// Scheduler behaviour that differs between the plain and the I/O case.
pub trait Driver: Send + Sync + Sized + 'static {
    /// Wake a worker blocked in [`Driver::idle`].
    fn tickle(&self);

    /// Extra condition that must hold, on top of the base stopping
    /// predicate, before workers may exit.
    fn quiescent(&self) -> bool {
        true
    }

    /// Body of every worker's idle fiber. Must yield back regularly and return
    /// once `scheduler.stopping()` holds.
    fn idle(&self, scheduler: &Scheduler<Self>);

    /// I/O manager handle passed to fibers run by this scheduler.
    fn io_handle(&self, _scheduler: &Scheduler<Self>) -> Option<WeakIoManager> {
        None
    }
}

/// Driver of a scheduler without I/O: idle workers park on a condition
/// variable until tickled.
#[derive(Default)]
pub struct Parker {
    tickled: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for Parker {
    fn tickle(&self) {
        *self.tickled.lock() = true;
        self.cond.notify_all();
    }

    fn idle(&self, scheduler: &Scheduler<Self>) {
        loop {
            if scheduler.stopping() {
                break;
            }
            {
                let mut tickled = self.tickled.lock();
                if !*tickled {
                    self.cond.wait_for(&mut tickled, PARK_INTERVAL);
                }
                *tickled = false;
            }
            fiber::yield_to_hold();
        }
    }
}

/// A unit of work in the run queue.
pub enum Task {
    /// Resume a fiber from the scheduler's arena
    Fiber(FiberId),
    /// Run a callback inside a (reused) fiber
    Call(Entry),
}

struct Item {
    task: Task,
    worker: Option<WorkerId>,
}

#[derive(Default)]
struct RunQueue {
    items: VecDeque<Item>,
    fibers: HashMap<FiberId, Fiber>,
}

enum Picked {
    Fiber(Fiber, Option<WorkerId>),
    Call(Entry, Option<WorkerId>),
}

struct Shared<D: Driver> {
    id: u64,
    name: String,
    driver: D,
    stack_size: usize,
    queue: Mutex<RunQueue>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Threads to spawn in `start`, excluding the caller slot
    thread_count: usize,
    caller_thread: Option<ThreadId>,
    root_fiber: Mutex<Option<Fiber>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
}

/// Multi-threaded fiber scheduler.
pub struct Scheduler<D: Driver = Parker> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for Scheduler<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Non-owning scheduler handle.
pub struct WeakScheduler<D: Driver = Parker> {
    shared: Weak<Shared<D>>,
}

impl<D: Driver> Clone for WeakScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<D: Driver> WeakScheduler<D> {
    pub fn upgrade(&self) -> Option<Scheduler<D>> {
        self.shared.upgrade().map(|shared| Scheduler { shared })
    }
}

impl Scheduler<Parker> {
    /// Create a plain scheduler with `threads` worker slots.
    ///
    /// With `use_caller`, the constructing thread is one of the slots and
    /// runs its share of work inside [`Scheduler::stop`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        Self::with_driver(
            Parker::new(),
            threads,
            use_caller,
            name,
            fiber::DEFAULT_STACK_SIZE,
        )
    }

    pub fn with_config(config: &RuntimeConfig) -> Result<Self> {
        Self::with_driver(
            Parker::new(),
            config.scheduler.threads,
            config.scheduler.use_caller,
            &config.scheduler.name,
            config.fiber.stack_size,
        )
    }
}

impl<D: Driver> Scheduler<D> {
    pub fn with_driver(
        driver: D,
        threads: usize,
        use_caller: bool,
        name: &str,
        stack_size: usize,
    ) -> Result<Self> {
        if threads == 0 {
            fatal(format!("scheduler {name} created with zero threads"));
        }

        let (thread_count, caller_thread) = if use_caller {
            (threads - 1, Some(thread::current().id()))
        } else {
            (threads, None)
        };

        let scheduler = Scheduler {
            shared: Arc::new(Shared {
                id: SCHEDULER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                driver,
                stack_size,
                queue: Mutex::new(RunQueue::default()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                caller_thread,
                root_fiber: Mutex::new(None),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
            }),
        };

        if use_caller {
            let weak = scheduler.downgrade();
            let root = Fiber::with_stack(
                move || {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.run(0, WorkerRole::Caller);
                    }
                },
                stack_size,
                true,
            )?;
            *scheduler.shared.root_fiber.lock() = Some(root);
        }

        Ok(scheduler)
    }

    pub fn downgrade(&self) -> WeakScheduler<D> {
        WeakScheduler {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn driver(&self) -> &D {
        &self.shared.driver
    }

    /// Worker slot of the fiber calling this, if it runs under a scheduler.
    pub fn current_worker() -> Option<WorkerId> {
        fiber::context().and_then(|ctx| ctx.worker())
    }

    /// Number of workers currently blocked in their idle fiber.
    pub fn idle_workers(&self) -> usize {
        self.shared.idle.load(Ordering::Acquire)
    }

    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers() > 0
    }

    /// Spawn the worker threads. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.shared.threads.lock();
        if !self.shared.stopping.load(Ordering::Acquire) {
            return Ok(());
        }
        self.shared.stopping.store(false, Ordering::Release);
        debug_assert!(threads.is_empty());

        let first = usize::from(self.shared.caller_thread.is_some());
        for i in 0..self.shared.thread_count {
            let worker = first + i;
            let scheduler = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.shared.name, i))
                .spawn(move || scheduler.run(worker, WorkerRole::Ordinary))
                .map_err(Error::Io)?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Stop the scheduler once all queued work has been run, then join every
    /// worker thread.
    ///
    /// With `use_caller` this must run on the constructing thread, whose root
    /// fiber executes the remaining work here.
    pub fn stop(&self) {
        let shared = &self.shared;
        shared.auto_stop.store(true, Ordering::Release);

        let root = shared.root_fiber.lock().clone();
        if let Some(root) = &root {
            if shared.thread_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                shared.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    tracing::info!(target: "fiberio::scheduler", name = %shared.name, "stopped");
                    return;
                }
            }
        }

        match shared.caller_thread {
            Some(caller) => {
                if thread::current().id() != caller {
                    fatal(format!(
                        "scheduler {} uses its caller thread and must be stopped from it",
                        shared.name
                    ));
                }
            }
            None => {
                if fiber::context().and_then(|ctx| ctx.scheduler_id()) == Some(shared.id) {
                    fatal(format!(
                        "scheduler {} stopped from one of its own workers",
                        shared.name
                    ));
                }
            }
        }

        shared.stopping.store(true, Ordering::Release);
        for _ in 0..shared.thread_count {
            shared.driver.tickle();
        }

        if let Some(root) = &root {
            shared.driver.tickle();
            if root.state().is_resumable() && !self.stopping() {
                root.swap_in();
            }
        }

        let threads = std::mem::take(&mut *shared.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(target: "fiberio::scheduler", name = %shared.name, "worker thread panicked");
            }
        }
        tracing::info!(target: "fiberio::scheduler", name = %shared.name, "stopped");
    }

    /// Whether workers may exit: a stop was requested, no work is queued, no
    /// task is running, and the driver has nothing outstanding.
    pub fn stopping(&self) -> bool {
        self.base_stopping() && self.shared.driver.quiescent()
    }

    fn base_stopping(&self) -> bool {
        let queue = self.shared.queue.lock();
        self.shared.auto_stop.load(Ordering::Acquire)
            && self.shared.stopping.load(Ordering::Acquire)
            && queue.items.is_empty()
            && self.shared.active.load(Ordering::Acquire) == 0
    }

    /// Run a callback as a fiber on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Item {
            task: Task::Call(Box::new(f)),
            worker: None,
        });
    }

    /// Run a callback as a fiber on a specific worker.
    pub fn schedule_on<F>(&self, worker: WorkerId, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Item {
            task: Task::Call(Box::new(f)),
            worker: Some(worker),
        });
    }

    /// Queue several callbacks under one lock acquisition.
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Entry>,
    {
        let need_tickle = {
            let mut queue = self.shared.queue.lock();
            let was_empty = queue.items.is_empty();
            let before = queue.items.len();
            queue.items.extend(tasks.into_iter().map(|entry| Item {
                task: Task::Call(entry),
                worker: None,
            }));
            was_empty && queue.items.len() > before
        };
        if need_tickle {
            self.shared.driver.tickle();
        }
    }

    /// Hand an existing fiber to the scheduler.
    pub fn schedule_fiber(&self, fiber: Fiber, worker: Option<WorkerId>) -> FiberId {
        let id = fiber.id();
        let need_tickle = {
            let mut queue = self.shared.queue.lock();
            queue.fibers.insert(id, fiber);
            let was_empty = queue.items.is_empty();
            queue.items.push_back(Item {
                task: Task::Fiber(id),
                worker,
            });
            was_empty
        };
        if need_tickle {
            self.shared.driver.tickle();
        }
        id
    }

    /// Queue a held fiber from the arena for resumption.
    ///
    /// Returns false if the scheduler does not know the fiber.
    pub fn wake(&self, id: FiberId) -> bool {
        let need_tickle = {
            let mut queue = self.shared.queue.lock();
            if !queue.fibers.contains_key(&id) {
                return false;
            }
            let was_empty = queue.items.is_empty();
            queue.items.push_back(Item {
                task: Task::Fiber(id),
                worker: None,
            });
            was_empty
        };
        if need_tickle {
            self.shared.driver.tickle();
        }
        true
    }

    /// Number of queued work items.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    fn push(&self, item: Item) {
        let need_tickle = {
            let mut queue = self.shared.queue.lock();
            let was_empty = queue.items.is_empty();
            queue.items.push_back(item);
            was_empty
        };
        if need_tickle {
            self.shared.driver.tickle();
        }
    }

    /// Take the first item this worker may run.
    ///
    /// Fiber items are claimed (moved to `Exec`) while the queue lock is held,
    /// so two workers can never pick the same fiber. Returns whether another
    /// worker should be tickled.
    fn pick(&self, worker: WorkerId) -> (Option<Picked>, bool) {
        let mut queue = self.shared.queue.lock();
        let queue = &mut *queue;
        let mut tickle_me = false;
        let mut index = 0;

        while index < queue.items.len() {
            let item = &queue.items[index];
            if item.worker.is_some_and(|w| w != worker) {
                tickle_me = true;
                index += 1;
                continue;
            }

            if let Task::Fiber(id) = item.task {
                let claimed = match queue.fibers.get(&id) {
                    Some(fiber) if !fiber.state().is_terminal() => Some(fiber.claim()),
                    _ => None,
                };
                match claimed {
                    None => {
                        queue.fibers.remove(&id);
                        queue.items.remove(index);
                        continue;
                    }
                    // Still switching out on another worker.
                    Some(false) => {
                        index += 1;
                        continue;
                    }
                    Some(true) => {}
                }
            }

            let Some(item) = queue.items.remove(index) else {
                break;
            };
            self.shared.active.fetch_add(1, Ordering::AcqRel);
            tickle_me |= !queue.items.is_empty();

            let picked = match item.task {
                Task::Fiber(id) => match queue.fibers.get(&id) {
                    Some(fiber) => Picked::Fiber(fiber.clone(), item.worker),
                    None => {
                        self.shared.active.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                },
                Task::Call(entry) => Picked::Call(entry, item.worker),
            };
            return (Some(picked), tickle_me);
        }

        (None, tickle_me)
    }

    /// Record how a fiber came back from a swap.
    fn after_swap(&self, fiber: &Fiber, state: FiberState, worker: Option<WorkerId>) {
        match state {
            FiberState::Ready => {
                self.push(Item {
                    task: Task::Fiber(fiber.id()),
                    worker,
                });
            }
            FiberState::Term | FiberState::Except => {
                self.shared.queue.lock().fibers.remove(&fiber.id());
            }
            // Held fibers stay in the arena until an event or timer wakes them.
            _ => {}
        }
    }

    fn run(&self, worker: WorkerId, role: WorkerRole) {
        let shared = &self.shared;
        tracing::debug!(target: "fiberio::scheduler", name = %shared.name, worker, ?role, "run");
        // Hooked calls may only park when there is a manager to wake them.
        let io = shared.driver.io_handle(self);
        let hook_enabled = io.is_some();
        hook::set_enabled(hook_enabled);

        let context = Context {
            scheduler: Some(shared.id),
            worker: Some(worker),
            io,
            hook_enabled,
        };

        let idle_scheduler = self.clone();
        let idle_fiber = match Fiber::with_stack(
            move || idle_scheduler.shared.driver.idle(&idle_scheduler),
            shared.stack_size,
            false,
        ) {
            Ok(fiber) => fiber,
            Err(e) => fatal(format!("failed to allocate idle fiber: {e}")),
        };
        let mut cb_fiber: Option<Fiber> = None;

        loop {
            let (picked, tickle_me) = self.pick(worker);
            if tickle_me {
                shared.driver.tickle();
            }

            match picked {
                Some(Picked::Fiber(fiber, affinity)) => {
                    let state = fiber.run_claimed(context.clone());
                    self.after_swap(&fiber, state, affinity);
                    shared.active.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Picked::Call(entry, affinity)) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_entry(entry);
                            fiber
                        }
                        None => match Fiber::from_entry(entry, shared.stack_size, false) {
                            Ok(fiber) => fiber,
                            Err(e) => {
                                tracing::error!(
                                    target: "fiberio::scheduler",
                                    name = %shared.name,
                                    "failed to allocate fiber, dropping task: {e}"
                                );
                                shared.active.fetch_sub(1, Ordering::AcqRel);
                                continue;
                            }
                        },
                    };

                    shared.queue.lock().fibers.insert(fiber.id(), fiber.clone());
                    if !fiber.claim() {
                        fatal(format!("fresh fiber {} is not resumable", fiber.id()));
                    }
                    let state = fiber.run_claimed(context.clone());
                    self.after_swap(&fiber, state, affinity);
                    if state.is_terminal() {
                        cb_fiber = Some(fiber);
                    }
                    shared.active.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    if idle_fiber.state().is_terminal() {
                        tracing::debug!(target: "fiberio::scheduler", name = %shared.name, worker, "idle fiber term");
                        break;
                    }
                    shared.idle.fetch_add(1, Ordering::AcqRel);
                    if idle_fiber.claim() {
                        idle_fiber.run_claimed(context.clone());
                    }
                    shared.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::collections::HashSet;
    use std::time::Instant;

    #[test]
    fn test_every_task_runs_once() {
        let scheduler = Scheduler::new(3, false, "once").unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = unbounded();
        for i in 0..200 {
            let tx = tx.clone();
            scheduler.schedule(move || tx.send(i).unwrap());
        }
        scheduler.stop();
        drop(tx);

        let seen: Vec<i32> = rx.iter().collect();
        assert_eq!(seen.len(), 200);
        let unique: HashSet<i32> = seen.into_iter().collect();
        assert_eq!(unique.len(), 200);
    }

    #[test]
    fn test_affinity() {
        let scheduler = Scheduler::new(2, false, "affinity").unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = unbounded();
        for _ in 0..20 {
            let tx = tx.clone();
            scheduler.schedule_on(1, move || tx.send(Scheduler::<Parker>::current_worker()).unwrap());
        }
        scheduler.stop();
        drop(tx);

        let workers: Vec<_> = rx.iter().collect();
        assert_eq!(workers.len(), 20);
        assert!(workers.iter().all(|w| *w == Some(1)));
    }

    #[test]
    fn test_yielding_fiber_is_requeued() {
        let scheduler = Scheduler::new(1, false, "yield").unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = unbounded();
        scheduler.schedule(move || {
            for i in 0..5 {
                tx.send(i).unwrap();
                fiber::yield_to_ready();
            }
        });
        scheduler.stop();

        let seen: Vec<i32> = rx.try_iter().collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_schedule_existing_fiber() {
        let scheduler = Scheduler::new(1, false, "fiber").unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = unbounded();
        let fiber = Fiber::new(move || tx.send("ran").unwrap()).unwrap();
        let handle = fiber.clone();
        scheduler.schedule_fiber(fiber, None);
        scheduler.stop();

        assert_eq!(rx.try_recv(), Ok("ran"));
        assert_eq!(handle.state(), FiberState::Term);
        assert!(!scheduler.wake(handle.id()));
    }

    #[test]
    fn test_held_fiber_woken_by_id() {
        let scheduler = Scheduler::new(2, false, "wake").unwrap();
        scheduler.start().unwrap();

        let (id_tx, id_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();
        scheduler.schedule(move || {
            id_tx.send(fiber::current_id().unwrap()).unwrap();
            fiber::yield_to_hold();
            done_tx.send(()).unwrap();
        });

        let id = id_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The fiber may still be switching out; wake retries until it is held.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !scheduler.wake(id) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.stop();
    }

    #[test]
    fn test_panicking_task_does_not_stop_worker() {
        let scheduler = Scheduler::new(1, false, "panic").unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = unbounded();
        scheduler.schedule(|| panic!("task failure"));
        scheduler.schedule(move || tx.send("after").unwrap());
        scheduler.stop();

        assert_eq!(rx.try_recv(), Ok("after"));
    }

    #[test]
    fn test_use_caller_drains_in_stop() {
        let scheduler = Scheduler::new(1, true, "caller").unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            scheduler.schedule(move || tx.send((i, Scheduler::<Parker>::current_worker())).unwrap());
        }
        assert!(rx.try_recv().is_err());

        scheduler.stop();
        drop(tx);
        let seen: Vec<_> = rx.iter().collect();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|(_, worker)| *worker == Some(0)));
    }

    #[test]
    fn test_stop_idle_scheduler() {
        let scheduler = Scheduler::new(2, false, "idle").unwrap();
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        scheduler.stop();
        assert!(scheduler.stopping());
        assert_eq!(scheduler.pending(), 0);
    }
}
