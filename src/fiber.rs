//! Stackful fibers
//!
//! A fiber owns a dedicated stack and runs its entry function cooperatively:
//! control only changes hands in [`Fiber::swap_in`] and in the yield functions
//! called from inside the fiber. Every fiber is backed by a parked thread
//! created with the requested stack size. Resuming sends the execution
//! [`Context`] to that thread and blocks until the fiber yields back, so exactly
//! one side of the handshake runs at any time.
//!
//! ```text
//!  resumer                         fiber thread
//!  ───────                         ────────────
//!  swap_in ──── Context ─────────▶ entry runs ...
//!          ◀─── FiberState ─────── yield_to_hold / yield_to_ready / return
//! ```
//!
//! A panic escaping the entry is caught on the fiber's side and turns the fiber
//! into [`FiberState::Except`]; it never reaches the resumer.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{fatal, Error, Result};
use crate::io::{IoManager, WeakIoManager};
use crate::scheduler::WorkerId;

/// Stack size used when none is given explicitly.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Unique fiber identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

static FIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicUsize = AtomicUsize::new(0);

impl FiberId {
    fn next() -> Self {
        FiberId(FIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Allocated, never run
    Init = 0,
    /// Suspended, waiting to be resumed
    Hold = 1,
    /// Running on some thread
    Exec = 2,
    /// Suspended and runnable
    Ready = 3,
    /// Entry returned
    Term = 4,
    /// Entry panicked
    Except = 5,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Ready,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }

    /// Whether [`Fiber::swap_in`] may be called in this state.
    pub fn is_resumable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Hold | FiberState::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }
}

/// Execution context handed to a fiber every time it is resumed.
///
/// This is how a fiber learns which scheduler and worker run it, which
/// [`IoManager`] its hooked calls should register with, and whether hooking is
/// enabled at all.
#[derive(Clone, Default)]
pub struct Context {
    pub(crate) scheduler: Option<u64>,
    pub(crate) worker: Option<WorkerId>,
    pub(crate) io: Option<WeakIoManager>,
    pub(crate) hook_enabled: bool,
}

impl Context {
    /// Identifier of the scheduler running the fiber.
    pub fn scheduler_id(&self) -> Option<u64> {
        self.scheduler
    }

    /// Worker slot running the fiber.
    pub fn worker(&self) -> Option<WorkerId> {
        self.worker
    }

    /// The I/O manager running the fiber, if it is still alive.
    pub fn io_manager(&self) -> Option<IoManager> {
        self.io.as_ref().and_then(WeakIoManager::upgrade)
    }

    pub fn hook_enabled(&self) -> bool {
        self.hook_enabled
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("scheduler", &self.scheduler)
            .field("worker", &self.worker)
            .field("io", &self.io.is_some())
            .field("hook_enabled", &self.hook_enabled)
            .finish()
    }
}

pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Panic payload that unwinds a suspended fiber whose last handle was dropped.
struct Unwound;

/// Per-thread view of the fiber backed by that thread.
struct Running {
    id: FiberId,
    resume_rx: Receiver<Context>,
    suspend_tx: Sender<FiberState>,
    context: Context,
}

thread_local! {
    static CURRENT: RefCell<Option<Running>> = const { RefCell::new(None) };
}

struct Inner {
    id: FiberId,
    is_caller: bool,
    stack_size: usize,
    state: AtomicU8,
    entry: Arc<Mutex<Option<Entry>>>,
    resume_tx: Sender<Context>,
    suspend_rx: Receiver<FiberState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping `resume_tx` disconnects the backing thread, which exits
        // (or unwinds, if suspended) on its own.
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to a stackful fiber. Cloning yields another handle to the same fiber.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

impl Fiber {
    /// Create a fiber with the default stack size.
    pub fn new<F>(entry: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack(entry, DEFAULT_STACK_SIZE, false)
    }

    /// Create a fiber with an explicit stack size.
    ///
    /// `is_caller` marks the dedicated scheduling fiber of a thread that takes
    /// part in its own scheduler. Fails when the stack cannot be allocated.
    pub fn with_stack<F>(entry: F, stack_size: usize, is_caller: bool) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_entry(Box::new(entry), stack_size, is_caller)
    }

    pub(crate) fn from_entry(entry: Entry, stack_size: usize, is_caller: bool) -> Result<Self> {
        let id = FiberId::next();
        let (resume_tx, resume_rx) = bounded::<Context>(1);
        let (suspend_tx, suspend_rx) = bounded::<FiberState>(1);
        let slot = Arc::new(Mutex::new(Some(entry)));

        let thread_slot = Arc::clone(&slot);
        thread::Builder::new()
            .name(format!("fiber-{}", id))
            .stack_size(stack_size)
            .spawn(move || fiber_main(id, resume_rx, suspend_tx, thread_slot))
            .map_err(Error::Io)?;

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(Fiber {
            inner: Arc::new(Inner {
                id,
                is_caller,
                stack_size,
                state: AtomicU8::new(FiberState::Init as u8),
                entry: slot,
                resume_tx,
                suspend_rx,
            }),
        })
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_caller(&self) -> bool {
        self.inner.is_caller
    }

    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    /// Number of fibers currently alive in the process.
    pub fn total() -> usize {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Transfer control into this fiber until it yields or finishes.
    ///
    /// The fiber inherits the caller's execution context. Swapping into a
    /// fiber that is running or finished is an invariant violation.
    pub fn swap_in(&self) -> FiberState {
        if !self.claim() {
            fatal(format!(
                "fiber {} swapped in from state {:?}",
                self.id(),
                self.state()
            ));
        }
        self.run_claimed(context().unwrap_or_default())
    }

    /// Reuse a finished (or never started) fiber for a new entry without
    /// allocating another stack.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_entry(Box::new(entry));
    }

    pub(crate) fn reset_entry(&self, entry: Entry) {
        let state = self.state();
        if !matches!(
            state,
            FiberState::Init | FiberState::Term | FiberState::Except
        ) {
            fatal(format!("fiber {} reset from state {:?}", self.id(), state));
        }
        *self.inner.entry.lock() = Some(entry);
        self.inner
            .state
            .store(FiberState::Init as u8, Ordering::Release);
    }

    /// Atomically move a resumable fiber to `Exec`.
    ///
    /// Returns false when the fiber is already running or finished.
    pub(crate) fn claim(&self) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if !FiberState::from_u8(current).is_resumable() {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                FiberState::Exec as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run a fiber previously claimed with [`Fiber::claim`].
    ///
    /// The state reported by the fiber is only published once the handshake
    /// is complete, so no other thread can resume it while it is still
    /// switching out.
    pub(crate) fn run_claimed(&self, context: Context) -> FiberState {
        if self.inner.resume_tx.send(context).is_err() {
            fatal(format!("fiber {} lost its backing thread", self.id()));
        }
        let next = match self.inner.suspend_rx.recv() {
            Ok(state) => state,
            Err(_) => fatal(format!("fiber {} lost its backing thread", self.id())),
        };
        self.inner.state.store(next as u8, Ordering::Release);
        next
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("is_caller", &self.is_caller())
            .finish()
    }
}

fn fiber_main(
    id: FiberId,
    resume_rx: Receiver<Context>,
    suspend_tx: Sender<FiberState>,
    entry: Arc<Mutex<Option<Entry>>>,
) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(Running {
            id,
            resume_rx: resume_rx.clone(),
            suspend_tx: suspend_tx.clone(),
            context: Context::default(),
        });
    });

    while let Ok(context) = resume_rx.recv() {
        install(context);
        let task = entry.lock().take();
        let state = match task {
            None => FiberState::Term,
            Some(task) => match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(()) => FiberState::Term,
                Err(payload) if payload.is::<Unwound>() => return,
                Err(payload) => {
                    tracing::error!(
                        target: "fiberio::fiber",
                        fiber = id.0,
                        "fiber panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    FiberState::Except
                }
            },
        };
        if suspend_tx.send(state).is_err() {
            return;
        }
    }
}

fn install(context: Context) {
    crate::hook::set_enabled(context.hook_enabled);
    CURRENT.with(|current| {
        if let Some(running) = current.borrow_mut().as_mut() {
            running.context = context;
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn suspend(next: FiberState) {
    let channels = CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|running| (running.suspend_tx.clone(), running.resume_rx.clone()))
    });
    let Some((suspend_tx, resume_rx)) = channels else {
        fatal("yield called outside of a fiber");
    };

    if suspend_tx.send(next).is_err() {
        panic::resume_unwind(Box::new(Unwound));
    }
    match resume_rx.recv() {
        Ok(context) => install(context),
        Err(_) => panic::resume_unwind(Box::new(Unwound)),
    }
}

/// Suspend the current fiber in `Hold`; something else must resume it.
pub fn yield_to_hold() {
    suspend(FiberState::Hold);
}

/// Suspend the current fiber in `Ready`; the scheduler requeues it.
pub fn yield_to_ready() {
    suspend(FiberState::Ready);
}

/// Id of the fiber running on this thread.
pub fn current_id() -> Option<FiberId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|running| running.id))
}

/// Execution context of the fiber running on this thread.
pub fn context() -> Option<Context> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|running| running.context.clone())
    })
}

pub fn in_fiber() -> bool {
    current_id().is_some()
}
