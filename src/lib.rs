//! Fiberio - Stackful Fiber Runtime
//!
//! Cooperative fibers multiplexed over a pool of worker threads, with an
//! epoll-driven I/O manager, a millisecond timer set, and hooked versions of
//! the blocking socket calls so straight-line blocking code only parks the
//! fiber that issued it.
//!
//! # Features
//!
//! - **Fibers**: stackful, explicitly resumed, with hold/ready yields
//! - **Scheduler**: N workers, FIFO queue, per-task worker affinity, optional
//!   participation of the constructing thread
//! - **Timers**: one-shot, recurring and condition timers, clock rollback
//!   detection
//! - **I/O manager**: one-shot READ/WRITE registrations on fds, resumed from
//!   an edge-triggered epoll loop
//! - **Hooks**: `read`/`recv`/`send`/`accept`/`connect`/`sleep` and friends
//!   that suspend the calling fiber instead of the thread, with socket
//!   timeouts
//!
//! # Example
//!
//! ```no_run
//! use fiberio::{hook, IoManager};
//!
//! let iom = IoManager::new(2, false, "example").unwrap();
//! iom.schedule(|| {
//!     hook::sleep(1);
//!     println!("woke up without blocking the worker");
//! });
//! iom.stop();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Hook layer    │  blocking-looking calls, fd registry
//! └────────┬────────┘
//!          │ add_event / add_timer + yield
//!          ▼
//! ┌─────────────────┐     ┌──────────────┐
//! │   IoManager     │────▶│ TimerManager │
//! │  (epoll idle)   │     └──────────────┘
//! └────────┬────────┘
//!          │ Driver
//!          ▼
//! ┌─────────────────┐
//! │   Scheduler     │  run queue, fiber arena, workers
//! └────────┬────────┘
//!          │ swap_in / yield
//!          ▼
//! ┌─────────────────┐
//! │     Fibers      │
//! └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod net;
pub mod scheduler;
pub mod timer;
pub mod util;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberId, FiberState};
pub use io::{Event, IoManager};
pub use scheduler::{Parker, Scheduler, WorkerRole};
pub use timer::{Timer, TimerManager};
