//! Per-fd bookkeeping for the hook layer.
//!
//! The first hooked call on an fd records whether it is a socket and, for
//! sockets, switches the fd to non-blocking at the OS level. The flag the
//! user asked for is tracked separately so hooked `fcntl`/`ioctl` can report
//! it back unchanged.
//!
//! Entries remember the device and inode they were created for. An fd number
//! closed behind the registry's back and reused for another file gets a fresh
//! entry on its next lookup.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::io::{IoManager, WeakIoManager};

/// Timeout value meaning "wait forever".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which socket timeout an operation obeys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

/// Hook state of one fd.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    identity: Option<(u64, u64)>,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
    waiters: Mutex<Vec<(u64, WeakIoManager)>>,
}

fn fstat(fd: RawFd) -> Option<libc::stat> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    (unsafe { libc::fstat(fd, &mut stat) } == 0).then_some(stat)
}

fn identity(stat: &libc::stat) -> (u64, u64) {
    (stat.st_dev as u64, stat.st_ino as u64)
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let stat = fstat(fd);
        let is_socket = stat
            .as_ref()
            .is_some_and(|stat| stat.st_mode & libc::S_IFMT == libc::S_IFSOCK);

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }

        Self {
            fd,
            identity: stat.as_ref().map(identity),
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Whether the fd still refers to the file this entry was created for.
    fn is_current(&self) -> bool {
        match (fstat(self.fd), self.identity) {
            (Some(stat), Some(id)) => identity(&stat) == id,
            _ => false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Whether the runtime put the fd into non-blocking mode.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// Whether the user asked for non-blocking mode.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remember that `iom` has armed an event on this fd.
    pub(crate) fn add_waiter(&self, iom: &IoManager) {
        let mut waiters = self.waiters.lock();
        if !waiters.iter().any(|(id, _)| *id == iom.id()) {
            waiters.push((iom.id(), iom.downgrade()));
        }
    }

    /// Resume every fiber parked on this fd, whichever manager holds it.
    pub(crate) fn release_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for (_, weak) in waiters {
            if let Some(iom) = weak.upgrade() {
                iom.cancel_all(self.fd);
            }
        }
    }

    /// Timeout in milliseconds, [`NO_TIMEOUT`] when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide registry of [`FdCtx`] entries.
#[derive(Default)]
pub struct FdManager {
    fds: RwLock<HashMap<RawFd, Arc<FdCtx>>>,
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::default);

impl FdManager {
    pub fn global() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Look up `fd`, creating its entry when `auto_create` is set.
    ///
    /// An entry whose fd now names a different file is dropped first.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let existing = self.fds.read().get(&fd).cloned();
        if let Some(ctx) = existing {
            if ctx.is_current() {
                return Some(ctx);
            }
            tracing::debug!(target: "fiberio::hook", fd, "fd reused, dropping stale entry");
            self.evict(&ctx);
        }
        if !auto_create {
            return None;
        }
        let mut fds = self.fds.write();
        let ctx = fds.entry(fd).or_insert_with(|| Arc::new(FdCtx::new(fd)));
        Some(Arc::clone(ctx))
    }

    fn evict(&self, stale: &Arc<FdCtx>) {
        {
            let mut fds = self.fds.write();
            if fds.get(&stale.fd).is_some_and(|ctx| Arc::ptr_eq(ctx, stale)) {
                fds.remove(&stale.fd);
            }
        }
        stale.closed.store(true, Ordering::SeqCst);
        stale.release_waiters();
    }

    /// Forget `fd`; holders of the old entry see it as closed.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        let ctx = self.fds.write().remove(&fd)?;
        ctx.closed.store(true, Ordering::SeqCst);
        Some(ctx)
    }
}
