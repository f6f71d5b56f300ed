//! Cooperative versions of blocking system calls.
//!
//! When hooking is enabled on the calling thread (workers of an
//! [`IoManager`] enable it), and the call runs inside one of its fibers, a
//! call that would block parks only the calling fiber: the fd is registered with
//! the manager, the fiber yields, and the call is retried once the fd is
//! ready. Outside of that setting every function behaves exactly like the
//! plain system call.
//!
//! Socket timeouts set through [`setsockopt_timeout`] bound the wait; an
//! expired wait fails with `ETIMEDOUT`.

use std::cell::Cell;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockAddr;

use crate::config::HookConfig;
use crate::fd::{FdCtx, FdManager, TimeoutKind, NO_TIMEOUT};
use crate::fiber;
use crate::io::{Event, IoManager};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

/// Whether hooked calls on this thread may suspend the calling fiber.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(Cell::get)
}

pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}

/// Apply process-wide hook settings.
pub fn configure(config: &HookConfig) {
    CONNECT_TIMEOUT_MS.store(config.connect_timeout_ms, Ordering::Relaxed);
}

/// Whether a call made here can park on an [`IoManager`].
fn hooking() -> bool {
    is_enabled() && IoManager::current().is_some()
}

/// Timeout used by [`connect`], in milliseconds.
pub fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

fn cvt_size(result: libc::ssize_t) -> io::Result<usize> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Arm a timer that cancels `event` on `fd` and records `ETIMEDOUT`.
///
/// The timer only holds a weak reference to `cancelled`, so it becomes a
/// no-op once the waiting call has returned.
fn arm_timeout(
    iom: &IoManager,
    fd: RawFd,
    event: Event,
    timeout_ms: u64,
    cancelled: &Arc<AtomicI32>,
) -> Option<crate::timer::Timer> {
    if timeout_ms == NO_TIMEOUT {
        return None;
    }
    let weak = Arc::downgrade(cancelled);
    let flag = Arc::downgrade(cancelled);
    let manager = iom.downgrade();
    Some(iom.add_condition_timer(
        timeout_ms,
        move || {
            let Some(flag) = flag.upgrade() else {
                return;
            };
            if flag
                .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if let Some(iom) = manager.upgrade() {
                iom.cancel_event(fd, event);
            }
        },
        weak,
        false,
    ))
}

/// Register the current fiber for `event` on `fd` and suspend until the
/// event fires or the timeout cancels it.
fn wait_ready(
    iom: IoManager,
    ctx: &FdCtx,
    event: Event,
    timeout_ms: u64,
) -> io::Result<()> {
    let fd = ctx.fd();
    let cancelled = Arc::new(AtomicI32::new(0));
    let timer = arm_timeout(&iom, fd, event, timeout_ms, &cancelled);

    ctx.add_waiter(&iom);
    if let Err(e) = iom.add_event(fd, event) {
        tracing::error!(target: "fiberio::hook", fd, ?event, "add_event failed: {e}");
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Err(e.into());
    }
    // A close that ran before the event was armed could not release it.
    if ctx.is_closed() {
        if let Some(timer) = timer {
            timer.cancel();
        }
        if !iom.del_event(fd, event) {
            // Already fired for us; take the queued wake-up.
            drop(iom);
            fiber::yield_to_hold();
        }
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // A suspended fiber must not keep its manager alive.
    drop(iom);
    fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match cancelled.load(Ordering::Acquire) {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// Run `op` until it stops failing with `EAGAIN`, parking the fiber on
/// `event` in between.
fn do_io<T, F>(
    fd: RawFd,
    name: &'static str,
    event: Event,
    kind: TimeoutKind,
    mut op: F,
) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    if !hooking() {
        return op();
    }
    let Some(ctx) = FdManager::global().get(fd, true) else {
        return op();
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout_ms = ctx.timeout(kind);
    loop {
        let result = loop {
            match op() {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match result {
            Err(ref e) if would_block(e) => {}
            other => return other,
        }

        let Some(iom) = IoManager::current() else {
            return result;
        };
        tracing::trace!(target: "fiberio::hook", fd, name, "would block, parking fiber");
        wait_ready(iom, &ctx, event, timeout_ms)?;
        if ctx.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
    }
}

fn sleep_ms(ms: u64) {
    let iom = if is_enabled() { IoManager::current() } else { None };
    let (Some(iom), Some(id)) = (iom, fiber::current_id()) else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };

    let manager = iom.downgrade();
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = manager.upgrade() {
                iom.wake(id);
            }
        },
        false,
    );
    drop(iom);
    fiber::yield_to_hold();
}

/// Suspend for `seconds`; only the calling fiber waits.
pub fn sleep(seconds: u32) {
    sleep_ms(u64::from(seconds) * 1000);
}

pub fn usleep(micros: u64) {
    sleep_ms(micros / 1000);
}

pub fn nanosleep(duration: Duration) {
    sleep_ms(duration.as_millis().min(u128::from(u64::MAX)) as u64);
}

/// Create a socket, registering it with the fd registry when hooking is on.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = cvt(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) })?;
    if hooking() {
        FdManager::global().get(fd, true);
    }
    Ok(fd)
}

/// Connect with the configured default timeout.
pub fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, connect_timeout_ms())
}

/// Connect, waiting at most `timeout_ms` for the handshake to finish.
pub fn connect_with_timeout(fd: RawFd, addr: &SockAddr, timeout_ms: u64) -> io::Result<()> {
    let raw_connect = || cvt(unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) }).map(drop);

    if !hooking() {
        return raw_connect();
    }
    let Some(ctx) = FdManager::global().get(fd, true) else {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw_connect();
    }

    match raw_connect() {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    let Some(iom) = IoManager::current() else {
        return Err(io::Error::from_raw_os_error(libc::EINPROGRESS));
    };
    wait_ready(iom, &ctx, Event::WRITE, timeout_ms)?;

    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut error as *mut libc::c_int).cast(),
            &mut len,
        )
    })?;
    if error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(error))
    }
}

/// Accept a connection; the new fd is registered with the fd registry.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let client = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        cvt(unsafe {
            libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        })
    })?;
    if hooking() {
        FdManager::global().get(client, true);
    }
    Ok(client)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || {
        cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || {
        cvt_size(unsafe {
            libc::readv(
                fd,
                bufs.as_ptr().cast(),
                bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
            )
        })
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || {
        cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) })
    })
}

/// Receive a datagram along with its source address.
pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<(usize, SockAddr)> {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = cvt_size(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        })?;
        Ok((n, unsafe { SockAddr::new(storage, len) }))
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || {
        cvt_size(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || {
        cvt_size(unsafe {
            libc::writev(
                fd,
                bufs.as_ptr().cast(),
                bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
            )
        })
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || {
        cvt_size(unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) })
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, addr: &SockAddr) -> io::Result<usize> {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        cvt_size(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                buf.len(),
                flags,
                addr.as_ptr(),
                addr.len(),
            )
        })
    })
}

/// Close `fd`, first resuming every fiber waiting on it.
///
/// Waiters are released from any thread; they fail with `EBADF`.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(ctx) = FdManager::global().remove(fd) {
        ctx.release_waiters();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
    }
    cvt(unsafe { libc::close(fd) }).map(drop)
}

/// File status flags as the user set them.
///
/// For hooked sockets `O_NONBLOCK` reflects the user's request, not the
/// runtime's OS-level setting.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    match FdManager::global().get(fd, false) {
        Some(ctx) if ctx.is_socket() && !ctx.is_closed() => {
            if ctx.user_nonblock() {
                Ok(flags | libc::O_NONBLOCK)
            } else {
                Ok(flags & !libc::O_NONBLOCK)
            }
        }
        _ => Ok(flags),
    }
}

pub fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    let flags = match FdManager::global().get(fd, false) {
        Some(ctx) if ctx.is_socket() && !ctx.is_closed() => {
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => flags,
    };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(drop)
}

/// `ioctl(fd, FIONBIO, &on)`.
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> io::Result<()> {
    let mut value = libc::c_int::from(on);
    if let Some(ctx) = FdManager::global().get(fd, false) {
        if ctx.is_socket() && !ctx.is_closed() {
            ctx.set_user_nonblock(on);
            value = libc::c_int::from(ctx.sys_nonblock() || on);
        }
    }
    cvt(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut value as *mut libc::c_int) }).map(drop)
}

fn timeout_option(kind: TimeoutKind) -> libc::c_int {
    match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    }
}

/// Set `SO_RCVTIMEO`/`SO_SNDTIMEO`; hooked calls on the fd obey it.
pub fn setsockopt_timeout(
    fd: RawFd,
    kind: TimeoutKind,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let tv = match timeout {
        Some(d) => libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        },
        None => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    };
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            timeout_option(kind),
            (&tv as *const libc::timeval).cast(),
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    })?;

    if let Some(ctx) = FdManager::global().get(fd, hooking()) {
        let ms = match timeout {
            Some(d) if !d.is_zero() => d.as_millis().min(u128::from(NO_TIMEOUT - 1)) as u64,
            _ => NO_TIMEOUT,
        };
        ctx.set_timeout(kind, ms);
    }
    Ok(())
}

/// Current socket timeout; `None` means wait forever.
pub fn socket_timeout(fd: RawFd, kind: TimeoutKind) -> io::Result<Option<Duration>> {
    if let Some(ctx) = FdManager::global().get(fd, false) {
        let ms = ctx.timeout(kind);
        return Ok((ms != NO_TIMEOUT).then(|| Duration::from_millis(ms)));
    }

    let mut tv: libc::timeval = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::timeval>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            timeout_option(kind),
            (&mut tv as *mut libc::timeval).cast(),
            &mut len,
        )
    })?;
    let duration = Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64);
    Ok((!duration.is_zero()).then_some(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn test_disabled_by_default() {
        std::thread::spawn(|| {
            assert!(!is_enabled());
            set_enabled(true);
            assert!(is_enabled());
        })
        .join()
        .unwrap();
        assert!(!is_enabled());
    }

    #[test]
    fn test_sleep_outside_fiber_blocks_thread() {
        let start = Instant::now();
        usleep(20_000);
        nanosleep(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_plain_read_write_when_disabled() {
        let (a, b) = UnixStream::pair().unwrap();
        assert_eq!(write(a.as_raw_fd(), b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(b.as_raw_fd(), &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_user_nonblock_view() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let ctx = FdManager::global().get(fd, true).unwrap();
        assert!(ctx.sys_nonblock());

        // The runtime's O_NONBLOCK is hidden from the user.
        assert_eq!(fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK, 0);

        let flags = fcntl_getfl(fd).unwrap();
        fcntl_setfl(fd, flags | libc::O_NONBLOCK).unwrap();
        assert!(ctx.user_nonblock());
        assert_ne!(fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK, 0);

        ioctl_fionbio(fd, false).unwrap();
        assert!(!ctx.user_nonblock());
        let raw = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(raw & libc::O_NONBLOCK, 0);

        FdManager::global().remove(fd);
    }

    #[test]
    fn test_socket_timeout_round_trip() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        assert_eq!(socket_timeout(fd, TimeoutKind::Recv).unwrap(), None);

        setsockopt_timeout(fd, TimeoutKind::Recv, Some(Duration::from_millis(1500))).unwrap();
        assert_eq!(
            socket_timeout(fd, TimeoutKind::Recv).unwrap(),
            Some(Duration::from_millis(1500))
        );
        setsockopt_timeout(fd, TimeoutKind::Recv, None).unwrap();
        assert_eq!(socket_timeout(fd, TimeoutKind::Recv).unwrap(), None);
    }

    #[test]
    fn test_close_forgets_fd() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let ctx = FdManager::global().get(fd, true).unwrap();
        close(fd).unwrap();
        assert!(ctx.is_closed());
        assert!(FdManager::global().get(fd, false).is_none());
    }

    #[test]
    fn test_connect_refused_without_hooks() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let err = connect(fd, &SockAddr::from(addr)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
        close(fd).unwrap();
    }
}
