//! epoll wrapper and the self-pipe used to interrupt a blocked wait.

use std::io;
use std::os::unix::io::RawFd;

use super::Event;

/// Thin wrapper over an epoll instance.
///
/// Registrations carry the fd itself as user data. All methods take `&self`;
/// the kernel serializes concurrent `epoll_ctl` and `epoll_wait` calls.
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    /// Start watching `fd` for `interest` (edge-triggered).
    pub fn register(&self, fd: RawFd, interest: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replace the interest set of a watched fd.
    pub fn modify(&self, fd: RawFd, interest: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let result = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Event) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Wait up to `timeout_ms` for readiness and append `(fd, events)` pairs.
    ///
    /// An interrupted wait reports zero events.
    pub fn poll(
        &self,
        buffer: &mut [libc::epoll_event],
        ready: &mut Vec<(RawFd, Event)>,
        timeout_ms: u64,
    ) -> io::Result<usize> {
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                buffer.as_mut_ptr(),
                buffer.len() as i32,
                timeout,
            )
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for event in &buffer[..count as usize] {
            let bits = event.events;
            let data = event.u64;
            ready.push((data as RawFd, Event::from_bits(bits)));
        }
        Ok(count as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

/// Non-blocking pipe whose read end sits in the poller; writing a byte wakes
/// a worker blocked in `epoll_wait`.
pub struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn wake(&self) {
        let byte = b'T';
        let n = unsafe { libc::write(self.write_fd, (&byte as *const u8).cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a pending wake-up.
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(target: "fiberio::io", "tickle write failed: {err}");
            }
        }
    }

    /// Consume every pending wake-up byte.
    pub fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
