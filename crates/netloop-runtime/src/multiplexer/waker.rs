//! Cross-thread reactor wake-up handle
//!
//! Wakes a reactor blocked in its multiplexer. Coalescing: calls between
//! two waits collapse into one syscall via the `pending` flag, which the
//! reactor re-arms with `prepare_wait()` immediately before each
//! blocking attempt (re-arming any later would lose a wake racing the
//! drain).
//!
//! Linux uses an eventfd; other Unixes use a non-blocking self-pipe.

use netloop_core::error::{NetError, NetResult};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct EventWaker {
    read_fd: RawFd,
    write_fd: RawFd,
    pending: AtomicBool,
}

// The fds are written/read with single atomic syscalls.
unsafe impl Send for EventWaker {}
unsafe impl Sync for EventWaker {}

impl EventWaker {
    #[cfg(target_os = "linux")]
    pub fn new() -> NetResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::last_os_error());
        }
        Ok(Self {
            read_fd: fd,
            write_fd: fd,
            pending: AtomicBool::new(false),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> NetResult<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(NetError::last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            pending: AtomicBool::new(false),
        })
    }

    /// The fd the reactor registers for readability
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Re-arm coalescing. Must run before the queue re-check that
    /// precedes a blocking wait.
    #[inline]
    pub fn prepare_wait(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Wake the reactor if it may be blocked. Coalesced between waits.
    pub fn wake(&self) {
        if self.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // EAGAIN means the counter/pipe is already saturated, which
            // already guarantees a wake-up.
            if errno != libc::EAGAIN {
                netloop_core::nl_warn!("waker write failed: errno {}", errno);
            }
        }
    }

    /// Empty the fd after a wake-up was observed
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let ret = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret <= 0 {
                break;
            }
            // eventfd returns the whole counter in one read; pipes may
            // need another pass.
            if (ret as usize) < buf.len() {
                break;
            }
        }
    }
}

impl Drop for EventWaker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}
