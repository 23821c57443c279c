//! Shared test fixtures: fake transports and a do-nothing multiplexer

use crate::channel::Transport;
use crate::multiplexer::{Multiplexer, ReadyEvent};
use netloop_core::error::{NetError, NetResult};
use netloop_core::id::ChannelId;
use netloop_core::state::Interest;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Transport with no backing fd; usable only with mock multiplexers.
pub(crate) struct NullTransport {
    closed: bool,
}

impl NullTransport {
    pub fn new() -> Self {
        Self { closed: false }
    }
}

impl Transport for NullTransport {
    fn fd(&self) -> RawFd {
        -1
    }

    fn close(&mut self) -> NetResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Multiplexer that accepts every registration and reports nothing.
/// Waits honor their timeout by napping (bounded, so shutdown stays
/// responsive with no waker integration).
pub(crate) struct IdleMux {
    registrations: HashMap<u64, Interest>,
}

impl IdleMux {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }
}

impl Multiplexer for IdleMux {
    fn register(&mut self, id: ChannelId, _fd: RawFd, interest: Interest) -> NetResult<()> {
        self.registrations.insert(id.as_u64(), interest);
        Ok(())
    }

    fn update(&mut self, id: ChannelId, interest: Interest) -> NetResult<()> {
        match self.registrations.get_mut(&id.as_u64()) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(NetError::NotRegistered),
        }
    }

    fn deregister(&mut self, id: ChannelId) -> NetResult<()> {
        self.registrations.remove(&id.as_u64());
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> NetResult<usize> {
        out.clear();
        std::thread::sleep(
            timeout
                .unwrap_or(Duration::from_millis(50))
                .min(Duration::from_millis(50)),
        );
        Ok(0)
    }
}

/// Stream transport over one end of a non-blocking Unix socketpair. The
/// other end stays with the test for raw byte injection.
pub(crate) struct PairTransport {
    fd: RawFd,
}

impl PairTransport {
    /// (transport end, raw peer fd). The peer fd is the caller's to
    /// close.
    pub fn pair() -> (PairTransport, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0, "socketpair failed");
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (PairTransport { fd: fds[0] }, fds[1])
    }
}

impl Transport for PairTransport {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn is_active(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> NetResult<Option<usize>> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            Ok(None)
        } else {
            Err(NetError::Os(errno))
        }
    }

    fn write(&mut self, buf: &[u8]) -> NetResult<Option<usize>> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            Ok(None)
        } else {
            Err(NetError::Os(errno))
        }
    }

    fn close(&mut self) -> NetResult<()> {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        Ok(())
    }
}

/// Connect never completes: registers a real (pipe) fd so actual
/// multiplexers accept it, reports the connect as forever in progress.
/// Built for connect-timeout tests.
pub(crate) struct StallTransport {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl StallTransport {
    pub fn new() -> Self {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "pipe failed");
        Self {
            read_fd: fds[0],
            write_fd: fds[1],
        }
    }
}

impl Transport for StallTransport {
    fn fd(&self) -> RawFd {
        self.read_fd
    }

    fn connect(&mut self, _addr: &SocketAddr) -> NetResult<bool> {
        Ok(false)
    }

    fn finish_connect(&mut self) -> NetResult<bool> {
        Ok(false)
    }

    fn close(&mut self) -> NetResult<()> {
        if self.read_fd >= 0 {
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
            self.read_fd = -1;
            self.write_fd = -1;
        }
        Ok(())
    }
}
