//! TCP echo server on the netloop engine.
//!
//! The TCP transport lives here, outside the engine crates - the core
//! treats the I/O primitive abstractly and this binary supplies the
//! concrete sockets.
//!
//! ```text
//! NETLOOP_ECHO_ADDR=127.0.0.1:7777 cargo run -p netloop-echo
//! printf 'hi\n' | nc 127.0.0.1 7777
//! ```

use netloop::{
    env_get, nl_error, nl_info, Bootstrap, Channel, Context, ExecutorGroup, Handler, Msg,
    NetError, NetResult, ReactorConfig, Transport,
};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

// ── TCP transports (raw, non-blocking) ───────────────────────────────

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

fn wouldblock(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Listening socket: created unbound so it can be registered before the
/// bind runs through the pipeline.
struct TcpAcceptor {
    fd: RawFd,
}

impl TcpAcceptor {
    fn new() -> NetResult<TcpAcceptor> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(NetError::last_os_error());
        }
        set_nonblocking(fd);
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        Ok(TcpAcceptor { fd })
    }
}

impl Transport for TcpAcceptor {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn bind(&mut self, addr: &SocketAddr) -> NetResult<()> {
        let SocketAddr::V4(v4) = addr else {
            return Err(NetError::Unsupported("IPv6 in the echo demo"));
        };
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                self.fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(NetError::last_os_error());
        }
        if unsafe { libc::listen(self.fd, 128) } < 0 {
            return Err(NetError::last_os_error());
        }
        Ok(())
    }

    fn accept(&mut self) -> NetResult<Option<Box<dyn Transport>>> {
        let child = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if child < 0 {
            let errno = last_errno();
            if wouldblock(errno) {
                return Ok(None);
            }
            return Err(NetError::Os(errno));
        }
        set_nonblocking(child);
        Ok(Some(Box::new(TcpStream { fd: child })))
    }

    fn close(&mut self) -> NetResult<()> {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        Ok(())
    }

    fn is_acceptor(&self) -> bool {
        true
    }
}

/// An accepted connection
struct TcpStream {
    fd: RawFd,
}

impl Transport for TcpStream {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn read(&mut self, buf: &mut [u8]) -> NetResult<Option<usize>> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let errno = last_errno();
        if wouldblock(errno) {
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
        let errno = last_errno();
        if wouldblock(errno) {
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

    fn is_active(&self) -> bool {
        true
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Takes accepted transports off the acceptor pipeline and registers a
/// child channel with the echo handler for each.
struct AcceptIntoGroup {
    group: ExecutorGroup,
}

impl Handler for AcceptIntoGroup {
    fn channel_read(&self, _ctx: &Context, msg: Msg) -> NetResult<()> {
        let transport = match msg.downcast::<Box<dyn Transport>>() {
            Ok(t) => *t,
            Err(_) => return Ok(()),
        };
        let child = Channel::new(transport);
        child
            .pipeline()
            .add_last("echo", Box::new(Echo))?;
        self.group.register(&child).add_listener(|outcome| {
            if let Some(e) = outcome.cause() {
                nl_error!("child registration failed: {}", e);
            }
        });
        Ok(())
    }
}

struct Echo;

impl Handler for Echo {
    fn channel_read(&self, ctx: &Context, msg: Msg) -> NetResult<()> {
        if let (Ok(data), Some(ch)) = (msg.downcast::<Vec<u8>>(), ctx.channel()) {
            ch.write_and_flush(*data);
        }
        Ok(())
    }
}

fn main() -> NetResult<()> {
    let addr: SocketAddr = env_get("NETLOOP_ECHO_ADDR", "127.0.0.1:7777".to_string())
        .parse()
        .map_err(|_| NetError::InvalidConfig("NETLOOP_ECHO_ADDR must be host:port"))?;

    let group = ExecutorGroup::new(ReactorConfig::from_env().name_prefix("echo"))?;
    let child_group = group.clone();
    let bootstrap = Bootstrap::new(&group).handler(move |ch: &Channel| {
        ch.pipeline().add_last(
            "acceptor",
            Box::new(AcceptIntoGroup {
                group: child_group.clone(),
            }),
        )
    });

    let bound = bootstrap.bind(Box::new(TcpAcceptor::new()?), addr);
    match bound.await_done(None)?.cause() {
        None => nl_info!("echo server listening on {}", addr),
        Some(e) => {
            nl_error!("bind failed: {}", e);
            return Err(e);
        }
    }

    // Serve until the process is killed.
    group.termination_future().await_done(None)?;
    Ok(())
}
