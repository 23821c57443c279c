//! epoll-backed multiplexer (Linux)

use super::{timeout_ms, Multiplexer, ReadyEvent};
use netloop_core::error::{NetError, NetResult};
use netloop_core::id::ChannelId;
use netloop_core::state::Interest;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

struct Registration {
    fd: RawFd,
    interest: Interest,
}

pub struct EpollMultiplexer {
    epfd: RawFd,
    registrations: HashMap<u64, Registration>,
    /// Reused kernel event buffer
    events: Vec<libc::epoll_event>,
}

impl EpollMultiplexer {
    pub fn new() -> NetResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::last_os_error());
        }
        Ok(Self {
            epfd,
            registrations: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; 256],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, id: u64, interest: Interest) -> NetResult<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: id,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(NetError::last_os_error());
        }
        Ok(())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.contains(Interest::READABLE) || interest.contains(Interest::ACCEPTABLE) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) || interest.contains(Interest::CONNECTABLE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_readiness(events: u32, interest: Interest) -> Interest {
    // Error and hang-up conditions are delivered through every
    // subscribed category; the transport call surfaces the errno.
    if events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
        return interest;
    }
    let mut readiness = Interest::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        readiness |= interest.without(Interest::WRITABLE.with(Interest::CONNECTABLE));
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        readiness |= interest.without(Interest::READABLE.with(Interest::ACCEPTABLE));
    }
    readiness
}

impl Multiplexer for EpollMultiplexer {
    fn register(&mut self, id: ChannelId, fd: RawFd, interest: Interest) -> NetResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, id.as_u64(), interest)?;
        self.registrations
            .insert(id.as_u64(), Registration { fd, interest });
        Ok(())
    }

    fn update(&mut self, id: ChannelId, interest: Interest) -> NetResult<()> {
        let reg = self
            .registrations
            .get_mut(&id.as_u64())
            .ok_or(NetError::NotRegistered)?;
        let fd = reg.fd;
        reg.interest = interest;
        self.ctl(libc::EPOLL_CTL_MOD, fd, id.as_u64(), interest)
    }

    fn deregister(&mut self, id: ChannelId) -> NetResult<()> {
        if let Some(reg) = self.registrations.remove(&id.as_u64()) {
            let ret = unsafe {
                libc::epoll_ctl(
                    self.epfd,
                    libc::EPOLL_CTL_DEL,
                    reg.fd,
                    std::ptr::null_mut(),
                )
            };
            // The fd may already be closed; EBADF/ENOENT are fine here.
            if ret < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno != libc::EBADF && errno != libc::ENOENT {
                    return Err(NetError::Os(errno));
                }
            }
        }
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> NetResult<usize> {
        out.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                return Ok(0);
            }
            return Err(NetError::Os(errno));
        }
        for ev in &self.events[..n as usize] {
            // Copy packed fields into locals to avoid unaligned references.
            let ev_u64 = ev.u64;
            let ev_events = ev.events;
            let interest = match self.registrations.get(&ev_u64) {
                Some(reg) => reg.interest,
                // The waker is registered like any channel; unknown ids
                // mean a registration raced a deregister - skip.
                None => Interest::READABLE,
            };
            let readiness = epoll_to_readiness(ev_events, interest);
            if !readiness.is_empty() {
                out.push(ReadyEvent {
                    id: ChannelId::new(ev_u64),
                    readiness,
                });
            }
        }
        Ok(out.len())
    }
}

impl Drop for EpollMultiplexer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
