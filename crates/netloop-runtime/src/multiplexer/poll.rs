//! poll(2)-backed multiplexer (portable fallback)
//!
//! Rebuilds the pollfd array on every wait. O(n) per call, which is fine
//! for the platforms that land here; Linux uses `EpollMultiplexer`.

use super::{timeout_ms, Multiplexer, ReadyEvent};
use netloop_core::error::{NetError, NetResult};
use netloop_core::id::ChannelId;
use netloop_core::state::Interest;
use std::os::unix::io::RawFd;
use std::time::Duration;

struct Registration {
    id: u64,
    fd: RawFd,
    interest: Interest,
}

pub struct PollMultiplexer {
    registrations: Vec<Registration>,
    pollfds: Vec<libc::pollfd>,
}

impl PollMultiplexer {
    pub fn new() -> NetResult<Self> {
        Ok(Self {
            registrations: Vec::new(),
            pollfds: Vec::new(),
        })
    }

    fn position(&self, id: ChannelId) -> Option<usize> {
        self.registrations.iter().position(|r| r.id == id.as_u64())
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut events = 0 as libc::c_short;
    if interest.contains(Interest::READABLE) || interest.contains(Interest::ACCEPTABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) || interest.contains(Interest::CONNECTABLE) {
        events |= libc::POLLOUT;
    }
    events
}

fn poll_to_readiness(revents: libc::c_short, interest: Interest) -> Interest {
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return interest;
    }
    let mut readiness = Interest::NONE;
    if revents & libc::POLLIN != 0 {
        readiness |= interest.without(Interest::WRITABLE.with(Interest::CONNECTABLE));
    }
    if revents & libc::POLLOUT != 0 {
        readiness |= interest.without(Interest::READABLE.with(Interest::ACCEPTABLE));
    }
    readiness
}

impl Multiplexer for PollMultiplexer {
    fn register(&mut self, id: ChannelId, fd: RawFd, interest: Interest) -> NetResult<()> {
        if self.position(id).is_some() {
            return Err(NetError::AlreadyRegistered);
        }
        self.registrations.push(Registration {
            id: id.as_u64(),
            fd,
            interest,
        });
        Ok(())
    }

    fn update(&mut self, id: ChannelId, interest: Interest) -> NetResult<()> {
        match self.position(id) {
            Some(i) => {
                self.registrations[i].interest = interest;
                Ok(())
            }
            None => Err(NetError::NotRegistered),
        }
    }

    fn deregister(&mut self, id: ChannelId) -> NetResult<()> {
        if let Some(i) = self.position(id) {
            self.registrations.swap_remove(i);
        }
        Ok(())
    }

    fn wait(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> NetResult<usize> {
        out.clear();
        self.pollfds.clear();
        for reg in &self.registrations {
            self.pollfds.push(libc::pollfd {
                fd: reg.fd,
                events: interest_to_poll(reg.interest),
                revents: 0,
            });
        }
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
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
        for (reg, pfd) in self.registrations.iter().zip(&self.pollfds) {
            if pfd.revents == 0 {
                continue;
            }
            let readiness = poll_to_readiness(pfd.revents, reg.interest);
            if !readiness.is_empty() {
                out.push(ReadyEvent {
                    id: ChannelId::new(reg.id),
                    readiness,
                });
            }
        }
        Ok(out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_update_deregister() {
        let mut mux = PollMultiplexer::new().unwrap();
        let id = ChannelId::new(1);
        mux.register(id, 0, Interest::READABLE).unwrap();
        assert_eq!(
            mux.register(id, 0, Interest::READABLE).unwrap_err(),
            NetError::AlreadyRegistered
        );
        mux.update(id, Interest::WRITABLE).unwrap();
        mux.deregister(id).unwrap();
        assert_eq!(
            mux.update(id, Interest::WRITABLE).unwrap_err(),
            NetError::NotRegistered
        );
    }
}
