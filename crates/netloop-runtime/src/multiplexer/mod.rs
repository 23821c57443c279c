//! Readiness multiplexer abstraction
//!
//! A `Multiplexer` wraps the OS readiness-notification primitive for one
//! reactor. Registrations are keyed by `ChannelId`, not raw fd, so the
//! reactor can refill a fresh instance from its channel table after a
//! rebuild without fd-reuse hazards.
//!
//! # Implementors
//!
//! - `EpollMultiplexer` (Linux, default): epoll with edge bits left off
//!   (level-triggered), one `epoll_event.u64` per registration.
//!
//! - `PollMultiplexer` (portable fallback): rebuilds a `pollfd` array per
//!   wait. O(n) per call; correct everywhere `poll(2)` exists.
//!
//! **Contract:**
//! - All methods are called from the owning reactor thread only.
//! - `wait` with `Some(Duration::ZERO)` must not block; `None` may block
//!   indefinitely.
//! - A `wait` that is interrupted (EINTR) reports zero events rather
//!   than an error.

use netloop_core::error::NetResult;
use netloop_core::id::ChannelId;
use netloop_core::state::Interest;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub mod waker;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollMultiplexer as PlatformMultiplexer;
    } else {
        mod poll;
        pub use poll::PollMultiplexer as PlatformMultiplexer;
    }
}

/// Registration token the reactor uses for its own wake-up handle
pub const WAKER_TOKEN: ChannelId = ChannelId::new(u64::MAX - 1);

/// One readiness notification.
///
/// `readiness` is the intersection of what fired and what the
/// registration subscribed to; error/hang-up conditions are folded into
/// the subscribed categories so the channel discovers them on its next
/// transport call.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub id: ChannelId,
    pub readiness: Interest,
}

/// OS readiness-notification primitive owned by one reactor.
pub trait Multiplexer: Send {
    /// Start watching `fd` under `id` with the given interest set
    fn register(&mut self, id: ChannelId, fd: RawFd, interest: Interest) -> NetResult<()>;

    /// Replace the interest set of an existing registration
    fn update(&mut self, id: ChannelId, interest: Interest) -> NetResult<()>;

    /// Stop watching a registration. Unknown ids are a no-op.
    fn deregister(&mut self, id: ChannelId) -> NetResult<()>;

    /// Wait for readiness, appending into `out` (cleared first).
    /// Returns the number of events delivered.
    fn wait(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> NetResult<usize>;
}

/// Default platform multiplexer, boxed for the executor factory
pub fn platform_multiplexer() -> NetResult<Box<dyn Multiplexer>> {
    Ok(Box::new(PlatformMultiplexer::new()?))
}

/// Millisecond timeout for the syscall: -1 blocks, 0 polls; sub-ms
/// remainders round up so short deadlines do not busy-spin.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis();
            let ms = if d.subsec_nanos() % 1_000_000 != 0 {
                ms + 1
            } else {
                ms
            };
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms_mapping() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_millis(25))), 25);
        // 100 microseconds rounds up, not down to a busy spin
        assert_eq!(timeout_ms(Some(Duration::from_micros(100))), 1);
    }
}
