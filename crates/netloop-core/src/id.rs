//! Channel and executor identifier types
//!
//! Ids are plain u64 newtypes handed out by an `IdGen` owned by the
//! runtime object that needs them (group, registry). There are no
//! process-global counters; ownership keeps tests independent.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a channel.
///
/// Doubles as the registration token handed to the multiplexer, so a
/// rebuilt multiplexer can be refilled from the reactor's channel table
/// without raw-fd reuse hazards. `u64::MAX` is reserved as the "no
/// channel" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Sentinel value indicating no channel
    pub const NONE: ChannelId = ChannelId(u64::MAX);

    #[inline]
    pub const fn new(id: u64) -> Self {
        ChannelId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ChannelId(NONE)")
        } else {
            write!(f, "ChannelId({})", self.0)
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Unique identifier for an executor.
///
/// Compared against the thread-local token to answer `in_event_loop()`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExecutorId(u64);

impl ExecutorId {
    /// Sentinel for "calling thread is not an executor thread"
    pub const NONE: ExecutorId = ExecutorId(u64::MAX);

    #[inline]
    pub const fn new(id: u64) -> Self {
        ExecutorId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ExecutorId(NONE)")
        } else {
            write!(f, "ExecutorId({})", self.0)
        }
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Monotonic id allocator.
///
/// Wrapping increment on a u64 - at one allocation per nanosecond the
/// counter wraps after ~584 years, and the sentinel value is skipped.
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Allocate the next raw id. Never returns `u64::MAX` (the sentinel).
    #[inline]
    pub fn next_raw(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != u64::MAX {
                return id;
            }
        }
    }

    #[inline]
    pub fn next_channel_id(&self) -> ChannelId {
        ChannelId::new(self.next_raw())
    }

    #[inline]
    pub fn next_executor_id(&self) -> ExecutorId {
        ExecutorId::new(self.next_raw())
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_basics() {
        let id = ChannelId::new(7);
        assert_eq!(id.as_u64(), 7);
        assert!(!id.is_none());
        assert!(ChannelId::NONE.is_none());
        assert_eq!(format!("{}", id), "7");
        assert_eq!(format!("{}", ChannelId::NONE), "none");
    }

    #[test]
    fn test_idgen_sequential() {
        let gen = IdGen::new();
        assert_eq!(gen.next_raw(), 0);
        assert_eq!(gen.next_raw(), 1);
        assert_eq!(gen.next_raw(), 2);
    }

    #[test]
    fn test_idgen_concurrent_unique() {
        use std::sync::Arc;
        use std::thread;

        let gen = Arc::new(IdGen::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| gen.next_raw()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = vec![];
        for h in handles {
            all.extend(h.join().unwrap());
        }

        assert_eq!(all.len(), 4000);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
