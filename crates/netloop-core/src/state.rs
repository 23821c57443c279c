//! Executor lifecycle states and readiness interest flags

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Lifecycle state of an executor.
///
/// Transitions are one-way:
/// `NotStarted -> Started -> ShuttingDown -> Shutdown -> Terminated`.
/// An executor that is shut down before its worker thread ever started
/// jumps straight from `NotStarted` to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExecutorState {
    /// Created, no worker thread yet
    NotStarted = 0,

    /// Worker thread spawned, loop running
    Started = 1,

    /// Graceful shutdown requested, draining tasks through the quiet period
    ShuttingDown = 2,

    /// Drain confirmed (or timed out), loop about to exit
    Shutdown = 3,

    /// Worker thread exited, termination promise fulfilled
    Terminated = 4,
}

impl ExecutorState {
    /// Shutdown has been requested (tasks may still be accepted)
    #[inline]
    pub const fn is_shutting_down(self) -> bool {
        self as u8 >= ExecutorState::ShuttingDown as u8
    }

    /// No further tasks are accepted
    #[inline]
    pub const fn is_shutdown(self) -> bool {
        self as u8 >= ExecutorState::Shutdown as u8
    }

    #[inline]
    pub const fn is_terminated(self) -> bool {
        matches!(self, ExecutorState::Terminated)
    }
}

impl From<u8> for ExecutorState {
    fn from(v: u8) -> Self {
        match v {
            0 => ExecutorState::NotStarted,
            1 => ExecutorState::Started,
            2 => ExecutorState::ShuttingDown,
            3 => ExecutorState::Shutdown,
            _ => ExecutorState::Terminated,
        }
    }
}

impl From<ExecutorState> for u8 {
    fn from(s: ExecutorState) -> u8 {
        s as u8
    }
}

/// Readiness categories a channel can subscribe to on the multiplexer.
///
/// The engine only assumes these four categories; how they map onto the
/// OS primitive (EPOLLIN/EPOLLOUT/POLLIN/...) is the multiplexer's
/// business.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1 << 0);
    pub const WRITABLE: Interest = Interest(1 << 1);
    pub const ACCEPTABLE: Interest = Interest(1 << 2);
    pub const CONNECTABLE: Interest = Interest(1 << 3);

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn with(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub const fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Interest {
        Interest(bits & 0x0f)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        self.with(rhs)
    }
}

impl BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{}", s)
        };
        if self.is_empty() {
            return write!(f, "Interest(NONE)");
        }
        write!(f, "Interest(")?;
        if self.contains(Interest::READABLE) {
            put(f, "R")?;
        }
        if self.contains(Interest::WRITABLE) {
            put(f, "W")?;
        }
        if self.contains(Interest::ACCEPTABLE) {
            put(f, "A")?;
        }
        if self.contains(Interest::CONNECTABLE) {
            put(f, "C")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(!ExecutorState::Started.is_shutting_down());
        assert!(ExecutorState::ShuttingDown.is_shutting_down());
        assert!(!ExecutorState::ShuttingDown.is_shutdown());
        assert!(ExecutorState::Shutdown.is_shutdown());
        assert!(ExecutorState::Terminated.is_terminated());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            ExecutorState::NotStarted,
            ExecutorState::Started,
            ExecutorState::ShuttingDown,
            ExecutorState::Shutdown,
            ExecutorState::Terminated,
        ] {
            assert_eq!(ExecutorState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_interest_ops() {
        let mut i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.contains(Interest::READABLE));
        assert!(i.contains(Interest::WRITABLE));
        assert!(!i.contains(Interest::CONNECTABLE));

        i = i.without(Interest::WRITABLE);
        assert!(!i.contains(Interest::WRITABLE));
        assert!(i.contains(Interest::READABLE));

        i |= Interest::CONNECTABLE;
        assert!(i.contains(Interest::CONNECTABLE));

        assert_eq!(Interest::from_bits(i.bits()), i);
        assert!(Interest::NONE.is_empty());
    }
}
