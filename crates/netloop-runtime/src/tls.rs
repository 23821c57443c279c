//! Thread-local executor identity
//!
//! Each executor worker thread installs its token here at startup. The
//! token is the thread-affinity test behind `in_event_loop()`: an
//! operation either runs immediately (token match) or is queued onto the
//! owning executor (mismatch), never both.

use netloop_core::id::ExecutorId;
use std::cell::Cell;

thread_local! {
    /// Token of the executor that owns this OS thread
    static EXECUTOR_TOKEN: Cell<u64> = const { Cell::new(u64::MAX) };
}

/// Install the executor token for this thread (worker startup)
#[inline]
pub fn set_executor_token(token: ExecutorId) {
    EXECUTOR_TOKEN.with(|cell| cell.set(token.as_u64()));
}

/// Clear the token (worker exiting)
#[inline]
pub fn clear_executor_token() {
    EXECUTOR_TOKEN.with(|cell| cell.set(u64::MAX));
}

/// Token of the executor owning the current thread, or the NONE sentinel
#[inline]
pub fn executor_token() -> ExecutorId {
    ExecutorId::new(EXECUTOR_TOKEN.with(|cell| cell.get()))
}

/// Is the current thread an executor worker at all?
#[inline]
pub fn on_executor_thread() -> bool {
    !executor_token().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        assert!(!on_executor_thread());
        set_executor_token(ExecutorId::new(99));
        assert_eq!(executor_token(), ExecutorId::new(99));
        assert!(on_executor_thread());
        clear_executor_token();
        assert!(!on_executor_thread());
    }

    #[test]
    fn test_token_is_thread_local() {
        set_executor_token(ExecutorId::new(5));
        let other = std::thread::spawn(|| executor_token().is_none())
            .join()
            .unwrap();
        assert!(other);
        clear_executor_token();
    }
}
