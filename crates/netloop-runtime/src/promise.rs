//! Single-assignment result cell with listener delivery
//!
//! A `Promise` is resolved exactly once and observed through listeners.
//! Listeners run on the promise's executor. A promise created before its
//! channel has an owning executor (registration races) is bound to the
//! process-wide fallback executor until `bind_executor` publishes the
//! real one; the publish is a monotonic `OnceLock` write, re-checked on
//! every listener add, so no lock is involved in the upgrade.

use crate::executor::{fallback_executor, Executor};
use crate::tls;
use netloop_core::error::{NetError, NetResult};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

/// Final state of a promise
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Failure(NetError),
    Cancelled,
}

impl<T> Outcome<T> {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure cause, if any (`Cancelled` maps to `NetError::Cancelled`)
    pub fn cause(&self) -> Option<NetError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(e) => Some(e.clone()),
            Outcome::Cancelled => Some(NetError::Cancelled),
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Arc<Outcome<T>>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    /// Owning executor, published once (registration "upgrade")
    executor: OnceLock<Executor>,
}

/// A writable future. Cloning shares the same cell.
pub struct Promise<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// New pending promise bound to the fallback executor until upgraded
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                cond: Condvar::new(),
                executor: OnceLock::new(),
            }),
        }
    }

    /// New promise already bound to `executor`
    pub fn bound(executor: &Executor) -> Self {
        let p = Promise::new();
        p.bind_executor(executor);
        p
    }

    /// Publish the owning executor. First publish wins; later calls are
    /// ignored. Safe to race with `add_listener` from any thread.
    pub fn bind_executor(&self, executor: &Executor) {
        let _ = self.inner.executor.set(executor.clone());
    }

    /// The executor listeners are delivered on: the published owner, or
    /// the process-wide fallback until the owner is known.
    pub fn executor(&self) -> Executor {
        match self.inner.executor.get() {
            Some(ex) => ex.clone(),
            None => fallback_executor().clone(),
        }
    }

    /// Fulfil with a value. Returns false if already done.
    pub fn succeed(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Fail with a cause. Returns false if already done.
    pub fn fail(&self, cause: NetError) -> bool {
        self.complete(Outcome::Failure(cause))
    }

    /// Cancel. Returns false if already done.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let listeners;
        let shared;
        {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Pending(pending) => {
                    listeners = std::mem::take(pending);
                    shared = Arc::new(outcome);
                    *state = State::Done(Arc::clone(&shared));
                }
                State::Done(_) => return false,
            }
            self.inner.cond.notify_all();
        }
        for listener in listeners {
            self.deliver(listener, Arc::clone(&shared));
        }
        true
    }

    /// Attach a listener. Runs on `executor()` - immediately dispatched
    /// if the promise is already done, otherwise when it completes.
    pub fn add_listener<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let boxed: Listener<T> = Box::new(f);
        let done = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Pending(pending) => {
                    pending.push(boxed);
                    None
                }
                State::Done(outcome) => Some((boxed, Arc::clone(outcome))),
            }
        };
        if let Some((boxed, outcome)) = done {
            self.deliver(boxed, outcome);
        }
    }

    fn deliver(&self, listener: Listener<T>, outcome: Arc<Outcome<T>>) {
        let executor = self.executor();
        executor.execute_or_run(Box::new(move || listener(&outcome)));
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(_))
    }

    /// The outcome, if resolved
    pub fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        match &*self.inner.state.lock().unwrap() {
            State::Done(outcome) => Some(Arc::clone(outcome)),
            State::Pending(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome().map(|o| o.is_success()).unwrap_or(false)
    }

    /// The failure cause, if resolved unsuccessfully
    pub fn cause(&self) -> Option<NetError> {
        self.outcome().and_then(|o| o.cause())
    }

    /// Block until resolved, or until `timeout` expires.
    ///
    /// Must not be called from an executor thread - a blocked reactor
    /// stalls every channel it owns, so that is rejected outright.
    pub fn await_done(&self, timeout: Option<Duration>) -> NetResult<Arc<Outcome<T>>> {
        if tls::on_executor_thread() {
            return Err(NetError::InvalidConfig(
                "blocking wait on an executor thread",
            ));
        }
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let State::Done(outcome) = &*state {
                return Ok(Arc::clone(outcome));
            }
            match deadline {
                None => state = self.inner.cond.wait(state).unwrap(),
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return Err(NetError::Timeout);
                    }
                    let (s, res) = self.inner.cond.wait_timeout(state, d - now).unwrap();
                    state = s;
                    if res.timed_out() {
                        if let State::Done(outcome) = &*state {
                            return Ok(Arc::clone(outcome));
                        }
                        return Err(NetError::Timeout);
                    }
                }
            }
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock().unwrap() {
            State::Pending(_) => "pending",
            State::Done(o) => match &**o {
                Outcome::Success(_) => "success",
                Outcome::Failure(_) => "failure",
                Outcome::Cancelled => "cancelled",
            },
        };
        write!(f, "Promise({})", state)
    }
}
