//! Executor group - a fixed set of reactors plus a chooser
//!
//! The group creates its executors eagerly (a failing member rolls the
//! created siblings back and fails construction), assigns channels to
//! members round-robin, and aggregates the children's termination
//! futures into one.

use crate::channel::Channel;
use crate::config::ReactorConfig;
use crate::executor::{Executor, MuxFactory};
use crate::multiplexer;
use crate::promise::Promise;
use netloop_core::error::NetResult;
use netloop_core::id::IdGen;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Selection strategy for assigning channels to members.
///
/// Power-of-two sizes mask the shared counter; any other size takes the
/// counter modulo the length. Both wrap with unsigned arithmetic, so
/// counter wrap-around stays bias-free.
enum Chooser {
    PowerOfTwo { counter: AtomicU64, mask: u64 },
    Generic { counter: AtomicU64, len: u64 },
}

impl Chooser {
    fn new(len: usize) -> Chooser {
        let len = len as u64;
        if len.is_power_of_two() {
            Chooser::PowerOfTwo {
                counter: AtomicU64::new(0),
                mask: len - 1,
            }
        } else {
            Chooser::Generic {
                counter: AtomicU64::new(0),
                len,
            }
        }
    }

    fn next_index(&self) -> usize {
        match self {
            Chooser::PowerOfTwo { counter, mask } => {
                (counter.fetch_add(1, Ordering::Relaxed) & mask) as usize
            }
            Chooser::Generic { counter, len } => {
                (counter.fetch_add(1, Ordering::Relaxed) % len) as usize
            }
        }
    }
}

struct GroupInner {
    executors: Vec<Executor>,
    chooser: Chooser,
    ids: IdGen,
    termination: Promise<()>,
    remaining: Arc<AtomicUsize>,
    connect_timeout: Duration,
}

/// A fixed pool of I/O executors. Cloning shares the pool.
#[derive(Clone)]
pub struct ExecutorGroup {
    inner: Arc<GroupInner>,
}

impl ExecutorGroup {
    /// Build a group with the platform multiplexer
    pub fn new(config: ReactorConfig) -> NetResult<ExecutorGroup> {
        Self::with_multiplexer(config, Arc::new(multiplexer::platform_multiplexer))
    }

    /// Build a group with a custom multiplexer factory (tests, exotic
    /// platforms). Member creation failure is setup-fatal: already
    /// created siblings are shut down and the error is returned.
    pub fn with_multiplexer(config: ReactorConfig, factory: MuxFactory) -> NetResult<ExecutorGroup> {
        config.validate()?;
        let n = config.executors;
        let mut executors = Vec::with_capacity(n);
        for i in 0..n {
            let name = format!("{}-{}", config.name_prefix, i);
            match Executor::new_io(
                &name,
                config.task_queue_cap,
                config.io_ratio,
                config.rebuild_threshold,
                Arc::clone(&factory),
            ) {
                Ok(executor) => executors.push(executor),
                Err(e) => {
                    for sibling in &executors {
                        sibling.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
                    }
                    return Err(e);
                }
            }
        }

        // Aggregate termination: each child's termination future ticks
        // the shared counter down; the last one fulfils the group's.
        let termination: Promise<()> = Promise::new();
        let remaining = Arc::new(AtomicUsize::new(n));
        for executor in &executors {
            let remaining = Arc::clone(&remaining);
            let termination = termination.clone();
            executor.termination_future().add_listener(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    termination.succeed(());
                }
            });
        }

        Ok(ExecutorGroup {
            inner: Arc::new(GroupInner {
                executors,
                chooser: Chooser::new(n),
                ids: IdGen::new(),
                termination,
                remaining,
                connect_timeout: config.connect_timeout,
            }),
        })
    }

    /// The next executor per the chooser. Safe under concurrent calls
    /// from arbitrary threads.
    pub fn next(&self) -> &Executor {
        &self.inner.executors[self.inner.chooser.next_index()]
    }

    pub fn executors(&self) -> &[Executor] {
        &self.inner.executors
    }

    pub fn len(&self) -> usize {
        self.inner.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.executors.is_empty()
    }

    /// Cache key for per-(pipeline, group) executor pinning
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Assign `channel` to a member executor and register it with that
    /// executor's multiplexer. Asynchronous: the actual registration is
    /// performed on the owning thread (or inline when the caller is
    /// already there); the promise resolves once the channel is bound.
    pub fn register(&self, channel: &Channel) -> Promise<()> {
        let promise: Promise<()> = Promise::new();
        if let Err(e) = channel.init_registration(&promise, self.inner.connect_timeout) {
            let dup = Promise::new();
            dup.fail(e);
            return dup;
        }
        let executor = self.next().clone();
        let id = self.inner.ids.next_channel_id();

        let ch = channel.clone();
        let ex = executor.clone();
        let p = promise.clone();
        let submitted = executor.dispatch(move || ch.register_on_loop(&ex, id, &p));
        if let Err(e) = submitted {
            // The chosen executor would not take the task: close the
            // half-made channel without raising events (no pipeline is
            // listening yet) and report through the promise, which still
            // runs its listeners on the process-wide fallback.
            channel.force_close();
            promise.fail(e);
        }
        promise
    }

    /// Forward graceful shutdown to every member; the returned future
    /// fires only after every child has terminated.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        for executor in &self.inner.executors {
            executor.shutdown_gracefully(quiet_period, timeout);
        }
        self.termination_future()
    }

    pub fn termination_future(&self) -> Promise<()> {
        self.inner.termination.clone()
    }
}

impl std::fmt::Debug for ExecutorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutorGroup(len={}, remaining={})",
            self.inner.executors.len(),
            self.inner.remaining.load(Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netloop_core::error::NetError;

    fn idle_group(n: usize) -> ExecutorGroup {
        // Mock multiplexer so no OS resources are consumed.
        let factory: MuxFactory = Arc::new(|| {
            Ok(Box::new(crate::testutil::IdleMux::new()) as Box<dyn crate::multiplexer::Multiplexer>)
        });
        let config = ReactorConfig::new()
            .executors(n)
            .name_prefix("group-test");
        ExecutorGroup::with_multiplexer(config, factory).unwrap()
    }

    #[test]
    fn test_chooser_power_of_two_fairness() {
        let group = idle_group(4);
        let mut indices = Vec::new();
        for _ in 0..20 {
            let ex = group.next();
            let idx = group
                .executors()
                .iter()
                .position(|e| e == ex)
                .unwrap();
            indices.push(idx);
        }
        let expected: Vec<usize> = (0..20).map(|i| i % 4).collect();
        assert_eq!(indices, expected);
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn test_chooser_modulo_fairness() {
        let group = idle_group(3);
        let mut indices = Vec::new();
        for _ in 0..21 {
            let ex = group.next();
            let idx = group
                .executors()
                .iter()
                .position(|e| e == ex)
                .unwrap();
            indices.push(idx);
        }
        let expected: Vec<usize> = (0..21).map(|i| i % 3).collect();
        assert_eq!(indices, expected);
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn test_chooser_counter_wrap_is_unsigned() {
        // Force the counter near wrap-around and check no negative-bias
        // appears (the abs-of-modulo bug this replaces).
        let chooser = Chooser::new(3);
        if let Chooser::Generic { counter, .. } = &chooser {
            counter.store(u64::MAX - 1, Ordering::Relaxed);
        }
        let a = chooser.next_index();
        let b = chooser.next_index();
        let c = chooser.next_index();
        assert_eq!(a, ((u64::MAX - 1) % 3) as usize);
        assert_eq!(b, (u64::MAX % 3) as usize);
        assert_eq!(c, 0); // wrapped to 0
    }

    #[test]
    fn test_member_creation_failure_rolls_back() {
        use std::sync::atomic::AtomicUsize;
        let built = Arc::new(AtomicUsize::new(0));
        let b = Arc::clone(&built);
        let factory: MuxFactory = Arc::new(move || {
            if b.fetch_add(1, Ordering::SeqCst) == 2 {
                Err(NetError::Os(23))
            } else {
                Ok(Box::new(crate::testutil::IdleMux::new())
                    as Box<dyn crate::multiplexer::Multiplexer>)
            }
        });
        let config = ReactorConfig::new().executors(4).name_prefix("rollback");
        let err = ExecutorGroup::with_multiplexer(config, factory).unwrap_err();
        assert_eq!(err, NetError::Os(23));
    }

    #[test]
    fn test_group_termination_waits_for_all_children() {
        let group = idle_group(3);
        // Start every member.
        for ex in group.executors() {
            ex.execute(Box::new(|| {})).unwrap();
        }
        // Shut down members one by one, in reverse order; the group
        // future must not fire until the last one is gone.
        let fut = group.termination_future();
        let members: Vec<Executor> = group.executors().to_vec();
        for (i, ex) in members.iter().enumerate().rev() {
            assert!(!fut.is_done(), "group future fired early");
            ex.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
                .await_done(Some(Duration::from_secs(5)))
                .unwrap();
            if i == 0 {
                break;
            }
        }
        fut.await_done(Some(Duration::from_secs(5))).unwrap();
        assert!(fut.is_success());
    }

    #[test]
    fn test_double_register_rejected() {
        let group = idle_group(1);
        let channel = Channel::new(Box::new(crate::testutil::NullTransport::new()));
        group
            .register(&channel)
            .await_done(Some(Duration::from_secs(2)))
            .unwrap();
        let second = group.register(&channel);
        assert_eq!(second.cause(), Some(NetError::AlreadyRegistered));
        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }
}
