//! Reactor loop - the run body of an I/O-capable executor
//!
//! Each iteration computes a select strategy: with tasks pending, the
//! readiness check is non-blocking (never block while work waits);
//! otherwise the multiplexer blocks up to the next scheduled-task
//! deadline, with the intended wake time published so cross-thread
//! wake-ups can be elided. Ready events are dispatched to their
//! channels, then the task queue runs under the configured I/O ratio.
//!
//! A multiplexer that keeps waking up with neither events nor tasks is
//! assumed defective: after `rebuild_threshold` consecutive no-op
//! iterations it is discarded and rebuilt, re-registering every
//! still-valid channel with its interest flags preserved. A channel
//! whose re-registration fails is closed and told about it, not
//! silently dropped.

use crate::channel::Channel;
use crate::executor::Executor;
use crate::multiplexer::{Multiplexer, ReadyEvent, WAKER_TOKEN};
use crate::time;
use netloop_core::error::NetResult;
use netloop_core::id::ChannelId;
use netloop_core::state::{ExecutorState, Interest};
use netloop_core::{nl_debug, nl_error, nl_warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// Loop-local state. Only the owning reactor thread sees this; foreign
/// threads reach it indirectly by queueing tasks that call
/// `current_loop()` once they run here.
pub(crate) struct LoopContext {
    executor: Executor,
    mux: RefCell<Box<dyn Multiplexer>>,
    channels: RefCell<HashMap<u64, Channel>>,
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopContext>>> = const { RefCell::new(None) };
}

/// The reactor context of the current thread, if this thread runs one
pub(crate) fn current_loop() -> Option<Rc<LoopContext>> {
    CURRENT_LOOP.with(|c| c.borrow().clone())
}

impl LoopContext {
    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Add a channel to the multiplexer and the loop's channel table
    pub(crate) fn register_channel(
        &self,
        id: ChannelId,
        fd: std::os::unix::io::RawFd,
        interest: Interest,
        channel: Channel,
    ) -> NetResult<()> {
        self.mux.borrow_mut().register(id, fd, interest)?;
        self.channels.borrow_mut().insert(id.as_u64(), channel);
        Ok(())
    }

    pub(crate) fn update_interest(&self, id: ChannelId, interest: Interest) -> NetResult<()> {
        self.mux.borrow_mut().update(id, interest)
    }

    pub(crate) fn deregister_channel(&self, id: ChannelId) {
        if let Err(e) = self.mux.borrow_mut().deregister(id) {
            nl_warn!("deregister of channel {} failed: {}", id, e);
        }
        self.channels.borrow_mut().remove(&id.as_u64());
    }

    fn channel(&self, id: u64) -> Option<Channel> {
        self.channels.borrow().get(&id).cloned()
    }

    fn channel_snapshot(&self) -> Vec<Channel> {
        self.channels.borrow().values().cloned().collect()
    }
}

/// The loop body. Runs on the executor's worker thread until shutdown
/// is confirmed.
pub(crate) fn run_io_loop(exec: &Executor) {
    let mux = exec
        .take_multiplexer()
        .expect("I/O executor started without a multiplexer");
    let waker_fd = exec
        .io_waker()
        .expect("I/O executor started without a waker")
        .fd();

    let ctx = Rc::new(LoopContext {
        executor: exec.clone(),
        mux: RefCell::new(mux),
        channels: RefCell::new(HashMap::new()),
    });
    ctx.mux
        .borrow_mut()
        .register(WAKER_TOKEN, waker_fd, Interest::READABLE)
        .expect("failed to register the reactor waker");
    CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(Rc::clone(&ctx)));

    let io_ratio = exec.io_ratio().clamp(1, 100) as u64;
    let rebuild_threshold = exec.rebuild_threshold();
    let mut events: Vec<ReadyEvent> = Vec::new();
    let mut spurious: u32 = 0;
    let mut swept = false;

    loop {
        if let Some(waker) = exec.io_waker() {
            waker.prepare_wait();
        }

        // Select strategy: never block while work is pending.
        let wait_res = if exec.has_pending_tasks() {
            exec.record_awake();
            ctx.mux.borrow_mut().wait(&mut events, Some(Duration::ZERO))
        } else {
            let delay = exec.next_deadline_delay_ns();
            let timeout = if exec.is_shutting_down() {
                Some(Duration::from_nanos(
                    delay.unwrap_or(u64::MAX).min(exec.shutdown_nap_ns()),
                ))
            } else {
                delay.map(Duration::from_nanos)
            };
            exec.record_intended_wake(delay.map(|d| time::now_ns().saturating_add(d)));
            let r = ctx.mux.borrow_mut().wait(&mut events, timeout);
            exec.record_awake();
            r
        };

        if let Err(e) = &wait_res {
            nl_warn!("multiplexer wait failed: {}", e);
            // Keep a persistently-failing multiplexer from spinning hot;
            // the no-op iterations below will reach the rebuild path.
            std::thread::sleep(Duration::from_millis(1));
        }

        // Dispatch readiness, waker first (it only needs draining).
        let io_start = time::now_ns();
        let mut io_events = 0usize;
        for ev in events.drain(..) {
            if ev.id == WAKER_TOKEN {
                if let Some(waker) = exec.io_waker() {
                    waker.drain();
                }
                continue;
            }
            io_events += 1;
            if let Some(channel) = ctx.channel(ev.id.as_u64()) {
                channel.handle_ready(ev.readiness);
            }
        }
        let io_time = time::now_ns().saturating_sub(io_start);

        // Balance time between I/O and queued tasks.
        let ran = if io_ratio >= 100 {
            exec.run_all_tasks(None)
        } else if io_events > 0 {
            exec.run_all_tasks(Some(io_time * (100 - io_ratio) / io_ratio))
        } else {
            // No I/O this round: run one bounded batch.
            exec.run_all_tasks(Some(0))
        };

        // Premature-wakeup mitigation: consecutive iterations that
        // produce neither events nor tasks point at a broken OS
        // readiness primitive.
        if io_events == 0 && ran == 0 && !exec.is_shutting_down() {
            spurious += 1;
            if rebuild_threshold > 0 && spurious >= rebuild_threshold {
                rebuild_multiplexer(exec, &ctx, waker_fd);
                spurious = 0;
            }
        } else {
            spurious = 0;
        }

        if exec.is_shutting_down() {
            if !swept {
                close_all_channels(&ctx);
                swept = true;
            }
            if exec.confirm_shutdown() {
                exec.set_state(ExecutorState::Shutdown);
                break;
            }
        }
    }

    if !swept {
        close_all_channels(&ctx);
    }
    CURRENT_LOOP.with(|c| *c.borrow_mut() = None);
    nl_debug!("reactor loop exited");
}

/// Open a fresh multiplexer and move every still-valid registration
/// onto it. Channels that fail to re-register are closed and report the
/// failure to their own pipeline, not to the reactor.
fn rebuild_multiplexer(exec: &Executor, ctx: &Rc<LoopContext>, waker_fd: std::os::unix::io::RawFd) {
    let Some(factory) = exec.mux_factory() else {
        return;
    };
    let mut fresh = match factory() {
        Ok(m) => m,
        Err(e) => {
            nl_error!("multiplexer rebuild failed, keeping the old one: {}", e);
            return;
        }
    };
    if let Err(e) = fresh.register(WAKER_TOKEN, waker_fd, Interest::READABLE) {
        nl_error!("waker re-registration failed on rebuild: {}", e);
    }

    let channels = ctx.channel_snapshot();
    let mut moved = 0usize;
    let mut dropped: Vec<Channel> = Vec::new();
    for channel in &channels {
        let id = channel.id();
        match fresh.register(id, channel.transport_fd(), channel.interest()) {
            Ok(()) => moved += 1,
            Err(e) => {
                nl_warn!("channel {} lost in rebuild: {}", id, e);
                channel.pipeline().fire_exception_caught(e);
                dropped.push(channel.clone());
            }
        }
    }
    *ctx.mux.borrow_mut() = fresh;
    for channel in dropped {
        channel.close_on_loop(None);
    }
    nl_warn!(
        "multiplexer rebuilt after premature wakeups ({} channels moved)",
        moved
    );
}

/// Force-close every registered channel (shutdown sweep)
fn close_all_channels(ctx: &Rc<LoopContext>) {
    let channels = ctx.channel_snapshot();
    if channels.is_empty() {
        return;
    }
    nl_debug!("closing {} channels on shutdown", channels.len());
    for channel in channels {
        channel.close_on_loop(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MuxFactory;
    use crate::group::ExecutorGroup;
    use crate::testutil::NullTransport;
    use netloop_core::error::NetError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Shared state observing every multiplexer instance a factory made
    #[derive(Default)]
    struct MockState {
        instances: AtomicUsize,
        waits: AtomicUsize,
        /// (id, interest bits) seen by the newest instance
        registered: Mutex<Vec<(u64, u8)>>,
    }

    /// Multiplexer that returns empty immediately for the first
    /// `budget` waits (simulating a spinning primitive), then slows to
    /// honoring timeouts.
    struct MockMux {
        state: Arc<MockState>,
        budget: usize,
    }

    impl Multiplexer for MockMux {
        fn register(&mut self, id: ChannelId, _fd: i32, interest: Interest) -> NetResult<()> {
            self.state
                .registered
                .lock()
                .unwrap()
                .push((id.as_u64(), interest.bits()));
            Ok(())
        }

        fn update(&mut self, id: ChannelId, interest: Interest) -> NetResult<()> {
            let mut regs = self.state.registered.lock().unwrap();
            match regs.iter_mut().find(|(i, _)| *i == id.as_u64()) {
                Some(entry) => {
                    entry.1 = interest.bits();
                    Ok(())
                }
                None => Err(NetError::NotRegistered),
            }
        }

        fn deregister(&mut self, id: ChannelId) -> NetResult<()> {
            self.state
                .registered
                .lock()
                .unwrap()
                .retain(|(i, _)| *i != id.as_u64());
            Ok(())
        }

        fn wait(
            &mut self,
            out: &mut Vec<ReadyEvent>,
            timeout: Option<Duration>,
        ) -> NetResult<usize> {
            out.clear();
            let n = self.state.waits.fetch_add(1, Ordering::SeqCst);
            if n >= self.budget {
                std::thread::sleep(
                    timeout
                        .unwrap_or(Duration::from_millis(50))
                        .min(Duration::from_millis(50)),
                );
            }
            Ok(0)
        }
    }

    fn mock_factory(state: &Arc<MockState>, budget: usize) -> MuxFactory {
        let state = Arc::clone(state);
        Arc::new(move || {
            let prior = state.instances.fetch_add(1, Ordering::SeqCst);
            if prior > 0 {
                // Fresh instance: forget the old registrations so the
                // test observes the re-registration pass.
                state.registered.lock().unwrap().clear();
            }
            Ok(Box::new(MockMux {
                state: Arc::clone(&state),
                budget,
            }) as Box<dyn Multiplexer>)
        })
    }

    fn group_with_mock(state: &Arc<MockState>, threshold: u32, budget: usize) -> ExecutorGroup {
        let config = crate::config::ReactorConfig::new()
            .executors(1)
            .rebuild_threshold(threshold)
            .name_prefix("mock-loop");
        ExecutorGroup::with_multiplexer(config, mock_factory(state, budget)).unwrap()
    }

    #[test]
    fn test_rebuild_after_spurious_wakeups() {
        let state = Arc::new(MockState::default());
        let threshold = 8u32;
        // Enough immediate empty returns to cross the threshold once.
        let group = group_with_mock(&state, threshold, threshold as usize + 1);

        let channel = Channel::new(Box::new(NullTransport::new()));
        group
            .register(&channel)
            .await_done(Some(Duration::from_secs(2)))
            .unwrap();
        let id = channel.id().as_u64();

        // The loop spins through its empty-wakeup budget and rebuilds.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while state.instances.load(Ordering::SeqCst) < 2 {
            assert!(std::time::Instant::now() < deadline, "no rebuild happened");
            std::thread::yield_now();
        }
        // Exactly one rebuild: two instances ever built.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(state.instances.load(Ordering::SeqCst), 2);

        // The channel (and the waker) survived onto the new instance.
        {
            let regs = state.registered.lock().unwrap();
            assert!(regs.iter().any(|(i, _)| *i == id), "channel dropped: {:?}", regs);
            assert!(regs.iter().any(|(i, _)| *i == WAKER_TOKEN.as_u64()));
        }
        assert!(channel.is_open());

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_no_rebuild_below_threshold() {
        let state = Arc::new(MockState::default());
        // Budget far below the threshold: never rebuilds.
        let group = group_with_mock(&state, 1_000, 4);

        let channel = Channel::new(Box::new(NullTransport::new()));
        group
            .register(&channel)
            .await_done(Some(Duration::from_secs(2)))
            .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(state.instances.load(Ordering::SeqCst), 1);

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_shutdown_closes_registered_channels() {
        let state = Arc::new(MockState::default());
        let group = group_with_mock(&state, 1_000, 0);

        let channel = Channel::new(Box::new(NullTransport::new()));
        group
            .register(&channel)
            .await_done(Some(Duration::from_secs(2)))
            .unwrap();
        assert!(channel.is_open());

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
        assert!(!channel.is_open());
    }
}
