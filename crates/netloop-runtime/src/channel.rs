//! Channel - one connection, pinned to one executor
//!
//! A channel wraps an abstract `Transport` (the OS I/O primitive), a
//! pipeline, and the registration protocol. Once registered, the owning
//! executor never changes for the channel's lifetime and every state
//! mutation happens on that executor's thread; cross-thread callers go
//! through `Executor::dispatch`.
//!
//! Registration, bind and connect are asynchronous: each returns a
//! promise, and bind/connect attach themselves to the registration
//! future so they run strictly after registration succeeds even when
//! issued from a foreign thread mid-registration.

use crate::executor::Executor;
use crate::pipeline::Pipeline;
use crate::promise::{Outcome, Promise};
use crate::reactor;
use netloop_core::error::{NetError, NetResult};
use netloop_core::id::ChannelId;
use netloop_core::state::Interest;
use netloop_core::{nl_debug, nl_warn};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// The channel's underlying I/O primitive.
///
/// The engine only assumes the four readiness categories (acceptable,
/// connectable, readable, writable) and the operations below; concrete
/// TCP/UDP syscall details live with the implementor.
///
/// **Contract:** every method is non-blocking. `read`/`write` return
/// `Ok(None)` when the operation would block; `read` returns `Ok(Some(0))`
/// at end-of-stream. `connect` returns `Ok(true)` when it completed
/// immediately and `Ok(false)` when completion will be signalled through
/// connectable readiness.
pub trait Transport: Send {
    /// The fd registered with the multiplexer
    fn fd(&self) -> RawFd;

    fn connect(&mut self, addr: &SocketAddr) -> NetResult<bool> {
        let _ = addr;
        Err(NetError::Unsupported("connect"))
    }

    /// Complete a connect after connectable readiness fired.
    /// `Ok(false)` means still in progress.
    fn finish_connect(&mut self) -> NetResult<bool> {
        Err(NetError::Unsupported("finish_connect"))
    }

    fn bind(&mut self, addr: &SocketAddr) -> NetResult<()> {
        let _ = addr;
        Err(NetError::Unsupported("bind"))
    }

    /// Accept one queued connection; `Ok(None)` when none is pending
    fn accept(&mut self) -> NetResult<Option<Box<dyn Transport>>> {
        Err(NetError::Unsupported("accept"))
    }

    fn read(&mut self, buf: &mut [u8]) -> NetResult<Option<usize>> {
        let _ = buf;
        Err(NetError::Unsupported("read"))
    }

    fn write(&mut self, buf: &[u8]) -> NetResult<Option<usize>> {
        let _ = buf;
        Err(NetError::Unsupported("write"))
    }

    fn close(&mut self) -> NetResult<()>;

    /// Does readable readiness mean "connections to accept"?
    fn is_acceptor(&self) -> bool {
        false
    }

    /// Is the transport usable without a bind/connect (e.g. an accepted
    /// socket)? Such channels go active as soon as they register.
    fn is_active(&self) -> bool {
        false
    }
}

struct OutboundEntry {
    data: Vec<u8>,
    written: usize,
    promise: Promise<()>,
}

struct PendingConnect {
    promise: Promise<()>,
    timeout: Option<crate::executor::Scheduled>,
}

/// State owned by the channel's executor thread
struct ChannelCore {
    transport: Box<dyn Transport>,
    interest: Interest,
    outbound: VecDeque<OutboundEntry>,
    pending_connect: Option<PendingConnect>,
}

pub(crate) struct ChannelShared {
    id: OnceLock<ChannelId>,
    /// Owning executor, assigned exactly once during registration
    executor: OnceLock<Executor>,
    reg_future: OnceLock<Promise<()>>,
    registered: AtomicBool,
    active: AtomicBool,
    closed: AtomicBool,
    connect_timeout_ns: AtomicU64,
    pipeline: Pipeline,
    /// Executor-pinned state.
    core: UnsafeCell<ChannelCore>,
}

// Safety: `core` is only touched by the owning executor thread once an
// executor is assigned; before assignment, only the single registering
// caller reaches it (there is no other handle able to). Everything else
// in the struct is atomic or write-once.
unsafe impl Send for ChannelShared {}
unsafe impl Sync for ChannelShared {}

/// Handle to one connection. Cloning shares the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// New unregistered channel over `transport`
    pub fn new(transport: Box<dyn Transport>) -> Channel {
        let shared = Arc::new_cyclic(|weak: &Weak<ChannelShared>| ChannelShared {
            id: OnceLock::new(),
            executor: OnceLock::new(),
            reg_future: OnceLock::new(),
            registered: AtomicBool::new(false),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connect_timeout_ns: AtomicU64::new(
                Duration::from_millis(crate::config::defaults::CONNECT_TIMEOUT_MS).as_nanos()
                    as u64,
            ),
            pipeline: Pipeline::new(weak.clone()),
            core: UnsafeCell::new(ChannelCore {
                transport,
                interest: Interest::NONE,
                outbound: VecDeque::new(),
                pending_connect: None,
            }),
        });
        Channel { shared }
    }

    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Channel {
        Channel { shared }
    }

    /// Registration token; `ChannelId::NONE` until registered
    pub fn id(&self) -> ChannelId {
        self.shared.id.get().copied().unwrap_or(ChannelId::NONE)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }

    /// Owning executor once registration has assigned one
    pub fn executor(&self) -> Option<Executor> {
        self.shared.executor.get().cloned()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// The registration future, if registration was initiated
    pub fn registration_future(&self) -> Option<Promise<()>> {
        self.shared.reg_future.get().cloned()
    }

    /// Override the connect deadline (defaults to the group's config)
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.shared
            .connect_timeout_ns
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_nanos(self.shared.connect_timeout_ns.load(Ordering::Relaxed))
    }

    // ── core access (owning thread only) ─────────────────────────────

    #[inline]
    fn assert_loop(&self) {
        debug_assert!(
            self.shared
                .executor
                .get()
                .map(|ex| ex.in_event_loop())
                .unwrap_or(true),
            "channel state touched off the owning executor thread"
        );
    }

    /// Safety: see `ChannelShared` - owning executor thread only.
    #[allow(clippy::mut_from_ref)]
    unsafe fn core_mut(&self) -> &mut ChannelCore {
        &mut *self.shared.core.get()
    }

    pub(crate) fn transport_fd(&self) -> RawFd {
        self.assert_loop();
        unsafe { (*self.shared.core.get()).transport.fd() }
    }

    pub(crate) fn interest(&self) -> Interest {
        self.assert_loop();
        unsafe { (*self.shared.core.get()).interest }
    }

    fn set_interest(&self, interest: Interest) {
        self.assert_loop();
        let core = unsafe { self.core_mut() };
        if core.interest == interest {
            return;
        }
        core.interest = interest;
        if self.is_registered() {
            if let Some(lp) = reactor::current_loop() {
                if let Err(e) = lp.update_interest(self.id(), interest) {
                    nl_warn!("channel {}: interest update failed: {}", self.id(), e);
                }
            }
        }
    }

    // ── asynchronous operations ──────────────────────────────────────

    /// Bind the transport to `addr` once registration has succeeded.
    ///
    /// Must be preceded by `ExecutorGroup::register`; the operation is
    /// attached to the registration future, so it is correctly ordered
    /// even when registration is still pending on another thread.
    pub fn bind(&self, addr: SocketAddr) -> Promise<()> {
        let promise = Promise::new();
        let ch = self.clone();
        let p = promise.clone();
        self.after_registration(&promise, move || {
            ch.pipeline().invoke_bind(addr, p);
        });
        promise
    }

    /// Connect the transport to `addr` once registration has succeeded.
    ///
    /// On failure (including the connect timeout) the channel is closed;
    /// listeners observe the failure, never a silent channel.
    pub fn connect(&self, addr: SocketAddr) -> Promise<()> {
        let promise = Promise::new();
        let ch = self.clone();
        let p = promise.clone();
        self.after_registration(&promise, move || {
            ch.pipeline().invoke_connect(addr, p);
        });

        let ch = self.clone();
        promise.add_listener(move |outcome| {
            if !outcome.is_success() {
                ch.close();
            }
        });
        promise
    }

    /// Run `op` on the channel's executor strictly after registration
    /// succeeds; fail `promise` if registration failed or was never
    /// initiated. The promise executor upgrades from the fallback to the
    /// owning executor as soon as the latter is known.
    fn after_registration<F>(&self, promise: &Promise<()>, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(reg) = self.registration_future() else {
            promise.fail(NetError::NotRegistered);
            return;
        };
        if let Some(ex) = self.shared.executor.get() {
            promise.bind_executor(ex);
        }
        let ch = self.clone();
        let p = promise.clone();
        reg.add_listener(move |outcome: &Outcome<()>| {
            // Runs on the channel's executor: the registration promise
            // was upgraded before completion.
            match outcome {
                Outcome::Success(()) => {
                    if let Some(ex) = ch.shared.executor.get() {
                        p.bind_executor(ex);
                    }
                    op();
                }
                other => {
                    p.fail(other.cause().unwrap_or(NetError::ChannelClosed));
                }
            }
        });
    }

    /// Queue `data` for writing (no flush)
    pub fn write(&self, data: Vec<u8>) -> Promise<()> {
        let promise = Promise::new();
        self.dispatch_op(&promise, {
            let ch = self.clone();
            let p = promise.clone();
            move || ch.pipeline().invoke_write(Box::new(data), p)
        });
        promise
    }

    /// Queue `data` and flush the outbound buffer
    pub fn write_and_flush(&self, data: Vec<u8>) -> Promise<()> {
        let promise = Promise::new();
        self.dispatch_op(&promise, {
            let ch = self.clone();
            let p = promise.clone();
            move || {
                ch.pipeline().invoke_write(Box::new(data), p);
                ch.pipeline().invoke_flush();
            }
        });
        promise
    }

    pub fn flush(&self) {
        let ch = self.clone();
        if let Some(ex) = self.executor() {
            let _ = ex.dispatch(move || ch.pipeline().invoke_flush());
        }
    }

    /// Close the channel. Idempotent; the returned promise resolves when
    /// the close has been processed on the owning executor.
    pub fn close(&self) -> Promise<()> {
        let promise = Promise::new();
        match self.executor() {
            Some(ex) => {
                promise.bind_executor(&ex);
                let ch = self.clone();
                let p = promise.clone();
                if ex
                    .dispatch(move || ch.pipeline().invoke_close(p))
                    .is_err()
                {
                    // Executor already gone; nothing will ever touch the
                    // core again, tear down directly.
                    self.force_close();
                    promise.succeed(());
                }
            }
            None => {
                self.force_close();
                promise.succeed(());
            }
        }
        promise
    }

    fn dispatch_op<F>(&self, promise: &Promise<()>, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.executor() {
            Some(ex) => {
                promise.bind_executor(&ex);
                if let Err(e) = ex.dispatch(op) {
                    promise.fail(e);
                }
            }
            None => {
                promise.fail(NetError::NotRegistered);
            }
        }
    }

    // ── registration (loop thread) ───────────────────────────────────

    pub(crate) fn init_registration(
        &self,
        promise: &Promise<()>,
        connect_timeout: Duration,
    ) -> NetResult<()> {
        self.set_connect_timeout(connect_timeout);
        self.shared
            .reg_future
            .set(promise.clone())
            .map_err(|_| NetError::AlreadyRegistered)
    }

    /// The registration body, run on the chosen executor's thread.
    pub(crate) fn register_on_loop(&self, executor: &Executor, id: ChannelId, promise: &Promise<()>) {
        // Publish the owner first: promises created against this channel
        // upgrade off the fallback executor from here on.
        let _ = self.shared.executor.set(executor.clone());
        promise.bind_executor(executor);

        if !self.is_open() {
            promise.fail(NetError::ChannelClosed);
            return;
        }
        let Some(lp) = reactor::current_loop() else {
            self.force_close();
            promise.fail(NetError::Unsupported("register on a non-I/O executor"));
            return;
        };
        let _ = self.shared.id.set(id);

        let fd = self.transport_fd();
        if let Err(e) = lp.register_channel(id, fd, Interest::NONE, self.clone()) {
            // Not registered yet: forced close, no pipeline events.
            self.force_close();
            promise.fail(e);
            return;
        }
        self.shared.registered.store(true, Ordering::Release);
        nl_debug!("channel {} registered", id);

        // Deferred handler callbacks flush exactly once, in insertion
        // order, before any inbound event.
        self.pipeline().flush_pending_callbacks();
        self.pipeline().fire_channel_registered();

        // An already-usable transport (accepted socket, pre-bound
        // acceptor) goes active right away and starts watching.
        let (t_active, acceptor) = {
            let core = unsafe { self.core_mut() };
            (core.transport.is_active(), core.transport.is_acceptor())
        };
        if t_active {
            let interest = if acceptor {
                Interest::ACCEPTABLE
            } else {
                Interest::READABLE
            };
            self.set_interest(interest);
            self.shared.active.store(true, Ordering::Release);
            self.pipeline().fire_channel_active();
        }
        promise.succeed(());
    }

    // ── transport operations (loop thread, called via the head) ──────

    pub(crate) fn do_bind(&self, addr: &SocketAddr, promise: &Promise<()>) {
        self.assert_loop();
        if !self.is_open() {
            promise.fail(NetError::ChannelClosed);
            return;
        }
        let core = unsafe { self.core_mut() };
        match core.transport.bind(addr) {
            Ok(()) => {
                if core.transport.is_acceptor() {
                    self.set_interest(core.interest.with(Interest::ACCEPTABLE));
                    self.shared.active.store(true, Ordering::Release);
                    promise.succeed(());
                    self.pipeline().fire_channel_active();
                } else {
                    promise.succeed(());
                }
            }
            Err(e) => {
                promise.fail(e);
                self.close_on_loop(None);
            }
        }
    }

    pub(crate) fn do_connect(&self, addr: &SocketAddr, promise: &Promise<()>) {
        self.assert_loop();
        if !self.is_open() {
            promise.fail(NetError::ChannelClosed);
            return;
        }
        let core = unsafe { self.core_mut() };
        if core.pending_connect.is_some() {
            promise.fail(NetError::ConnectPending);
            return;
        }
        match core.transport.connect(addr) {
            Ok(true) => self.become_active(promise),
            Ok(false) => {
                self.set_interest(self.interest().with(Interest::CONNECTABLE));
                let timeout = self.connect_timeout();
                let scheduled = self.shared.executor.get().and_then(|ex| {
                    let ch = self.clone();
                    let p = promise.clone();
                    ex.schedule(
                        timeout,
                        Box::new(move || {
                            // Cancelled on completion; firing means the
                            // connect lost the race against the deadline.
                            if p.fail(NetError::ConnectTimeout) {
                                ch.close_on_loop(None);
                            }
                        }),
                    )
                    .ok()
                });
                let core = unsafe { self.core_mut() };
                core.pending_connect = Some(PendingConnect {
                    promise: promise.clone(),
                    timeout: scheduled,
                });
            }
            Err(e) => {
                promise.fail(e);
                self.close_on_loop(None);
            }
        }
    }

    fn become_active(&self, promise: &Promise<()>) {
        self.set_interest(
            self.interest()
                .without(Interest::CONNECTABLE)
                .with(Interest::READABLE),
        );
        self.shared.active.store(true, Ordering::Release);
        promise.succeed(());
        self.pipeline().fire_channel_active();
    }

    pub(crate) fn do_write(&self, data: Vec<u8>, promise: &Promise<()>) {
        self.assert_loop();
        if !self.is_open() {
            promise.fail(NetError::ChannelClosed);
            return;
        }
        let core = unsafe { self.core_mut() };
        core.outbound.push_back(OutboundEntry {
            data,
            written: 0,
            promise: promise.clone(),
        });
    }

    /// Write queued data until done or the transport pushes back
    pub(crate) fn do_flush(&self) {
        self.assert_loop();
        if !self.is_open() {
            return;
        }
        let core = unsafe { self.core_mut() };
        while let Some(entry) = core.outbound.front_mut() {
            match core.transport.write(&entry.data[entry.written..]) {
                Ok(Some(n)) => {
                    entry.written += n;
                    if entry.written >= entry.data.len() {
                        let entry = core.outbound.pop_front().expect("front checked");
                        entry.promise.succeed(());
                    }
                }
                Ok(None) => {
                    self.set_interest(self.interest().with(Interest::WRITABLE));
                    return;
                }
                Err(e) => {
                    let entry = core.outbound.pop_front().expect("front checked");
                    entry.promise.fail(e.clone());
                    self.pipeline().fire_exception_caught(e);
                    self.close_on_loop(None);
                    return;
                }
            }
        }
        self.set_interest(self.interest().without(Interest::WRITABLE));
    }

    // ── readiness dispatch (loop thread) ─────────────────────────────

    /// Process one readiness notification. Connect completion runs
    /// before writes, writes before reads/accepts.
    pub(crate) fn handle_ready(&self, readiness: Interest) {
        if !self.is_open() {
            return;
        }
        if readiness.contains(Interest::CONNECTABLE) {
            self.finish_connect_event();
            if !self.is_open() {
                return;
            }
        }
        if readiness.contains(Interest::WRITABLE) {
            self.do_flush();
            if !self.is_open() {
                return;
            }
        }
        if readiness.contains(Interest::ACCEPTABLE) {
            self.accept_ready();
        } else if readiness.contains(Interest::READABLE) {
            self.read_ready();
        }
    }

    fn finish_connect_event(&self) {
        let core = unsafe { self.core_mut() };
        let Some(pending) = core.pending_connect.take() else {
            return;
        };
        match core.transport.finish_connect() {
            Ok(true) => {
                if let Some(t) = &pending.timeout {
                    t.cancel();
                }
                self.become_active(&pending.promise);
            }
            Ok(false) => {
                let core = unsafe { self.core_mut() };
                core.pending_connect = Some(pending);
            }
            Err(e) => {
                if let Some(t) = &pending.timeout {
                    t.cancel();
                }
                pending.promise.fail(e);
                self.close_on_loop(None);
            }
        }
    }

    /// Accept as many queued connections as the transport will give us;
    /// each new transport travels up the pipeline as a read.
    fn accept_ready(&self) {
        let mut accepted = 0usize;
        loop {
            let core = unsafe { self.core_mut() };
            match core.transport.accept() {
                Ok(Some(child)) => {
                    accepted += 1;
                    self.pipeline().fire_channel_read(Box::new(child));
                }
                Ok(None) => break,
                Err(e) => {
                    self.pipeline().fire_exception_caught(e);
                    break;
                }
            }
            if accepted >= 16 {
                break;
            }
        }
        if accepted > 0 {
            self.pipeline().fire_channel_read_complete();
        }
    }

    fn read_ready(&self) {
        let mut reads = 0usize;
        loop {
            let mut buf = vec![0u8; 4096];
            let core = unsafe { self.core_mut() };
            match core.transport.read(&mut buf) {
                Ok(Some(0)) => {
                    // Peer closed
                    if reads > 0 {
                        self.pipeline().fire_channel_read_complete();
                    }
                    self.close_on_loop(None);
                    return;
                }
                Ok(Some(n)) => {
                    buf.truncate(n);
                    reads += 1;
                    self.pipeline().fire_channel_read(Box::new(buf));
                }
                Ok(None) => break,
                Err(e) => {
                    self.pipeline().fire_exception_caught(e);
                    self.close_on_loop(None);
                    return;
                }
            }
            // Leave the loop fair to its other channels.
            if reads >= 16 {
                break;
            }
        }
        if reads > 0 {
            self.pipeline().fire_channel_read_complete();
        }
    }

    // ── teardown ─────────────────────────────────────────────────────

    /// Normal close on the owning thread: deregisters, fires inactive,
    /// destroys the handler chain.
    pub(crate) fn close_on_loop(&self, promise: Option<Promise<()>>) {
        self.assert_loop();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            if let Some(p) = promise {
                p.succeed(());
            }
            return;
        }
        let id = self.id();
        let core = unsafe { self.core_mut() };
        if let Some(pending) = core.pending_connect.take() {
            if let Some(t) = &pending.timeout {
                t.cancel();
            }
            pending.promise.fail(NetError::ChannelClosed);
        }
        while let Some(entry) = core.outbound.pop_front() {
            entry.promise.fail(NetError::ChannelClosed);
        }
        if self.shared.registered.load(Ordering::Acquire) {
            if let Some(lp) = reactor::current_loop() {
                lp.deregister_channel(id);
            }
        }
        if let Err(e) = core.transport.close() {
            nl_warn!("channel {}: transport close failed: {}", id, e);
        }
        let was_active = self.shared.active.swap(false, Ordering::AcqRel);
        nl_debug!("channel {} closed", id);
        if was_active {
            self.pipeline().fire_channel_inactive();
        }
        self.pipeline().destroy();
        if let Some(p) = promise {
            p.succeed(());
        }
    }

    /// Forced close for a channel that never finished registering: no
    /// pipeline events are raised, because nothing is listening yet.
    pub(crate) fn force_close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Safety: no executor is processing this channel (registration
        // never completed), so the registering caller is the only access.
        let core = unsafe { &mut *self.shared.core.get() };
        if let Some(pending) = core.pending_connect.take() {
            if let Some(t) = &pending.timeout {
                t.cancel();
            }
            pending.promise.fail(NetError::ChannelClosed);
        }
        while let Some(entry) = core.outbound.pop_front() {
            entry.promise.fail(NetError::ChannelClosed);
        }
        if let Err(e) = core.transport.close() {
            nl_warn!("forced close: transport close failed: {}", e);
        }
    }

    pub(crate) fn shared_weak(&self) -> Weak<ChannelShared> {
        Arc::downgrade(&self.shared)
    }
}

impl ChannelShared {
    pub(crate) fn executor(&self) -> Option<&Executor> {
        self.executor.get()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Channel(id={}, registered={}, active={}, open={})",
            self.id(),
            self.is_registered(),
            self.is_active(),
            self.is_open()
        )
    }
}
