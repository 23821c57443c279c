//! Pipeline - the ordered handler chain of one channel
//!
//! A doubly-linked chain of handler contexts between two sentinels: the
//! head performs the real transport operation for every outbound call,
//! the tail is the terminal inbound stop (logs whatever nobody
//! consumed). Inbound events travel head -> tail, outbound operations
//! tail -> head.
//!
//! Links live in a slot arena behind one mutation lock; contexts keep
//! their slot's links after removal, so an event queued against a
//! removed context still finds its way into the live chain. Lifecycle
//! callbacks for handlers added before the channel is registered are
//! deferred onto a pending list and flushed exactly once, in insertion
//! order, when registration completes.

use crate::channel::{Channel, ChannelShared};
use crate::executor::{fallback_executor, Executor};
use crate::group::ExecutorGroup;
use crate::promise::Promise;
use netloop_core::error::{NetError, NetResult};
use netloop_core::{nl_debug, nl_warn};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Message traversing the pipeline. Opaque to the engine: byte buffers,
/// accepted child transports, anything a codec produces.
pub type Msg = Box<dyn Any + Send>;

/// A pipeline handler.
///
/// One trait covers both directions: inbound events default to
/// forwarding toward the tail, outbound operations toward the head, so
/// a handler only overrides what it cares about. Lifecycle and inbound
/// callbacks report failure by returning `Err`, which is routed into
/// the exception path.
pub trait Handler: Send + Sync + 'static {
    fn handler_added(&self, ctx: &Context) -> NetResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn handler_removed(&self, ctx: &Context) -> NetResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn exception_caught(&self, ctx: &Context, cause: NetError) {
        ctx.fire_exception_caught(cause);
    }

    fn channel_registered(&self, ctx: &Context) -> NetResult<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_active(&self, ctx: &Context) -> NetResult<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Context) -> NetResult<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &Context, msg: Msg) -> NetResult<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Context) -> NetResult<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    // Outbound operations (forward toward the head by default)

    fn bind(&self, ctx: &Context, addr: &SocketAddr, promise: &Promise<()>) -> NetResult<()> {
        ctx.bind(addr, promise.clone());
        Ok(())
    }

    fn connect(&self, ctx: &Context, addr: &SocketAddr, promise: &Promise<()>) -> NetResult<()> {
        ctx.connect(addr, promise.clone());
        Ok(())
    }

    fn write(&self, ctx: &Context, msg: Msg, promise: &Promise<()>) -> NetResult<()> {
        ctx.write(msg, promise.clone());
        Ok(())
    }

    fn flush(&self, ctx: &Context) -> NetResult<()> {
        ctx.flush();
        Ok(())
    }

    fn close(&self, ctx: &Context, promise: &Promise<()>) -> NetResult<()> {
        ctx.close(promise.clone());
        Ok(())
    }
}

// Handler lifecycle states
const STATE_INIT: u8 = 0;
const STATE_ADDED: u8 = 1;
const STATE_REMOVED: u8 = 2;

struct CtxInner {
    name: String,
    handler: Arc<dyn Handler>,
    pipeline: Weak<PipelineShared>,
    /// Executor pinned at add time (alternate-group handlers)
    pinned: Option<Executor>,
    slot: usize,
    state: AtomicU8,
}

/// The node wrapping one handler inside a pipeline, carrying its
/// executor binding. Cloning is cheap (shared).
#[derive(Clone)]
pub struct Context {
    inner: Arc<CtxInner>,
}

struct Node {
    ctx: Context,
    prev: usize,
    next: usize,
    removed: bool,
}

enum PendingOp {
    Added(Context),
    Removed(Context),
}

struct PipelineInner {
    nodes: Vec<Node>,
    head: usize,
    tail: usize,
    /// Lifecycle callbacks deferred until first registration
    pending: Vec<PendingOp>,
    callbacks_flushed: bool,
}

pub(crate) struct PipelineShared {
    channel: Weak<ChannelShared>,
    inner: Mutex<PipelineInner>,
    /// One concrete executor per alternate group, chosen once per
    /// (pipeline, group) pair so contexts sharing a group keep a fixed
    /// total order.
    exec_cache: Mutex<Vec<(usize, Executor)>>,
}

/// The handler chain attached to one channel. Cloning shares the chain.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<PipelineShared>,
}

const HEAD: usize = 0;
const TAIL: usize = 1;

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelShared>) -> Pipeline {
        let shared = Arc::new_cyclic(|weak: &Weak<PipelineShared>| {
            let head_ctx = Context {
                inner: Arc::new(CtxInner {
                    name: "#head".to_string(),
                    handler: Arc::new(HeadHandler),
                    pipeline: weak.clone(),
                    pinned: None,
                    slot: HEAD,
                    state: AtomicU8::new(STATE_ADDED),
                }),
            };
            let tail_ctx = Context {
                inner: Arc::new(CtxInner {
                    name: "#tail".to_string(),
                    handler: Arc::new(TailHandler),
                    pipeline: weak.clone(),
                    pinned: None,
                    slot: TAIL,
                    state: AtomicU8::new(STATE_ADDED),
                }),
            };
            PipelineShared {
                channel,
                inner: Mutex::new(PipelineInner {
                    nodes: vec![
                        Node {
                            ctx: head_ctx,
                            prev: usize::MAX,
                            next: TAIL,
                            removed: false,
                        },
                        Node {
                            ctx: tail_ctx,
                            prev: HEAD,
                            next: usize::MAX,
                            removed: false,
                        },
                    ],
                    head: HEAD,
                    tail: TAIL,
                    pending: Vec::new(),
                    callbacks_flushed: false,
                }),
                exec_cache: Mutex::new(Vec::new()),
            }
        });
        Pipeline { shared }
    }

    /// The owning channel, while it is alive
    pub fn channel(&self) -> Option<Channel> {
        self.shared.channel.upgrade().map(Channel::from_shared)
    }

    // ── mutation ─────────────────────────────────────────────────────

    pub fn add_first(&self, name: &str, handler: Box<dyn Handler>) -> NetResult<()> {
        self.add_with(name, Arc::from(handler), None, Anchor::First)
    }

    pub fn add_last(&self, name: &str, handler: Box<dyn Handler>) -> NetResult<()> {
        self.add_with(name, Arc::from(handler), None, Anchor::Last)
    }

    pub fn add_before(&self, base: &str, name: &str, handler: Box<dyn Handler>) -> NetResult<()> {
        self.add_with(
            name,
            Arc::from(handler),
            None,
            Anchor::Before(base.to_string()),
        )
    }

    pub fn add_after(&self, base: &str, name: &str, handler: Box<dyn Handler>) -> NetResult<()> {
        self.add_with(
            name,
            Arc::from(handler),
            None,
            Anchor::After(base.to_string()),
        )
    }

    /// Add a handler whose callbacks run on an executor from `group`
    /// instead of the channel's. The concrete executor is chosen once
    /// per (pipeline, group) pair and cached.
    pub fn add_last_in(
        &self,
        group: &ExecutorGroup,
        name: &str,
        handler: Box<dyn Handler>,
    ) -> NetResult<()> {
        let executor = self.executor_for_group(group);
        self.add_with(name, Arc::from(handler), Some(executor), Anchor::Last)
    }

    fn executor_for_group(&self, group: &ExecutorGroup) -> Executor {
        let key = group.key();
        let mut cache = self.shared.exec_cache.lock().unwrap();
        if let Some((_, ex)) = cache.iter().find(|(k, _)| *k == key) {
            return ex.clone();
        }
        let ex = group.next().clone();
        cache.push((key, ex.clone()));
        ex
    }

    fn add_with(
        &self,
        name: &str,
        handler: Arc<dyn Handler>,
        pinned: Option<Executor>,
        anchor: Anchor,
    ) -> NetResult<()> {
        let (ctx, deferred) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.find_live(name).is_some() {
                return Err(NetError::DuplicateHandler(name.to_string()));
            }
            let after = match &anchor {
                Anchor::First => inner.head,
                Anchor::Last => inner.nodes[inner.tail].prev,
                Anchor::Before(base) => {
                    let slot = inner
                        .find_live(base)
                        .ok_or_else(|| NetError::HandlerNotFound(base.clone()))?;
                    inner.nodes[slot].prev
                }
                Anchor::After(base) => inner
                    .find_live(base)
                    .ok_or_else(|| NetError::HandlerNotFound(base.clone()))?,
            };
            let slot = inner.nodes.len();
            let ctx = Context {
                inner: Arc::new(CtxInner {
                    name: name.to_string(),
                    handler,
                    pipeline: Arc::downgrade(&self.shared),
                    pinned,
                    slot,
                    state: AtomicU8::new(STATE_INIT),
                }),
            };
            let next = inner.nodes[after].next;
            inner.nodes.push(Node {
                ctx: ctx.clone(),
                prev: after,
                next,
                removed: false,
            });
            inner.nodes[after].next = slot;
            inner.nodes[next].prev = slot;

            let deferred = !inner.callbacks_flushed;
            if deferred {
                inner.pending.push(PendingOp::Added(ctx.clone()));
            }
            (ctx, deferred)
        };
        if !deferred {
            self.invoke_added(ctx);
        }
        Ok(())
    }

    /// Remove the handler named `name`; its removed-callback follows the
    /// same defer / inline / cross-thread rules as addition.
    pub fn remove(&self, name: &str) -> NetResult<()> {
        let (ctx, deferred) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let slot = inner
                .find_live(name)
                .ok_or_else(|| NetError::HandlerNotFound(name.to_string()))?;
            let ctx = inner.unlink(slot);
            let deferred = !inner.callbacks_flushed;
            if deferred {
                inner.pending.push(PendingOp::Removed(ctx.clone()));
            }
            (ctx, deferred)
        };
        if !deferred {
            self.invoke_removed(ctx);
        }
        Ok(())
    }

    /// Replace `old_name` with a new handler in place. The new handler's
    /// added-callback runs before the old one's removed-callback, so the
    /// replacement is ready for any event the removal triggers.
    pub fn replace(
        &self,
        old_name: &str,
        new_name: &str,
        handler: Box<dyn Handler>,
    ) -> NetResult<()> {
        let handler: Arc<dyn Handler> = Arc::from(handler);
        let (new_ctx, old_ctx, deferred) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let old_slot = inner
                .find_live(old_name)
                .ok_or_else(|| NetError::HandlerNotFound(old_name.to_string()))?;
            if new_name != old_name && inner.find_live(new_name).is_some() {
                return Err(NetError::DuplicateHandler(new_name.to_string()));
            }
            let slot = inner.nodes.len();
            let new_ctx = Context {
                inner: Arc::new(CtxInner {
                    name: new_name.to_string(),
                    handler,
                    pipeline: Arc::downgrade(&self.shared),
                    pinned: None,
                    slot,
                    state: AtomicU8::new(STATE_INIT),
                }),
            };
            let prev = inner.nodes[old_slot].prev;
            let next = inner.nodes[old_slot].next;
            inner.nodes.push(Node {
                ctx: new_ctx.clone(),
                prev,
                next,
                removed: false,
            });
            inner.nodes[prev].next = slot;
            inner.nodes[next].prev = slot;
            let old_ctx = {
                let node = &mut inner.nodes[old_slot];
                node.removed = true;
                node.ctx.clone()
            };
            let deferred = !inner.callbacks_flushed;
            if deferred {
                inner.pending.push(PendingOp::Added(new_ctx.clone()));
                inner.pending.push(PendingOp::Removed(old_ctx.clone()));
            }
            (new_ctx, old_ctx, deferred)
        };
        if !deferred {
            self.invoke_added(new_ctx);
            self.invoke_removed(old_ctx);
        }
        Ok(())
    }

    /// Context of the live handler named `name`
    pub fn context(&self, name: &str) -> Option<Context> {
        let inner = self.shared.inner.lock().unwrap();
        inner.find_live(name).map(|slot| inner.nodes[slot].ctx.clone())
    }

    /// Names of live handlers, head to tail (sentinels excluded)
    pub fn names(&self) -> Vec<String> {
        let inner = self.shared.inner.lock().unwrap();
        let mut names = Vec::new();
        let mut slot = inner.nodes[inner.head].next;
        while slot != inner.tail {
            let node = &inner.nodes[slot];
            names.push(node.ctx.inner.name.clone());
            slot = node.next;
        }
        names
    }

    // ── deferred callbacks ───────────────────────────────────────────

    /// Flush callbacks deferred before registration, exactly once, in
    /// original insertion order. Runs on the channel's executor during
    /// registration.
    pub(crate) fn flush_pending_callbacks(&self) {
        let ops = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.callbacks_flushed {
                return;
            }
            inner.callbacks_flushed = true;
            std::mem::take(&mut inner.pending)
        };
        for op in ops {
            match op {
                PendingOp::Added(ctx) => self.invoke_added(ctx),
                PendingOp::Removed(ctx) => self.invoke_removed(ctx),
            }
        }
    }

    /// Three-way branch shared by add/remove: the callback runs inline
    /// when the context's executor is the current thread, otherwise it
    /// is queued there. (The deferred branch was handled by the caller.)
    fn invoke_added(&self, ctx: Context) {
        let executor = ctx.executor();
        if executor.in_event_loop() {
            self.call_added(ctx);
        } else {
            let pipeline = self.clone();
            executor.execute_or_run(Box::new(move || pipeline.call_added(ctx)));
        }
    }

    fn invoke_removed(&self, ctx: Context) {
        let executor = ctx.executor();
        if executor.in_event_loop() {
            call_removed(&ctx);
        } else {
            executor.execute_or_run(Box::new(move || call_removed(&ctx)));
        }
    }

    fn call_added(&self, ctx: Context) {
        if ctx
            .inner
            .state
            .compare_exchange(
                STATE_INIT,
                STATE_ADDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let handler = Arc::clone(&ctx.inner.handler);
        if let Err(e) = handler.handler_added(&ctx) {
            let name = ctx.name().to_string();
            nl_warn!("handler {} failed in handler_added: {}", name, e);
            // A handler that failed to install is forcibly removed; if
            // even that fails, raise the distinct double failure.
            match self.remove_context(&ctx) {
                Ok(()) => self.fire_exception_caught(NetError::Handler(format!(
                    "{}: handler_added failed: {}",
                    name, e
                ))),
                Err(_) => self.fire_exception_caught(NetError::RemovalAlsoFailed(name)),
            }
        }
    }

    fn remove_context(&self, ctx: &Context) -> NetResult<()> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            let slot = ctx.inner.slot;
            if slot >= inner.nodes.len() || inner.nodes[slot].removed {
                return Err(NetError::HandlerNotFound(ctx.name().to_string()));
            }
            inner.unlink(slot);
        }
        call_removed(ctx);
        Ok(())
    }

    /// Tear down the whole chain on channel close: every live user
    /// handler is unlinked and sees its removed-callback, walking from
    /// the tail back toward the head.
    pub(crate) fn destroy(&self) {
        let ctxs = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.callbacks_flushed {
                // Never registered: no added-callback ever ran, so no
                // removed-callback is owed.
                inner.pending.clear();
            }
            let mut ctxs = Vec::new();
            let mut slot = inner.nodes[inner.tail].prev;
            while slot != inner.head {
                ctxs.push(inner.nodes[slot].ctx.clone());
                slot = inner.nodes[slot].prev;
            }
            for ctx in &ctxs {
                let s = ctx.inner.slot;
                inner.unlink(s);
            }
            if !inner.callbacks_flushed {
                ctxs.clear();
            }
            ctxs
        };
        for ctx in ctxs {
            self.invoke_removed(ctx);
        }
    }

    // ── event entry points (called by the channel/reactor) ───────────

    pub(crate) fn fire_channel_registered(&self) {
        self.head_ctx().invoke_channel_registered();
    }

    pub(crate) fn fire_channel_active(&self) {
        self.head_ctx().invoke_channel_active();
    }

    pub(crate) fn fire_channel_inactive(&self) {
        self.head_ctx().invoke_channel_inactive();
    }

    pub fn fire_channel_read(&self, msg: Msg) {
        self.head_ctx().invoke_channel_read(msg);
    }

    pub fn fire_channel_read_complete(&self) {
        self.head_ctx().invoke_channel_read_complete();
    }

    pub fn fire_exception_caught(&self, cause: NetError) {
        self.head_ctx().invoke_exception_caught(cause);
    }

    // ── outbound entry points (start at the tail) ────────────────────

    pub(crate) fn invoke_bind(&self, addr: SocketAddr, promise: Promise<()>) {
        self.tail_ctx().invoke_bind(addr, promise);
    }

    pub(crate) fn invoke_connect(&self, addr: SocketAddr, promise: Promise<()>) {
        self.tail_ctx().invoke_connect(addr, promise);
    }

    pub(crate) fn invoke_write(&self, msg: Msg, promise: Promise<()>) {
        self.tail_ctx().invoke_write(msg, promise);
    }

    pub(crate) fn invoke_flush(&self) {
        self.tail_ctx().invoke_flush();
    }

    pub(crate) fn invoke_close(&self, promise: Promise<()>) {
        self.tail_ctx().invoke_close(promise);
    }

    fn head_ctx(&self) -> Context {
        let inner = self.shared.inner.lock().unwrap();
        inner.nodes[inner.head].ctx.clone()
    }

    fn tail_ctx(&self) -> Context {
        let inner = self.shared.inner.lock().unwrap();
        inner.nodes[inner.tail].ctx.clone()
    }
}

enum Anchor {
    First,
    Last,
    Before(String),
    After(String),
}

impl PipelineInner {
    fn find_live(&self, name: &str) -> Option<usize> {
        let mut slot = self.nodes[self.head].next;
        while slot != self.tail {
            let node = &self.nodes[slot];
            if !node.removed && node.ctx.inner.name == name {
                return Some(slot);
            }
            slot = node.next;
        }
        None
    }

    /// Unlink a node from the live chain. The node keeps its own links
    /// so traversal from an already-removed context still lands in the
    /// live chain.
    fn unlink(&mut self, slot: usize) -> Context {
        let (prev, next) = {
            let node = &mut self.nodes[slot];
            node.removed = true;
            (node.prev, node.next)
        };
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[slot].ctx.clone()
    }
}

fn call_removed(ctx: &Context) {
    let old = ctx.inner.state.swap(STATE_REMOVED, Ordering::AcqRel);
    if old != STATE_ADDED {
        return;
    }
    let handler = Arc::clone(&ctx.inner.handler);
    if let Err(e) = handler.handler_removed(ctx) {
        nl_warn!("handler {} failed in handler_removed: {}", ctx.name(), e);
        if let Some(pipeline) = ctx.pipeline() {
            pipeline.fire_exception_caught(NetError::Handler(format!(
                "{}: handler_removed failed: {}",
                ctx.name(),
                e
            )));
        }
    }
}

// ── Context ──────────────────────────────────────────────────────────

impl Context {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pipeline(&self) -> Option<Pipeline> {
        self.inner.pipeline.upgrade().map(|shared| Pipeline { shared })
    }

    pub fn channel(&self) -> Option<Channel> {
        self.pipeline().and_then(|p| p.channel())
    }

    /// The executor this context's callbacks run on: the pinned
    /// alternate if one was chosen at add time, else the channel's
    /// executor, else the process-wide fallback (unregistered).
    pub fn executor(&self) -> Executor {
        if let Some(ex) = &self.inner.pinned {
            return ex.clone();
        }
        if let Some(shared) = self.inner.pipeline.upgrade() {
            if let Some(channel) = shared.channel.upgrade() {
                if let Some(ex) = channel.executor() {
                    return ex.clone();
                }
            }
        }
        fallback_executor().clone()
    }

    /// A context takes part in event delivery only between the start of
    /// its added-callback and its removal; outside that window events
    /// pass through to its neighbors.
    fn skip_invoke(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != STATE_ADDED
    }

    fn next_ctx(&self) -> Option<Context> {
        let shared = self.inner.pipeline.upgrade()?;
        let inner = shared.inner.lock().unwrap();
        let next = inner.nodes.get(self.inner.slot)?.next;
        inner.nodes.get(next).map(|n| n.ctx.clone())
    }

    fn prev_ctx(&self) -> Option<Context> {
        let shared = self.inner.pipeline.upgrade()?;
        let inner = shared.inner.lock().unwrap();
        let prev = inner.nodes.get(self.inner.slot)?.prev;
        inner.nodes.get(prev).map(|n| n.ctx.clone())
    }

    /// Run `f` on this context's executor: inline when already there,
    /// queued otherwise.
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self.executor();
        if executor.in_event_loop() {
            f();
        } else {
            executor.execute_or_run(Box::new(f));
        }
    }

    // ── inbound propagation ──────────────────────────────────────────

    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.next_ctx() {
            next.invoke_channel_registered();
        }
    }

    pub fn fire_channel_active(&self) {
        if let Some(next) = self.next_ctx() {
            next.invoke_channel_active();
        }
    }

    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.next_ctx() {
            next.invoke_channel_inactive();
        }
    }

    pub fn fire_channel_read(&self, msg: Msg) {
        if let Some(next) = self.next_ctx() {
            next.invoke_channel_read(msg);
        }
    }

    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.next_ctx() {
            next.invoke_channel_read_complete();
        }
    }

    pub fn fire_exception_caught(&self, cause: NetError) {
        if let Some(next) = self.next_ctx() {
            next.invoke_exception_caught(cause);
        }
    }

    fn invoke_channel_registered(&self) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.fire_channel_registered();
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.channel_registered(&ctx) {
                ctx.invoke_exception_caught(e);
            }
        });
    }

    fn invoke_channel_active(&self) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.fire_channel_active();
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.channel_active(&ctx) {
                ctx.invoke_exception_caught(e);
            }
        });
    }

    fn invoke_channel_inactive(&self) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.fire_channel_inactive();
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.channel_inactive(&ctx) {
                ctx.invoke_exception_caught(e);
            }
        });
    }

    fn invoke_channel_read(&self, msg: Msg) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.fire_channel_read(msg);
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.channel_read(&ctx, msg) {
                ctx.invoke_exception_caught(e);
            }
        });
    }

    fn invoke_channel_read_complete(&self) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.fire_channel_read_complete();
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.channel_read_complete(&ctx) {
                ctx.invoke_exception_caught(e);
            }
        });
    }

    fn invoke_exception_caught(&self, cause: NetError) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.fire_exception_caught(cause);
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            handler.exception_caught(&ctx, cause);
        });
    }

    // ── outbound propagation ─────────────────────────────────────────

    pub fn bind(&self, addr: &SocketAddr, promise: Promise<()>) {
        match self.prev_ctx() {
            Some(prev) => prev.invoke_bind(*addr, promise),
            None => {
                promise.fail(NetError::ChannelClosed);
            }
        }
    }

    pub fn connect(&self, addr: &SocketAddr, promise: Promise<()>) {
        match self.prev_ctx() {
            Some(prev) => prev.invoke_connect(*addr, promise),
            None => {
                promise.fail(NetError::ChannelClosed);
            }
        }
    }

    pub fn write(&self, msg: Msg, promise: Promise<()>) {
        match self.prev_ctx() {
            Some(prev) => prev.invoke_write(msg, promise),
            None => {
                promise.fail(NetError::ChannelClosed);
            }
        }
    }

    pub fn flush(&self) {
        if let Some(prev) = self.prev_ctx() {
            prev.invoke_flush();
        }
    }

    pub fn close(&self, promise: Promise<()>) {
        match self.prev_ctx() {
            Some(prev) => prev.invoke_close(promise),
            None => {
                promise.succeed(());
            }
        }
    }

    fn invoke_bind(&self, addr: SocketAddr, promise: Promise<()>) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.bind(&addr, promise);
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.bind(&ctx, &addr, &promise) {
                promise.fail(e);
            }
        });
    }

    fn invoke_connect(&self, addr: SocketAddr, promise: Promise<()>) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.connect(&addr, promise);
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.connect(&ctx, &addr, &promise) {
                promise.fail(e);
            }
        });
    }

    fn invoke_write(&self, msg: Msg, promise: Promise<()>) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.write(msg, promise);
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.write(&ctx, msg, &promise) {
                promise.fail(e);
            }
        });
    }

    fn invoke_flush(&self) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.flush();
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.flush(&ctx) {
                ctx.invoke_exception_caught(e);
            }
        });
    }

    fn invoke_close(&self, promise: Promise<()>) {
        let ctx = self.clone();
        self.dispatch(move || {
            if ctx.skip_invoke() {
                ctx.close(promise);
                return;
            }
            let handler = Arc::clone(&ctx.inner.handler);
            if let Err(e) = handler.close(&ctx, &promise) {
                promise.fail(e);
            }
        });
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context({})", self.inner.name)
    }
}

// ── Sentinels ────────────────────────────────────────────────────────

/// Head sentinel: the first receiver of inbound events (forwards them)
/// and the performer of every outbound operation.
struct HeadHandler;

impl Handler for HeadHandler {
    fn bind(&self, ctx: &Context, addr: &SocketAddr, promise: &Promise<()>) -> NetResult<()> {
        match ctx.channel() {
            Some(ch) => ch.do_bind(addr, promise),
            None => {
                promise.fail(NetError::ChannelClosed);
            }
        }
        Ok(())
    }

    fn connect(&self, ctx: &Context, addr: &SocketAddr, promise: &Promise<()>) -> NetResult<()> {
        match ctx.channel() {
            Some(ch) => ch.do_connect(addr, promise),
            None => {
                promise.fail(NetError::ChannelClosed);
            }
        }
        Ok(())
    }

    fn write(&self, ctx: &Context, msg: Msg, promise: &Promise<()>) -> NetResult<()> {
        let Some(ch) = ctx.channel() else {
            promise.fail(NetError::ChannelClosed);
            return Ok(());
        };
        match msg.downcast::<Vec<u8>>() {
            Ok(data) => ch.do_write(*data, promise),
            Err(_) => {
                promise.fail(NetError::Unsupported(
                    "head sentinel writes byte buffers only",
                ));
            }
        }
        Ok(())
    }

    fn flush(&self, ctx: &Context) -> NetResult<()> {
        if let Some(ch) = ctx.channel() {
            ch.do_flush();
        }
        Ok(())
    }

    fn close(&self, ctx: &Context, promise: &Promise<()>) -> NetResult<()> {
        match ctx.channel() {
            Some(ch) => ch.close_on_loop(Some(promise.clone())),
            None => {
                promise.succeed(());
            }
        }
        Ok(())
    }
}

/// Tail sentinel: default terminal inbound handling - anything that
/// reaches it unconsumed is logged and released.
struct TailHandler;

impl Handler for TailHandler {
    fn channel_read(&self, ctx: &Context, msg: Msg) -> NetResult<()> {
        nl_debug!(
            "channel {:?}: message reached the pipeline tail unhandled, discarding",
            ctx.channel().map(|c| c.id())
        );
        drop(msg);
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &Context) -> NetResult<()> {
        Ok(())
    }

    fn exception_caught(&self, ctx: &Context, cause: NetError) {
        nl_warn!(
            "channel {:?}: exception reached the pipeline tail unhandled: {}",
            ctx.channel().map(|c| c.id()),
            cause
        );
    }

    fn channel_registered(&self, _ctx: &Context) -> NetResult<()> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &Context) -> NetResult<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &Context) -> NetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::testutil::NullTransport;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        log: Arc<StdMutex<Vec<String>>>,
        tag: String,
    }

    impl Handler for Recorder {
        fn handler_added(&self, _ctx: &Context) -> NetResult<()> {
            self.log.lock().unwrap().push(format!("{}:added", self.tag));
            Ok(())
        }

        fn handler_removed(&self, _ctx: &Context) -> NetResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:removed", self.tag));
            Ok(())
        }
    }

    fn recorder(log: &Arc<StdMutex<Vec<String>>>, tag: &str) -> Box<Recorder> {
        Box::new(Recorder {
            log: Arc::clone(log),
            tag: tag.to_string(),
        })
    }

    #[test]
    fn test_names_in_insertion_order() {
        let ch = Channel::new(Box::new(NullTransport::new()));
        let p = ch.pipeline();
        let log = Arc::new(StdMutex::new(Vec::new()));
        p.add_last("a", recorder(&log, "a")).unwrap();
        p.add_last("c", recorder(&log, "c")).unwrap();
        p.add_before("c", "b", recorder(&log, "b")).unwrap();
        p.add_first("z", recorder(&log, "z")).unwrap();
        assert_eq!(p.names(), vec!["z", "a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let ch = Channel::new(Box::new(NullTransport::new()));
        let p = ch.pipeline();
        let log = Arc::new(StdMutex::new(Vec::new()));
        p.add_last("dup", recorder(&log, "x")).unwrap();
        let err = p.add_last("dup", recorder(&log, "y")).unwrap_err();
        assert_eq!(err, NetError::DuplicateHandler("dup".to_string()));
    }

    #[test]
    fn test_callbacks_deferred_until_registration() {
        let ch = Channel::new(Box::new(NullTransport::new()));
        let p = ch.pipeline();
        let log = Arc::new(StdMutex::new(Vec::new()));
        p.add_last("a", recorder(&log, "a")).unwrap();
        p.add_last("b", recorder(&log, "b")).unwrap();
        // Unregistered channel: nothing has run yet.
        assert!(log.lock().unwrap().is_empty());

        // Removing before registration defers the removed-callback too;
        // the flush then replays added and removed in insertion order.
        p.remove("a").unwrap();
        assert!(log.lock().unwrap().is_empty());

        p.flush_pending_callbacks();
        // Callbacks ran on the fallback executor; wait for them.
        wait_for(&log, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:added", "b:added", "a:removed"]
        );
    }

    #[test]
    fn test_flush_happens_once() {
        let ch = Channel::new(Box::new(NullTransport::new()));
        let p = ch.pipeline();
        let log = Arc::new(StdMutex::new(Vec::new()));
        p.add_last("a", recorder(&log, "a")).unwrap();
        p.flush_pending_callbacks();
        p.flush_pending_callbacks();
        wait_for(&log, 1);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(*log.lock().unwrap(), vec!["a:added"]);
    }

    #[test]
    fn test_replace_orders_added_before_removed() {
        let ch = Channel::new(Box::new(NullTransport::new()));
        let p = ch.pipeline();
        let log = Arc::new(StdMutex::new(Vec::new()));
        p.add_last("old", recorder(&log, "old")).unwrap();
        p.flush_pending_callbacks();
        wait_for(&log, 1);

        p.replace("old", "new", recorder(&log, "new")).unwrap();
        wait_for(&log, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["old:added", "new:added", "old:removed"]
        );
        assert_eq!(p.names(), vec!["new"]);
    }

    #[test]
    fn test_failed_added_removes_handler() {
        struct Failing {
            removed: Arc<AtomicUsize>,
        }
        impl Handler for Failing {
            fn handler_added(&self, _ctx: &Context) -> NetResult<()> {
                Err(NetError::Handler("boom".to_string()))
            }
            fn handler_removed(&self, _ctx: &Context) -> NetResult<()> {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let ch = Channel::new(Box::new(NullTransport::new()));
        let p = ch.pipeline();
        let removed = Arc::new(AtomicUsize::new(0));
        p.add_last(
            "bad",
            Box::new(Failing {
                removed: Arc::clone(&removed),
            }),
        )
        .unwrap();
        p.flush_pending_callbacks();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while removed.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "handler never removed");
            std::thread::yield_now();
        }
        assert!(p.names().is_empty());
    }

    #[test]
    fn test_added_callbacks_fire_once_in_order_on_registration() {
        use crate::config::ReactorConfig;
        use crate::executor::MuxFactory;
        use crate::group::ExecutorGroup;

        let factory: MuxFactory = Arc::new(|| {
            Ok(Box::new(crate::testutil::IdleMux::new())
                as Box<dyn crate::multiplexer::Multiplexer>)
        });
        let config = ReactorConfig::new().executors(1).name_prefix("pipe-reg");
        let group = ExecutorGroup::with_multiplexer(config, factory).unwrap();

        let ch = Channel::new(Box::new(NullTransport::new()));
        let log = Arc::new(StdMutex::new(Vec::new()));
        for tag in ["one", "two", "three", "four"] {
            ch.pipeline().add_last(tag, recorder(&log, tag)).unwrap();
        }
        assert!(log.lock().unwrap().is_empty());

        group
            .register(&ch)
            .await_done(Some(std::time::Duration::from_secs(2)))
            .unwrap();

        wait_for(&log, 4);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["one:added", "two:added", "three:added", "four:added"]
        );

        group
            .shutdown_gracefully(std::time::Duration::ZERO, std::time::Duration::from_secs(5))
            .await_done(Some(std::time::Duration::from_secs(5)))
            .unwrap();
    }

    fn wait_for(log: &Arc<StdMutex<Vec<String>>>, n: usize) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while log.lock().unwrap().len() < n {
            assert!(
                std::time::Instant::now() < deadline,
                "expected {} callbacks, saw {:?}",
                n,
                log.lock().unwrap()
            );
            std::thread::yield_now();
        }
    }
}
