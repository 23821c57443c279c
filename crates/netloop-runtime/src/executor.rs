//! Executor - a lazily-started, single-threaded task engine
//!
//! An executor owns at most one worker thread, created on the first
//! submitted unit of work. Task-only executors park on a condvar between
//! bursts; I/O-capable executors hand their thread to the reactor loop,
//! which interleaves readiness processing with the same task queue
//! (see `reactor`).
//!
//! Invariant: the task queue and multiplexer are touched only by the
//! owning thread once the worker has started. Foreign threads interact
//! through `execute`/`schedule` and the wake path, nothing else.

use crate::multiplexer::waker::EventWaker;
use crate::multiplexer::Multiplexer;
use crate::promise::Promise;
use crate::time;
use crate::tls;
use crossbeam_queue::{ArrayQueue, SegQueue};
use netloop_core::error::{NetError, NetResult};
use netloop_core::id::ExecutorId;
use netloop_core::state::ExecutorState;
use netloop_core::{log as nl_log_mod, nl_debug, nl_warn};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Factory producing a fresh multiplexer; called once at executor
/// creation and again on every rebuild.
pub type MuxFactory = Arc<dyn Fn() -> NetResult<Box<dyn Multiplexer>> + Send + Sync>;

/// Sentinel for `intended_wake_ns`: the loop is awake (not blocking)
const AWAKE: u64 = 0;
/// Sentinel for `intended_wake_ns`: blocking with no deadline
const NO_DEADLINE: u64 = u64::MAX;

// ── Task queue ───────────────────────────────────────────────────────

/// MPSC task queue: many submitters, one consumer (the worker thread)
enum TaskQueue {
    Unbounded(SegQueue<Task>),
    Bounded(ArrayQueue<Task>),
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        if capacity == 0 {
            TaskQueue::Unbounded(SegQueue::new())
        } else {
            TaskQueue::Bounded(ArrayQueue::new(capacity))
        }
    }

    /// Push a task; gives the task back if the queue is at capacity
    fn push(&self, task: Task) -> Result<(), Task> {
        match self {
            TaskQueue::Unbounded(q) => {
                q.push(task);
                Ok(())
            }
            TaskQueue::Bounded(q) => q.push(task),
        }
    }

    fn pop(&self) -> Option<Task> {
        match self {
            TaskQueue::Unbounded(q) => q.pop(),
            TaskQueue::Bounded(q) => q.pop(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            TaskQueue::Unbounded(q) => q.is_empty(),
            TaskQueue::Bounded(q) => q.is_empty(),
        }
    }
}

// ── Scheduled tasks ──────────────────────────────────────────────────

/// Cancellation handle for a scheduled task.
///
/// Cancelling wins the race with the deadline: a cancelled task never
/// runs, it is lazily discarded when the heap reaches it.
#[derive(Clone)]
pub struct Scheduled {
    cancelled: Arc<AtomicBool>,
}

impl Scheduled {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ScheduledEntry {
    deadline_ns: u64,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

// Min-heap ordering (earliest deadline first, insertion order breaks ties)
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline_ns
            .cmp(&self.deadline_ns)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

// ── Parker (task-only executors) ─────────────────────────────────────

/// Permit-based parking: an unpark before park is not lost
struct Parker {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn park(&self, timeout: Option<Duration>) {
        let mut permit = self.permit.lock().unwrap();
        if *permit {
            *permit = false;
            return;
        }
        permit = match timeout {
            Some(t) => self.cond.wait_timeout(permit, t).unwrap().0,
            None => self.cond.wait(permit).unwrap(),
        };
        if *permit {
            *permit = false;
        }
    }

    fn unpark(&self) {
        let mut permit = self.permit.lock().unwrap();
        *permit = true;
        self.cond.notify_one();
    }
}

// ── Executor ─────────────────────────────────────────────────────────

enum Kind {
    /// Plain task runner (the process-wide fallback executor)
    Task,
    /// Reactor executor: owns a multiplexer, runs the I/O loop
    Io {
        factory: MuxFactory,
        io_ratio: u32,
        rebuild_threshold: u32,
    },
}

pub(crate) struct ExecutorInner {
    name: String,
    kind: Kind,
    state: AtomicU8,
    queue: TaskQueue,
    scheduled: Mutex<BinaryHeap<ScheduledEntry>>,
    sched_seq: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    parker: Parker,
    /// Cross-thread wake for a loop blocked in the multiplexer
    io_waker: Option<EventWaker>,
    /// Multiplexer created eagerly (group construction can fail fast);
    /// taken by the worker thread when the loop starts
    mux_slot: Mutex<Option<Box<dyn Multiplexer>>>,
    /// Deadline the loop intends to wake at by itself; AWAKE while the
    /// loop is processing, NO_DEADLINE while blocked without a deadline.
    /// Lets `schedule` elide wake-ups that would land before it anyway.
    intended_wake_ns: AtomicU64,
    termination: Promise<()>,
    quiet_ns: AtomicU64,
    shutdown_timeout_ns: AtomicU64,
    shutdown_start_ns: AtomicU64,
    last_activity_ns: AtomicU64,
}

/// Handle to an executor. Cloning shares the same engine.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Task-only executor (no multiplexer)
    pub fn new_task(name: &str, queue_capacity: usize) -> Executor {
        Executor {
            inner: Arc::new(ExecutorInner::new(name, Kind::Task, queue_capacity, None)),
        }
    }

    /// I/O-capable executor. The multiplexer is created here, eagerly,
    /// so a defective factory fails group construction instead of a
    /// worker thread later.
    pub fn new_io(
        name: &str,
        queue_capacity: usize,
        io_ratio: u32,
        rebuild_threshold: u32,
        factory: MuxFactory,
    ) -> NetResult<Executor> {
        let mux = factory()?;
        let waker = EventWaker::new()?;
        let inner = ExecutorInner::new(
            name,
            Kind::Io {
                factory,
                io_ratio,
                rebuild_threshold,
            },
            queue_capacity,
            Some(waker),
        );
        *inner.mux_slot.lock().unwrap() = Some(mux);
        Ok(Executor {
            inner: Arc::new(inner),
        })
    }

    /// The thread-identity token for this executor. Derived from the
    /// shared-state allocation, so it is unique among live executors
    /// without any global counter.
    #[inline]
    pub fn token(&self) -> ExecutorId {
        ExecutorId::new(Arc::as_ptr(&self.inner) as usize as u64)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The thread-affinity test: is the calling thread this executor's
    /// worker thread?
    #[inline]
    pub fn in_event_loop(&self) -> bool {
        tls::executor_token() == self.token()
    }

    #[inline]
    pub fn state(&self) -> ExecutorState {
        ExecutorState::from(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// Append a task to the queue, starting the worker thread if this is
    /// the first unit of work. Never inlines, even from the worker
    /// thread itself, so ordering with already-queued work is preserved.
    pub fn execute(&self, task: Task) -> NetResult<()> {
        self.submit(task).map_err(|(e, _)| e)
    }

    /// `execute`, but a rejected task runs inline on the caller instead
    /// of being dropped. Used for promise listener delivery, where
    /// silently losing a notification is worse than running it on the
    /// wrong thread of a terminating process.
    pub fn execute_or_run(&self, task: Task) {
        if let Err((e, task)) = self.submit(task) {
            nl_warn!("executor {} rejected task ({}), running inline", self.inner.name, e);
            task();
        }
    }

    fn submit(&self, task: Task) -> Result<(), (NetError, Task)> {
        if self.state().is_shutdown() {
            return Err((NetError::Terminated, task));
        }
        if let Err(task) = self.inner.queue.push(task) {
            return Err((NetError::QueueFull, task));
        }
        self.start_if_needed();
        self.wake();
        Ok(())
    }

    /// The cross-thread "run now or queue" primitive: runs `f`
    /// immediately when called on this executor's thread, queues it
    /// otherwise. Exactly one of the two happens.
    pub fn dispatch<F>(&self, f: F) -> NetResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.in_event_loop() {
            f();
            Ok(())
        } else {
            self.execute(Box::new(f))
        }
    }

    /// Run `task` after `delay`. The returned handle cancels it; a
    /// cancelled task never fires.
    pub fn schedule(&self, delay: Duration, task: Task) -> NetResult<Scheduled> {
        if self.state().is_shutdown() {
            return Err(NetError::Terminated);
        }
        let deadline_ns = time::deadline_ns(delay);
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut heap = self.inner.scheduled.lock().unwrap();
            heap.push(ScheduledEntry {
                deadline_ns,
                seq: self.inner.sched_seq.fetch_add(1, Ordering::Relaxed),
                cancelled: Arc::clone(&cancelled),
                task,
            });
        }
        self.start_if_needed();
        // Elide the wake when the loop will wake on its own schedule
        // before this deadline anyway.
        if !self.in_event_loop() {
            let intended = self.inner.intended_wake_ns.load(Ordering::Acquire);
            if intended != AWAKE && deadline_ns < intended {
                self.wake();
            }
        }
        Ok(Scheduled { cancelled })
    }

    /// Begin graceful shutdown: stop accepting work once the queue has
    /// been quiet for `quiet_period`, or after `timeout` at the latest.
    /// Returns the termination future (shared across calls).
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        self.inner
            .quiet_ns
            .store(quiet_period.as_nanos() as u64, Ordering::Relaxed);
        self.inner
            .shutdown_timeout_ns
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);

        loop {
            let state = self.state();
            match state {
                ExecutorState::NotStarted => {
                    // No thread, no queued work (first submit starts the
                    // thread): terminate immediately.
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            ExecutorState::NotStarted as u8,
                            ExecutorState::Terminated as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // A submit racing this transition may have queued
                        // a task before losing the CAS; drain it.
                        self.run_all_tasks(None);
                        self.inner.termination.succeed(());
                        break;
                    }
                }
                ExecutorState::Started => {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            ExecutorState::Started as u8,
                            ExecutorState::ShuttingDown as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.inner
                            .shutdown_start_ns
                            .store(time::now_ns(), Ordering::Relaxed);
                        self.wake();
                        break;
                    }
                }
                // Already on its way down
                _ => break,
            }
        }
        self.termination_future()
    }

    /// Future fulfilled when the worker thread has exited
    pub fn termination_future(&self) -> Promise<()> {
        self.inner.termination.clone()
    }

    /// Block until terminated (not callable from executor threads)
    pub fn await_termination(&self, timeout: Option<Duration>) -> NetResult<()> {
        self.inner.termination.await_done(timeout).map(|_| ())
    }

    // ── internal ─────────────────────────────────────────────────────

    fn start_if_needed(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                ExecutorState::NotStarted as u8,
                ExecutorState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let exec = self.clone();
        let handle = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || worker_main(exec))
            .expect("failed to spawn executor thread");
        *self.inner.thread.lock().unwrap() = Some(handle);
    }

    fn wake(&self) {
        if self.in_event_loop() {
            return;
        }
        match &self.inner.kind {
            Kind::Task => self.inner.parker.unpark(),
            Kind::Io { .. } => {
                if let Some(waker) = &self.inner.io_waker {
                    waker.wake();
                }
            }
        }
    }

    // ── loop-side helpers (worker thread only) ───────────────────────

    pub(crate) fn take_multiplexer(&self) -> Option<Box<dyn Multiplexer>> {
        self.inner.mux_slot.lock().unwrap().take()
    }

    pub(crate) fn mux_factory(&self) -> Option<MuxFactory> {
        match &self.inner.kind {
            Kind::Io { factory, .. } => Some(Arc::clone(factory)),
            Kind::Task => None,
        }
    }

    pub(crate) fn io_ratio(&self) -> u32 {
        match &self.inner.kind {
            Kind::Io { io_ratio, .. } => *io_ratio,
            Kind::Task => 100,
        }
    }

    pub(crate) fn rebuild_threshold(&self) -> u32 {
        match &self.inner.kind {
            Kind::Io {
                rebuild_threshold, ..
            } => *rebuild_threshold,
            Kind::Task => 0,
        }
    }

    pub(crate) fn io_waker(&self) -> Option<&EventWaker> {
        self.inner.io_waker.as_ref()
    }

    pub(crate) fn set_state(&self, state: ExecutorState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Move due scheduled tasks onto the task queue
    pub(crate) fn fetch_due_scheduled(&self) {
        let now = time::now_ns();
        loop {
            let entry = {
                let mut heap = self.inner.scheduled.lock().unwrap();
                match heap.peek() {
                    Some(top) if top.deadline_ns <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if let Err(task) = self.inner.queue.push(entry.task) {
                // Bounded queue full; we are on the owning thread, so
                // running it here keeps the deadline honored.
                task();
                self.inner
                    .last_activity_ns
                    .store(time::now_ns(), Ordering::Relaxed);
            }
        }
    }

    /// Nanoseconds until the next live scheduled deadline
    pub(crate) fn next_deadline_delay_ns(&self) -> Option<u64> {
        let now = time::now_ns();
        let mut heap = self.inner.scheduled.lock().unwrap();
        // Shed cancelled entries sitting at the top
        while let Some(top) = heap.peek() {
            if top.cancelled.load(Ordering::Acquire) {
                heap.pop();
                continue;
            }
            return Some(top.deadline_ns.saturating_sub(now));
        }
        None
    }

    /// Anything runnable right now?
    pub(crate) fn has_pending_tasks(&self) -> bool {
        if !self.inner.queue.is_empty() {
            return true;
        }
        matches!(self.next_deadline_delay_ns(), Some(0))
    }

    /// Run queued tasks (due scheduled tasks first). With a budget, the
    /// elapsed time is checked every 64 tasks; without one the queue is
    /// drained. Returns the number of tasks run.
    pub(crate) fn run_all_tasks(&self, budget_ns: Option<u64>) -> usize {
        self.fetch_due_scheduled();
        let start = time::now_ns();
        let mut count = 0usize;
        while let Some(task) = self.inner.queue.pop() {
            task();
            count += 1;
            if count % 64 == 0 {
                if let Some(budget) = budget_ns {
                    if time::now_ns() - start >= budget {
                        break;
                    }
                }
            }
        }
        if count > 0 {
            self.inner
                .last_activity_ns
                .store(time::now_ns(), Ordering::Relaxed);
        }
        count
    }

    /// Drop all scheduled work (graceful shutdown cancels timers)
    pub(crate) fn cancel_scheduled(&self) {
        self.inner.scheduled.lock().unwrap().clear();
    }

    /// Record the deadline the loop is about to block until
    pub(crate) fn record_intended_wake(&self, deadline_ns: Option<u64>) {
        self.inner
            .intended_wake_ns
            .store(deadline_ns.unwrap_or(NO_DEADLINE), Ordering::Release);
    }

    /// The loop is processing again
    pub(crate) fn record_awake(&self) {
        self.inner.intended_wake_ns.store(AWAKE, Ordering::Release);
    }

    /// May the loop exit? True once the queue has stayed empty past the
    /// quiet period, or the shutdown timeout has elapsed.
    pub(crate) fn confirm_shutdown(&self) -> bool {
        if !self.state().is_shutting_down() {
            return false;
        }
        self.cancel_scheduled();
        self.run_all_tasks(None);

        let now = time::now_ns();
        let start = self.inner.shutdown_start_ns.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= self.inner.shutdown_timeout_ns.load(Ordering::Relaxed) {
            return true;
        }
        let last = self.inner.last_activity_ns.load(Ordering::Relaxed);
        let idle = now.saturating_sub(last.max(start));
        self.inner.queue.is_empty() && idle >= self.inner.quiet_ns.load(Ordering::Relaxed)
    }

    /// Bounded nap while draining the shutdown quiet period
    pub(crate) fn shutdown_nap_ns(&self) -> u64 {
        self.inner
            .quiet_ns
            .load(Ordering::Relaxed)
            .clamp(1_000_000, 100_000_000)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Executor({}, {:?})", self.inner.name, self.state())
    }
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Executor {}

impl ExecutorInner {
    fn new(name: &str, kind: Kind, queue_capacity: usize, io_waker: Option<EventWaker>) -> Self {
        ExecutorInner {
            name: name.to_string(),
            kind,
            state: AtomicU8::new(ExecutorState::NotStarted as u8),
            queue: TaskQueue::new(queue_capacity),
            scheduled: Mutex::new(BinaryHeap::new()),
            sched_seq: AtomicU64::new(0),
            thread: Mutex::new(None),
            parker: Parker::new(),
            io_waker,
            mux_slot: Mutex::new(None),
            intended_wake_ns: AtomicU64::new(AWAKE),
            termination: Promise::new(),
            quiet_ns: AtomicU64::new(0),
            shutdown_timeout_ns: AtomicU64::new(0),
            shutdown_start_ns: AtomicU64::new(0),
            last_activity_ns: AtomicU64::new(0),
        }
    }
}

// ── Worker thread body ───────────────────────────────────────────────

fn worker_main(exec: Executor) {
    tls::set_executor_token(exec.token());
    nl_log_mod::set_thread_label(exec.name());
    nl_debug!("executor started");

    match &exec.inner.kind {
        Kind::Io { .. } => crate::reactor::run_io_loop(&exec),
        Kind::Task => task_loop(&exec),
    }

    // Final drain, then report termination.
    exec.run_all_tasks(None);
    exec.set_state(ExecutorState::Terminated);
    exec.inner.termination.succeed(());
    nl_debug!("executor terminated");

    nl_log_mod::clear_thread_label();
    tls::clear_executor_token();
}

/// Loop body for task-only executors: run, confirm shutdown, park
fn task_loop(exec: &Executor) {
    loop {
        exec.record_awake();
        exec.run_all_tasks(None);

        if exec.is_shutting_down() {
            if exec.confirm_shutdown() {
                exec.set_state(ExecutorState::Shutdown);
                return;
            }
            exec.inner
                .parker
                .park(Some(Duration::from_nanos(exec.shutdown_nap_ns())));
            continue;
        }

        if exec.has_pending_tasks() {
            continue;
        }
        let delay = exec.next_deadline_delay_ns();
        exec.record_intended_wake(delay.map(|d| time::now_ns().saturating_add(d)));
        exec.inner.parker.park(delay.map(Duration::from_nanos));
    }
}

// ── Process-wide fallback executor ───────────────────────────────────

static FALLBACK: OnceLock<Executor> = OnceLock::new();

/// The process-wide fallback executor. Carries promise notifications for
/// operations whose owning executor is not yet known (registration
/// races) and for failures that happen before any executor assignment.
pub fn fallback_executor() -> &'static Executor {
    FALLBACK.get_or_init(|| Executor::new_task("netloop-fallback", 0))
}
