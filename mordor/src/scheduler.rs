//! Work-dispatch engine: a FIFO of schedulable items run by a pool of
//! worker threads (or a single hijacked thread).
//!
//! Items are either ready fibers or plain callables; callables are
//! wrapped in a per-worker fiber that is `reset()` between uses. Each
//! item may carry a thread hint restricting which worker may run it.
//! Dispatch is strict FIFO among the items a worker is eligible for;
//! idle workers park on a condvar.
//!
//! A suspended fiber re-enters the queue in one of two ways:
//! [`Scheduler::yield_to_this`] (requeue-at-tail, the cooperative
//! timeslice) or an external wake such as [`FiberEvent::set`]. Both mark
//! the fiber claimable *before* it has finished switching out; the
//! dispatch loop absorbs that window by requeueing a fiber it cannot
//! claim yet.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::Result;
use crate::fiber::{Fiber, State};
use crate::log::{Log, Logger};
use crate::{log_debug, log_error, log_warning};

static LOG: LazyLock<Arc<Logger>> = LazyLock::new(|| Log::lookup("mordor:scheduler"));

enum Task {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

struct Item {
    task: Task,
    hint: Option<ThreadId>,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

/// A FIFO work queue plus thread pool that runs fibers to their next
/// suspension.
pub struct Scheduler {
    name: String,
    /// Worker threads to spawn on `start` (excludes a hijacked caller).
    spawn_count: usize,
    hijack: bool,
    hijack_thread: Option<ThreadId>,
    queue: Mutex<VecDeque<Item>>,
    cond: Condvar,
    stopping: AtomicBool,
    started: AtomicBool,
    /// Items currently being dispatched; workers only exit once this
    /// drains, so a mid-flight task can still requeue work.
    busy: AtomicUsize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_ids: Mutex<Vec<ThreadId>>,
}

impl Scheduler {
    /// A scheduler whose workers are all spawned threads. Call
    /// [`start`](Self::start) before scheduling work that must run.
    pub fn new(name: &str, threads: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            name: name.to_string(),
            spawn_count: threads,
            hijack: false,
            hijack_thread: None,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(Vec::new()),
        })
    }

    /// A scheduler that hijacks the constructing thread as one of its
    /// workers: queued work runs on the caller inside
    /// [`stop`](Self::stop). `threads` counts the caller.
    pub fn hijack(name: &str, threads: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            name: name.to_string(),
            spawn_count: threads.saturating_sub(1),
            hijack: true,
            hijack_thread: Some(thread::current().id()),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler the calling fiber runs under, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|s| s.borrow().clone())
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut handles = lock(&self.handles);
        for i in 0..self.spawn_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{i}", self.name))
                .spawn(move || {
                    sched.dispatch();
                })?;
            lock(&self.worker_ids).push(handle.thread().id());
            handles.push(handle);
        }
        Ok(())
    }

    /// Thread ids of the workers (spawned ones plus a hijacked caller).
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids = lock(&self.worker_ids).clone();
        if let Some(id) = self.hijack_thread {
            ids.push(id);
        }
        ids
    }

    /// Enqueue a callable to run on any worker. Never blocks.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.push(Task::Call(Box::new(f)), None);
    }

    /// Enqueue a callable restricted to one worker thread.
    pub fn schedule_on(&self, thread: ThreadId, f: impl FnOnce() + Send + 'static) {
        self.push(Task::Call(Box::new(f)), Some(thread));
    }

    /// Enqueue a suspended fiber to be resumed on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.push(Task::Fiber(fiber), None);
    }

    /// Enqueue a suspended fiber restricted to one worker thread.
    pub fn schedule_fiber_on(&self, thread: ThreadId, fiber: Arc<Fiber>) {
        self.push(Task::Fiber(fiber), Some(thread));
    }

    /// Suspend the current fiber and place it at the tail of this
    /// scheduler's queue; returns when it is re-dispatched. This is the
    /// cooperative timeslice, and also migrates a fiber between
    /// schedulers. No-op on a root fiber with no outer to return to.
    pub fn yield_to_this(self: &Arc<Self>) {
        let me = Fiber::current();
        // The outer must be captured before the fiber becomes
        // claimable; a fast resumer overwrites it.
        let Some(outer) = me.outer_handle() else {
            return;
        };
        // Claimable before queued; the state must not be touched again
        // on this side of the switch.
        me.mark_state(State::Ready);
        self.push(Task::Fiber(me.clone()), None);
        Fiber::suspend_to(&outer);
    }

    /// [`yield_to_this`](Self::yield_to_this) on the current scheduler;
    /// no-op outside one.
    pub fn yield_now() {
        if let Some(sched) = Scheduler::current() {
            sched.yield_to_this();
        }
    }

    /// Set the shutdown flag, wake all workers, drain already-queued
    /// work, and join. On a hijack scheduler the caller becomes a worker
    /// for the drain. Fibers parked outside the queue are abandoned.
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::Release);
        {
            let _q = lock(&self.queue);
            self.cond.notify_all();
        }
        if self.hijack && Some(thread::current().id()) == self.hijack_thread {
            self.dispatch();
        }
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if handle.join().is_err() {
                log_error!(LOG, "worker thread of {:?} panicked", self.name);
            }
        }
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    // ── dispatch ────────────────────────────────────────────────────────

    fn push(&self, task: Task, hint: Option<ThreadId>) {
        let notify_all = hint.is_some();
        {
            let mut q = lock(&self.queue);
            q.push_back(Item { task, hint });
        }
        if notify_all {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    /// Worker loop: run eligible items until stopped and drained.
    fn dispatch(self: &Arc<Self>) {
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        let me = thread::current().id();
        // One reusable fiber per worker for plain callables.
        let mut call_fiber: Option<Arc<Fiber>> = None;

        while let Some(item) = self.next_item(me) {
            match item.task {
                Task::Call(f) => {
                    let fiber = match call_fiber.take() {
                        Some(fb) => fb.reset(f).map(|_| fb),
                        None => Fiber::new(f),
                    };
                    match fiber {
                        Ok(fb) => {
                            self.run_fiber(&fb);
                            if matches!(fb.state(), State::Term | State::Except) {
                                call_fiber = Some(fb);
                            }
                        }
                        Err(err) => {
                            log_error!(LOG, "cannot create fiber for task: {err}");
                        }
                    }
                }
                Task::Fiber(fb) => self.run_fiber(&fb),
            }
            self.busy.fetch_sub(1, Ordering::AcqRel);
            {
                let _q = lock(&self.queue);
                self.cond.notify_all();
            }
        }
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = None);
    }

    fn next_item(&self, me: ThreadId) -> Option<Item> {
        let mut q = lock(&self.queue);
        loop {
            if let Some(pos) = q
                .iter()
                .position(|item| item.hint.is_none() || item.hint == Some(me))
            {
                self.busy.fetch_add(1, Ordering::AcqRel);
                return q.remove(pos);
            }
            if self.stopping.load(Ordering::Acquire) && self.busy.load(Ordering::Acquire) == 0 {
                return None;
            }
            q = self.cond.wait(q).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn run_fiber(self: &Arc<Self>, fiber: &Arc<Fiber>) {
        match panic::catch_unwind(AssertUnwindSafe(|| fiber.call())) {
            Ok(Ok(())) => {}
            Ok(Err(_)) if fiber.state() == State::Exec => {
                // The fiber was made claimable before it finished
                // switching out (event-wake window); try again later.
                log_debug!(LOG, "requeueing fiber {:#x} still switching out", fiber.id());
                self.push(Task::Fiber(fiber.clone()), None);
            }
            Ok(Err(err)) => {
                log_warning!(LOG, "dropping unrunnable fiber {:#x}: {err}", fiber.id());
            }
            Err(_) => {
                log_error!(LOG, "scheduled fiber {:#x} panicked", fiber.id());
            }
        }
    }
}

/// A set/reset event fibers can park on.
///
/// `wait()` parks the current fiber and returns after a `set()`; on a
/// thread without a scheduler it blocks the thread on a condvar instead.
/// With `auto_reset`, each `set` is consumed by exactly one returning
/// waiter; without it the event stays signalled until [`reset`].
///
/// [`reset`]: FiberEvent::reset
pub struct FiberEvent {
    auto_reset: bool,
    inner: Mutex<EventInner>,
    cond: Condvar,
}

struct EventInner {
    signalled: bool,
    waiters: Vec<(Arc<Fiber>, Arc<Scheduler>)>,
}

impl FiberEvent {
    pub fn new(auto_reset: bool) -> FiberEvent {
        FiberEvent {
            auto_reset,
            inner: Mutex::new(EventInner {
                signalled: false,
                waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Block the current fiber (or thread) until the event is set.
    pub fn wait(&self) {
        loop {
            let me = Fiber::current();
            let sched = Scheduler::current();
            // Captured before registration makes this fiber claimable.
            let outer = me.outer_handle();
            let parked = {
                let mut inner = lock(&self.inner);
                if inner.signalled {
                    if self.auto_reset {
                        inner.signalled = false;
                    }
                    return;
                }
                match (sched, &outer) {
                    (Some(sched), Some(_)) => {
                        inner.waiters.push((me.clone(), sched));
                        true
                    }
                    _ => {
                        // Bare thread: condvar fallback.
                        while !inner.signalled {
                            inner = self
                                .cond
                                .wait(inner)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                        if self.auto_reset {
                            inner.signalled = false;
                        }
                        return;
                    }
                }
            };
            if parked && let Some(outer) = &outer {
                me.mark_state(State::Hold);
                Fiber::suspend_to(outer);
            }
            // Re-check; another waiter may have consumed the signal.
        }
    }

    /// Signal the event and wake every parked waiter.
    pub fn set(&self) {
        let waiters = {
            let mut inner = lock(&self.inner);
            inner.signalled = true;
            std::mem::take(&mut inner.waiters)
        };
        self.cond.notify_all();
        for (fiber, sched) in waiters {
            sched.schedule_fiber(fiber);
        }
    }

    /// Clear the signal (manual-reset events).
    pub fn reset(&self) {
        lock(&self.inner).signalled = false;
    }

    pub fn is_set(&self) -> bool {
        lock(&self.inner).signalled
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
