//! Stackful cooperative fibers.
//!
//! A [`Fiber`] is a suspendable execution unit with its own guard-paged
//! stack. Control moves between fibers explicitly: [`Fiber::call`]
//! suspends the caller and resumes the target, [`Fiber::yield_now`]
//! returns to whoever called the current fiber. There is no preemption —
//! between switch points a fiber runs to completion on its worker.
//!
//! Fibers are not pinned to OS threads: a suspended fiber may be resumed
//! on any thread (the scheduler does exactly that). Cross-thread handoff
//! is serialized by a per-fiber `running` latch — a resumer spins until
//! the previous switch has finished saving the machine context, with
//! release/acquire publication on the latch.
//!
//! A fiber abandoned while suspended is never unwound: dropping the last
//! external handle leaks its stack. The scheduler always runs fibers to
//! termination, so this only matters for hand-driven fibers.

mod context;
mod fls;
mod stack;

pub use fls::FiberLocalStorage;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};
use context::Context;
use stack::GuardedStack;

/// Default usable stack size for [`Fiber::new`].
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created (or reset); has an entry it has not started.
    Init,
    /// Suspended and queued to run (rescheduled via a scheduler).
    Ready,
    /// Currently executing on some thread.
    Exec,
    /// Suspended, waiting to be resumed explicitly.
    Hold,
    /// Entry returned normally.
    Term,
    /// Entry panicked; the payload re-raises in the next caller.
    Except,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            _ => State::Except,
        }
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The fiber that most recently switched away on this thread; its
    /// `running` latch is cleared as the first action after every switch.
    static PREVIOUS: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

/// A stackful cooperative execution unit.
pub struct Fiber {
    state: AtomicU8,
    /// True from just before a switch-in until the switch that leaves
    /// this fiber has finished saving its context. See module docs.
    running: AtomicBool,
    context: std::cell::UnsafeCell<Context>,
    stack: Option<GuardedStack>,
    entry: Mutex<Option<Entry>>,
    /// The fiber control returns to on yield or termination; set by the
    /// transfer that resumed this fiber.
    outer: Mutex<Option<Arc<Fiber>>>,
    panic_payload: Mutex<Option<Box<dyn Any + Send>>>,
    fls: Mutex<HashMap<usize, Box<dyn Any + Send>>>,
}

unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &(self as *const Fiber))
            .field("state", &self.state())
            .finish()
    }
}

impl Fiber {
    /// Create a fiber with the default stack size. It starts in
    /// [`State::Init`] and runs `entry` on its first switch-in.
    pub fn new(entry: impl FnOnce() + Send + 'static) -> Result<Arc<Fiber>> {
        Self::with_stack_size(entry, DEFAULT_STACK_SIZE)
    }

    /// Create a fiber with an explicit stack size.
    pub fn with_stack_size(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> Result<Arc<Fiber>> {
        let stack = GuardedStack::new(stack_size)?;
        let fiber = Arc::new(Fiber {
            state: AtomicU8::new(State::Init as u8),
            running: AtomicBool::new(false),
            context: std::cell::UnsafeCell::new(Context::empty()),
            stack: Some(stack),
            entry: Mutex::new(Some(Box::new(entry))),
            outer: Mutex::new(None),
            panic_payload: Mutex::new(None),
            fls: Mutex::new(HashMap::new()),
        });
        let top = fiber
            .stack
            .as_ref()
            .map(|s| s.top())
            .unwrap_or(ptr::null_mut());
        unsafe {
            *fiber.context.get() = Context::seed(top, Arc::as_ptr(&fiber) as *const ());
        }
        Ok(fiber)
    }

    /// The root fiber materialized around an OS thread on first use.
    fn root() -> Arc<Fiber> {
        Arc::new(Fiber {
            state: AtomicU8::new(State::Exec as u8),
            running: AtomicBool::new(true),
            context: std::cell::UnsafeCell::new(Context::empty()),
            stack: None,
            entry: Mutex::new(None),
            outer: Mutex::new(None),
            panic_payload: Mutex::new(None),
            fls: Mutex::new(HashMap::new()),
        })
    }

    /// The currently executing fiber on this thread. There is always
    /// one: the first call on a thread materializes its root fiber.
    pub fn current() -> Arc<Fiber> {
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            if cur.is_none() {
                *cur = Some(Fiber::root());
            }
            cur.as_ref().map(Arc::clone).unwrap_or_else(Fiber::root)
        })
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stable identity, used by log records as an opaque fiber pointer.
    pub fn id(&self) -> usize {
        self as *const Fiber as usize
    }

    /// Suspend the calling fiber and resume `self` until it yields or
    /// terminates. Fails with [`Error::NotSchedulable`] if `self` is
    /// executing elsewhere, has terminated without a reset, or is the
    /// calling fiber. A panic in `self`'s entry re-raises here.
    pub fn call(self: &Arc<Fiber>) -> Result<()> {
        let caller = Fiber::current();
        if Arc::ptr_eq(&caller, self) {
            return Err(Error::NotSchedulable("a fiber cannot call itself"));
        }
        self.claim()?;
        *lock(&self.outer) = Some(caller.clone());
        caller.store_state(State::Hold);
        switch_fibers(&caller, self);
        caller.store_state(State::Exec);
        self.propagate_panic()
    }

    /// Suspend the current fiber ([`State::Hold`]) and return control to
    /// its outer fiber. No-op on a root fiber with no outer.
    pub fn yield_now() {
        Fiber::yield_with(State::Hold);
    }

    pub(crate) fn yield_with(state: State) {
        let me = Fiber::current();
        let target = lock(&me.outer).clone();
        let Some(target) = target else {
            return;
        };
        me.store_state(state);
        target.seize_for_return();
        switch_fibers(&me, &target);
        me.store_state(State::Exec);
    }

    /// Symmetric transfer: suspend the current fiber and resume
    /// `target`, whose outer becomes the current fiber.
    pub fn yield_to(target: &Arc<Fiber>) -> Result<()> {
        let me = Fiber::current();
        if Arc::ptr_eq(&me, target) {
            return Err(Error::NotSchedulable("a fiber cannot yield to itself"));
        }
        target.claim()?;
        *lock(&target.outer) = Some(me.clone());
        me.store_state(State::Hold);
        switch_fibers(&me, target);
        me.store_state(State::Exec);
        target.propagate_panic()
    }

    /// Re-arm a terminated fiber with a new entry, reusing its stack.
    /// Only valid in [`State::Term`] or [`State::Except`].
    pub fn reset(self: &Arc<Fiber>, entry: impl FnOnce() + Send + 'static) -> Result<()> {
        match self.state() {
            State::Term | State::Except => {}
            _ => return Err(Error::NotSchedulable("reset requires a terminated fiber")),
        }
        let Some(stack) = self.stack.as_ref() else {
            return Err(Error::NotSchedulable("a root fiber cannot be reset"));
        };
        // The terminal switch may still be saving state on another
        // thread; wait for it to land before reseeding the context.
        while self.running.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        *lock(&self.entry) = Some(Box::new(entry));
        *lock(&self.panic_payload) = None;
        lock(&self.fls).clear();
        unsafe {
            *self.context.get() = Context::seed(stack.top(), Arc::as_ptr(self) as *const ());
        }
        self.store_state(State::Init);
        Ok(())
    }

    /// Mark the fiber's scheduling state without switching. The
    /// scheduler uses this to make a still-running fiber claimable
    /// before it actually parks; pair with [`Fiber::suspend`] and do not
    /// touch the state again afterwards — a resumer's claim owns it.
    pub(crate) fn mark_state(&self, state: State) {
        self.store_state(state);
    }

    /// Snapshot of the outer link. Parking protocols must take this
    /// *before* making the fiber claimable: the moment a resumer can
    /// claim it, `call()` on another thread may overwrite `outer`.
    pub(crate) fn outer_handle(&self) -> Option<Arc<Fiber>> {
        lock(&self.outer).clone()
    }

    /// Switch to `target` (the outer captured via
    /// [`outer_handle`](Self::outer_handle)) without storing any state
    /// for the current fiber — the caller marked it already, and a
    /// resumer's claim owns it from here on.
    pub(crate) fn suspend_to(target: &Arc<Fiber>) {
        let me = Fiber::current();
        target.seize_for_return();
        switch_fibers(&me, target);
    }

    // ── internals ───────────────────────────────────────────────────────

    fn claim(&self) -> Result<()> {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match State::from_u8(state) {
                State::Init | State::Hold | State::Ready => {
                    match self.state.compare_exchange_weak(
                        state,
                        State::Exec as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(()),
                        Err(actual) => state = actual,
                    }
                }
                State::Exec => {
                    return Err(Error::NotSchedulable("fiber is already executing"));
                }
                State::Term | State::Except => {
                    return Err(Error::NotSchedulable("fiber has terminated; reset it first"));
                }
            }
        }
    }

    /// Mark a fiber suspended inside `call`/`yield_to` as executing
    /// again. Only its callee chain can resume it, so a plain store
    /// suffices.
    fn seize_for_return(&self) {
        self.store_state(State::Exec);
    }

    fn store_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn propagate_panic(self: &Arc<Fiber>) -> Result<()> {
        if self.state() == State::Except
            && let Some(payload) = lock(&self.panic_payload).take()
        {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    pub(crate) fn fls_get<T: Clone + Default + Send + 'static>(&self, key: usize) -> T {
        lock(&self.fls)
            .get(&key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn fls_set<T: Clone + Default + Send + 'static>(&self, key: usize, value: T) {
        lock(&self.fls).insert(key, Box::new(value));
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transfer control from `from` (the currently executing fiber) to `to`.
/// The caller must have claimed `to` (state set to `Exec`).
fn switch_fibers(from: &Arc<Fiber>, to: &Arc<Fiber>) {
    switch_raw(Arc::as_ptr(from), to.clone());
}

/// `to` is moved into this thread's CURRENT slot, which keeps it alive
/// across the switch; taking it by value (not borrow) matters for the
/// terminal switch in `fiber_entry`, which never returns to drop a
/// local.
fn switch_raw(from: *const Fiber, to: Arc<Fiber>) {
    // Wait until the target's previous switch has finished saving its
    // context; pairs with the release store in `finish_switch`.
    while to.running.load(Ordering::Acquire) {
        std::hint::spin_loop();
    }
    to.running.store(true, Ordering::Relaxed);
    let to_context = to.context.get();
    CURRENT.with(|c| *c.borrow_mut() = Some(to));
    PREVIOUS.with(|p| p.set(from));
    unsafe {
        let save = (*from).context.get();
        context::swap(save, to_context);
    }
    finish_switch();
}

/// First action after control arrives on a thread, possibly a different
/// one than the fiber suspended on: publish that the previous fiber's
/// context is fully saved. Thread-locals must be re-read here, never
/// cached across the switch.
#[inline(never)]
fn finish_switch() {
    let prev = PREVIOUS.with(|p| p.replace(ptr::null()));
    if !prev.is_null() {
        unsafe {
            (*prev).running.store(false, Ordering::Release);
        }
    }
}

/// Entry point every fresh fiber context is seeded with; runs the entry,
/// records the outcome, and makes the terminal switch back to the outer
/// fiber. Never returns — the stack is reseeded by `reset`, not unwound.
pub(crate) unsafe extern "C" fn fiber_entry(fiber: *const ()) -> ! {
    let fiber = unsafe { &*(fiber as *const Fiber) };
    finish_switch();

    let entry = lock(&fiber.entry).take();
    let outcome = match entry {
        Some(f) => panic::catch_unwind(AssertUnwindSafe(f)),
        None => Ok(()),
    };
    let next_state = match outcome {
        Ok(()) => State::Term,
        Err(payload) => {
            *lock(&fiber.panic_payload) = Some(payload);
            State::Except
        }
    };

    let outer = lock(&fiber.outer).take();
    fiber.store_state(next_state);
    match outer {
        Some(target) => {
            target.seize_for_return();
            switch_raw(fiber as *const Fiber, target);
            unreachable!("terminated fiber resumed without reset");
        }
        None => unreachable!("fiber terminated with no outer fiber"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_entry_on_call() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(fiber.state(), State::Init);
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_returns_to_caller_each_time() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(move || {
            l.lock().unwrap().push("a");
            Fiber::yield_now();
            l.lock().unwrap().push("b");
            Fiber::yield_now();
            l.lock().unwrap().push("c");
        })
        .unwrap();

        fiber.call().unwrap();
        log.lock().unwrap().push("1");
        assert_eq!(fiber.state(), State::Hold);
        fiber.call().unwrap();
        log.lock().unwrap().push("2");
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), ["a", "1", "b", "2", "c"]);
    }

    #[test]
    fn call_self_is_not_schedulable() {
        let fiber = Fiber::new(|| {
            let me = Fiber::current();
            assert!(matches!(me.call(), Err(Error::NotSchedulable(_))));
        })
        .unwrap();
        fiber.call().unwrap();
    }

    #[test]
    fn call_terminated_without_reset_fails() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.call().unwrap();
        assert!(matches!(fiber.call(), Err(Error::NotSchedulable(_))));
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let fiber = {
            let h = hits.clone();
            Fiber::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        fiber.call().unwrap();

        let h = hits.clone();
        fiber
            .reset(move || {
                h.fetch_add(10, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(fiber.state(), State::Init);
        fiber.call().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn reset_requires_termination() {
        let fiber = Fiber::new(|| {
            Fiber::yield_now();
        })
        .unwrap();
        fiber.call().unwrap();
        assert!(fiber.reset(|| {}).is_err());
        fiber.call().unwrap();
    }

    #[test]
    fn panic_propagates_to_caller() {
        let fiber = Fiber::new(|| panic!("boom")).unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
        assert!(result.is_err());
        // State observed after the panic was re-raised.
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn except_fiber_can_be_reset() {
        let fiber = Fiber::new(|| panic!("boom")).unwrap();
        let _ = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
        fiber.reset(|| {}).unwrap();
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn yield_to_transfers_between_fibers() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let l2 = log.clone();
        let second = Fiber::new(move || {
            l2.lock().unwrap().push(2);
        })
        .unwrap();

        let l1 = log.clone();
        let s = second.clone();
        let first = Fiber::new(move || {
            l1.lock().unwrap().push(1);
            Fiber::yield_to(&s).unwrap();
            l1.lock().unwrap().push(3);
        })
        .unwrap();

        first.call().unwrap();
        assert_eq!(*log.lock().unwrap(), [1, 2, 3]);
    }

    #[test]
    fn nested_calls_unwind_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let li = log.clone();
        let inner = Fiber::new(move || {
            li.lock().unwrap().push("inner");
        })
        .unwrap();
        let lo = log.clone();
        let outer = Fiber::new(move || {
            lo.lock().unwrap().push("outer-pre");
            inner.call().unwrap();
            lo.lock().unwrap().push("outer-post");
        })
        .unwrap();
        outer.call().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["outer-pre", "inner", "outer-post"]
        );
    }

    #[test]
    fn current_is_stable_within_a_fiber() {
        let fiber = Fiber::new(|| {
            let a = Fiber::current();
            Fiber::yield_now();
            let b = Fiber::current();
            assert!(Arc::ptr_eq(&a, &b));
        })
        .unwrap();
        fiber.call().unwrap();
        fiber.call().unwrap();
    }

    #[test]
    fn root_fiber_is_exec() {
        let root = Fiber::current();
        assert_eq!(root.state(), State::Exec);
        assert!(root.reset(|| {}).is_err());
    }

    #[test]
    fn resumes_on_another_thread() {
        let fiber = Fiber::new(|| {
            let before = std::thread::current().id();
            Fiber::yield_now();
            // May or may not be the same thread; the point is we got here.
            let _ = before;
            Fiber::yield_now();
        })
        .unwrap();

        fiber.call().unwrap();
        let f = fiber.clone();
        std::thread::spawn(move || {
            f.call().unwrap();
        })
        .join()
        .unwrap();
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Term);
    }
}
