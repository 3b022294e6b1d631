//! The cooperative M:1 thread scheduler.
//!
//! One [`Scheduler`] lives per OS thread (in a `thread_local`): its ready
//! queue, thread table and `current_thread`/`next_to_destroy` state are
//! all scoped to that one process-equivalent. `init` must be called
//! before any other function in this module; `cleanup` tears the
//! scheduler down and may only be called from the thread `init` was
//! called on (tid 0).

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::trace;

use crate::context::{self, SavedContext, Stack};
use crate::error::JoinError;
use crate::queue::Queue;

/// A thread handle. Monotonically increasing per scheduler, never reused.
pub type Tid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Working,
    Waiting,
    Done,
}

struct Tcb {
    status: Status,
    observer: Option<Tid>,
    context: SavedContext,
    /// `None` for tid 0, which runs on the OS thread's own stack.
    stack: Option<Stack>,
}

struct Scheduler {
    threads: HashMap<Tid, Tcb>,
    ready: Queue<Tid>,
    current: Tid,
    next_id: Tid,
    next_to_destroy: Option<Tid>,
}

impl Scheduler {
    fn new() -> Self {
        let mut threads = HashMap::new();
        threads.insert(
            0,
            Tcb {
                status: Status::Working,
                observer: None,
                context: SavedContext::placeholder(),
                stack: None,
            },
        );
        Self {
            threads,
            ready: Queue::new(),
            current: 0,
            next_id: 1,
            next_to_destroy: None,
        }
    }

    fn tcb(&self, tid: Tid) -> Option<&Tcb> {
        self.threads.get(&tid)
    }

    fn tcb_mut(&mut self, tid: Tid) -> Option<&mut Tcb> {
        self.threads.get_mut(&tid)
    }

    /// Floyd's cycle detection over the `observer` chain starting at
    /// `start`: a cycle means every thread in it is waiting on a join
    /// that can never be satisfied.
    fn observer_chain_has_cycle(&self, start: Tid) -> bool {
        let next = |tid: Tid| self.tcb(tid).and_then(|t| t.observer);
        let (mut slow, mut fast) = (next(start), next(start).and_then(next));
        loop {
            let (Some(s), Some(f)) = (slow, fast) else {
                return false;
            };
            if s == f {
                return true;
            }
            slow = next(s);
            fast = next(f).and_then(next);
        }
    }

    fn destroy(&mut self, tid: Tid) {
        self.threads.remove(&tid);
    }
}

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let mut guard = cell.borrow_mut();
        let scheduler = guard
            .as_mut()
            .expect("x20_rt::init() must be called before using the scheduler");
        f(scheduler)
    })
}

/// Initializes the scheduler for the calling OS thread. Must be called
/// exactly once before `thread_create`/`thread_join`/`thread_yield`.
pub fn init() {
    SCHEDULER.with(|cell| {
        let mut guard = cell.borrow_mut();
        assert!(guard.is_none(), "x20_rt::init() called twice");
        *guard = Some(Scheduler::new());
    });
}

/// The currently running thread's id.
pub fn thread_self() -> Tid {
    with_scheduler(|s| s.current)
}

const DEFAULT_STACK_BYTES: usize = 64 * 1024;

/// Creates a new thread running `work`, scheduled but not yet running.
///
/// `work` is not required to be `Send`: every thread this scheduler
/// manages runs on the single OS thread that called [`init`], so a
/// closure built here never crosses a real thread boundary, and state
/// shared between threads via [`crate::sync::Mutex`] is itself built on
/// `RefCell`, which is not `Sync`.
pub fn thread_create(work: impl FnOnce() + 'static) -> Tid {
    with_scheduler(|s| {
        let tid = s.next_id;
        s.next_id += 1;
        let stack = Stack::new(DEFAULT_STACK_BYTES);
        let context = unsafe { context::prepare_stack(&stack, Box::new(work)) };
        s.threads.insert(
            tid,
            Tcb {
                status: Status::Working,
                observer: None,
                context,
                stack: Some(stack),
            },
        );
        s.ready.push(tid);
        trace!(tid, "thread created");
        tid
    })
}

/// Yields the processor to the next ready thread. If the ready queue is
/// empty and the caller is still `Working`, this is a no-op: there is
/// simply nobody else to hand the processor to, and the caller keeps
/// running. It is only fatal if the ready queue is empty and the caller
/// is *not* `Working` (blocked on a join or a `park`) — then nothing in
/// the system will ever make it runnable again, a genuine scheduler
/// deadlock rather than a recoverable condition.
pub fn thread_yield() {
    let switch: Option<(*mut SavedContext, *const SavedContext)> = with_scheduler(|s| {
        let next = loop {
            match s.ready.pop() {
                Some(tid) if s.tcb(tid).map(|t| t.status) == Some(Status::Working) => break tid,
                Some(_) => continue, // stale entry for a thread that changed state
                None => {
                    let current_working =
                        s.tcb(s.current).map(|t| t.status) == Some(Status::Working);
                    assert!(
                        current_working,
                        "deadlock: no runnable thread and the current thread is blocked"
                    );
                    return None;
                }
            }
        };

        if let Some(stale) = s.next_to_destroy.take() {
            s.destroy(stale);
        }

        let current = s.current;
        let requeue = s.tcb(current).map(|t| t.status) == Some(Status::Working);
        if requeue {
            s.ready.push(current);
        }
        s.current = next;

        let from_ctx = &mut s.tcb_mut(current).unwrap().context as *mut SavedContext;
        let to_ctx = &s.tcb(next).unwrap().context as *const SavedContext;
        Some((from_ctx, to_ctx))
    });

    if let Some((from_ctx, to_ctx)) = switch {
        unsafe { context::switch(&mut *from_ctx, &*to_ctx) };
    }
}

/// Marks the calling thread as not runnable and yields. Used by
/// [`crate::sync::Mutex`] and [`crate::sync::Condvar`] to block without
/// going through the join/observer machinery. The caller is responsible
/// for arranging a later [`wake`].
pub fn park() {
    with_scheduler(|s| {
        let current = s.current;
        s.tcb_mut(current).unwrap().status = Status::Waiting;
    });
    thread_yield();
}

/// Marks a parked thread runnable again and enqueues it. Per the hand-off
/// discipline `Mutex`/`Condvar` rely on, the caller must already have
/// transferred whatever invariant (lock ownership, queue membership) the
/// woken thread expects to hold the instant it resumes.
pub fn wake(tid: Tid) {
    with_scheduler(|s| {
        if let Some(tcb) = s.tcb_mut(tid) {
            tcb.status = Status::Working;
            s.ready.push(tid);
        }
    });
}

/// Blocks the caller until `target` finishes. Returns [`JoinError`] for
/// an unknown tid, a self-join, joining an already-observed thread, or
/// a would-be cycle in the observer chain: a cycle is detected before
/// suspending, so the caller is left runnable rather than stuck.
/// The *only* fatal condition in this module is [`thread_yield`] finding
/// no runnable thread while the current one is still alive — a scheduler
/// deadlock no caller-level revert can fix, since nothing would ever
/// resume the call to unwind it.
pub fn thread_join(target: Tid) -> Result<(), JoinError> {
    let current = thread_self();
    if target == current {
        return Err(JoinError::SelfJoin);
    }

    let should_yield_and_wait = with_scheduler(|s| {
        if !s.threads.contains_key(&target) {
            return Err(JoinError::NotFound);
        }
        if s.tcb(target).unwrap().status == Status::Done {
            return Ok(false);
        }
        if s.tcb(target).unwrap().observer.is_some() {
            return Err(JoinError::AlreadyObserved);
        }
        // Tentatively link the observer chain, check for a cycle, and
        // revert both fields if one would form — the caller is never
        // suspended on a join that can't resolve.
        s.tcb_mut(target).unwrap().observer = Some(current);
        if s.observer_chain_has_cycle(current) {
            s.tcb_mut(target).unwrap().observer = None;
            return Err(JoinError::Deadlock);
        }
        s.tcb_mut(current).unwrap().status = Status::Waiting;
        Ok(true)
    })?;

    // Whether the target was already `Done` or we just became `Waiting`
    // on it, the calling thread must yield at least once before this
    // call returns — either to let some other thread run, or because we
    // are no longer runnable ourselves.
    let _ = should_yield_and_wait;
    thread_yield();
    Ok(())
}

/// Ends the calling thread. Never returns: it always yields away, and
/// nothing ever schedules a `Done` thread again.
pub fn thread_terminate() -> ! {
    with_scheduler(|s| {
        let current = s.current;
        s.tcb_mut(current).unwrap().status = Status::Done;
        if let Some(observer) = s.tcb(current).unwrap().observer {
            if let Some(observer_tcb) = s.tcb_mut(observer) {
                observer_tcb.status = Status::Working;
                s.ready.push(observer);
            }
        }
        // A thread cannot free its own stack while executing on it; the
        // *next* yield (from whichever thread runs after us) frees it.
        if let Some(previous) = s.next_to_destroy.replace(current) {
            s.destroy(previous);
        }
    });
    thread_yield();
    unreachable!("a Done thread is never rescheduled")
}

/// Tears the scheduler down. May only be called from tid 0 (the thread
/// that called `init`), with every other thread already `Done`.
pub fn thread_cleanup() {
    with_scheduler(|s| {
        assert_eq!(s.current, 0, "thread_cleanup must run on the root thread");
        let stragglers: Vec<Tid> = s
            .threads
            .keys()
            .copied()
            .filter(|&tid| tid != 0)
            .collect();
        for tid in stragglers {
            assert_eq!(
                s.tcb(tid).unwrap().status,
                Status::Done,
                "thread_cleanup called with thread {tid} still alive"
            );
            s.destroy(tid);
        }
        s.ready = Queue::new();
        s.next_to_destroy = None;
    });
    SCHEDULER.with(|cell| *cell.borrow_mut() = None);
}
