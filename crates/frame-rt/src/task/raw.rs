// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Root task: an owned state machine around one boxed future.
//!
//! The task's waker *is* its continuation. Waking resumes the future on
//! the waking thread, so a worker that pops a hop record, the main loop
//! draining its queue, or a batch consumer answering a waiter each run the
//! continuation directly without another scheduling trip.
//!
//! Resumption never nests. The first resume on a thread becomes that
//! thread's trampoline: it polls its task, then keeps polling whatever was
//! woken meanwhile from a thread-local run-next list until the list is
//! empty. A wake issued while the thread is already polling (or inside a
//! `defer_wakes` scope) only lands on that list. A chain of a hundred
//! thousand tasks, each awaiting the previous one, unwinds in one frame.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Suspended, nobody polling.
    Idle = 0,
    /// Being polled.
    Running = 1,
    /// Woken by its own poller mid-poll; poll again before going idle.
    Notified = 2,
    /// Future finished and dropped.
    Complete = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Notified,
            _ => Self::Complete,
        }
    }
}

/// Type-erased root future. Typed results travel through a `ResultSlot`.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Re-enqueue callback for a deferred wake whose task is busy elsewhere.
pub(crate) type ScheduleFn = Arc<dyn Fn(Arc<RawTask>) + Send + Sync>;

struct Trampoline {
    /// Frames on this thread that will drain `run_next` before returning.
    active: Cell<usize>,
    run_next: RefCell<VecDeque<Arc<RawTask>>>,
}

thread_local! {
    static TRAMPOLINE: Trampoline = const {
        Trampoline {
            active: Cell::new(0),
            run_next: RefCell::new(VecDeque::new()),
        }
    };
}

struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        TRAMPOLINE.with(|t| t.active.set(t.active.get() + 1));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|t| t.active.set(t.active.get() - 1));
    }
}

fn trampoline_active() -> bool {
    TRAMPOLINE.with(|t| t.active.get() > 0)
}

fn push_run_next(task: Arc<RawTask>) {
    TRAMPOLINE.with(|t| t.run_next.borrow_mut().push_back(task));
}

fn pop_run_next() -> Option<Arc<RawTask>> {
    TRAMPOLINE.with(|t| t.run_next.borrow_mut().pop_front())
}

/// Poll every queued task, oldest first, including ones queued while
/// draining. Caller must hold an `ActiveGuard`.
fn drain_run_next() {
    while let Some(task) = pop_run_next() {
        if task.claim(true) {
            task.run();
        }
    }
}

/// Run `f` with wakes on this thread deferred until it returns, then
/// resume them. Used where `f` holds a lock a woken task may need.
pub(crate) fn defer_wakes<R>(f: impl FnOnce() -> R) -> R {
    if trampoline_active() {
        // An outer frame drains once it is back in control.
        return f();
    }
    let _active = ActiveGuard::enter();
    let out = f();
    drain_run_next();
    out
}

pub(crate) struct RawTask {
    state: AtomicU8,
    /// Thread polling right now. Set only while Running/Notified.
    poller: Mutex<Option<ThreadId>>,
    future: Mutex<Option<BoxFuture>>,
    schedule: Option<ScheduleFn>,
}

impl std::fmt::Debug for RawTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTask")
            .field("state", &self.state())
            .finish()
    }
}

impl RawTask {
    pub fn new(future: BoxFuture, schedule: Option<ScheduleFn>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TaskState::Idle as u8),
            poller: Mutex::new(None),
            future: Mutex::new(Some(future)),
            schedule,
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn waker(self: &Arc<Self>) -> Waker {
        Waker::from(self.clone())
    }

    /// Resume the task on the calling thread.
    ///
    /// - Thread already trampolining: a self-wake marks the task Notified
    ///   so its poll loops once more; any other task is queued on run-next.
    /// - Otherwise this call is the trampoline: claim the task (waiting
    ///   for another thread's poll of it to return), poll it, then drain
    ///   run-next. Queued tasks that are busy elsewhere go to the schedule
    ///   callback instead of being waited for.
    /// - Complete: nothing.
    pub fn resume(self: &Arc<Self>) {
        if trampoline_active() {
            if !self.notify_if_polled_here() {
                push_run_next(self.clone());
            }
            return;
        }

        let _active = ActiveGuard::enter();
        if self.claim(false) {
            self.run();
        }
        drain_run_next();
    }

    fn notify_if_polled_here(&self) -> bool {
        if *self.poller.lock() != Some(thread::current().id()) {
            return false;
        }
        // Fails harmlessly if already Notified.
        let _ = self.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Notified as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        true
    }

    /// Move Idle→Running. With `hand_off`, a task being polled by another
    /// thread goes to the schedule callback (if any) rather than waiting.
    fn claim(self: &Arc<Self>, hand_off: bool) -> bool {
        let backoff = Backoff::new();
        loop {
            let prev = self.state.compare_exchange(
                TaskState::Idle as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            match prev {
                Ok(_) => return true,
                Err(s) if TaskState::from_u8(s) == TaskState::Complete => return false,
                Err(_) => {}
            }

            if hand_off {
                if let Some(schedule) = &self.schedule {
                    schedule(self.clone());
                    return false;
                }
            }
            backoff.snooze();
        }
    }

    fn run(self: &Arc<Self>) {
        let me = thread::current().id();
        let waker = self.waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            *self.poller.lock() = Some(me);
            let done = {
                let mut slot = self.future.lock();
                match slot.as_mut() {
                    Some(fut) => match fut.as_mut().poll(&mut cx) {
                        Poll::Ready(()) => {
                            *slot = None;
                            true
                        }
                        Poll::Pending => false,
                    },
                    None => true,
                }
            };
            *self.poller.lock() = None;

            if done {
                self.state
                    .store(TaskState::Complete as u8, Ordering::Release);
                return;
            }

            // Running→Idle. If a self-wake landed during poll the CAS sees
            // Notified and we go around again.
            let prev = self.state.compare_exchange(
                TaskState::Running as u8,
                TaskState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if prev.is_ok() {
                return;
            }
            self.state
                .store(TaskState::Running as u8, Ordering::Release);
        }
    }
}

impl Wake for RawTask {
    fn wake(self: Arc<Self>) {
        self.resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume();
    }
}
