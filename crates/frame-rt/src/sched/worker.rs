// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker threads and the ready-queue records they execute.

use std::cell::Cell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, trace, warn};

use crate::error::TaskError;
use crate::group::Job;

use super::Shared;

thread_local! {
    /// Id of the scheduler this thread works for, 0 if none.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn current_worker_of() -> usize {
    WORKER_OF.with(|w| w.get())
}

/// A continuation parked until some thread picks it up.
pub(crate) struct Hop {
    fired: AtomicBool,
    waker: Waker,
}

impl Hop {
    pub fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            waker,
        })
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resume the continuation on the calling thread.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.waker.wake_by_ref();
    }
}

/// Node payload of the ready-queue.
pub(crate) enum WorkRecord {
    /// Resume a suspended continuation here.
    Resume(Arc<Hop>),
    /// Run a plain job.
    Job(Job),
}

impl WorkRecord {
    pub fn run(self) {
        match self {
            WorkRecord::Resume(hop) => hop.fire(),
            WorkRecord::Job(job) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    let err = TaskError::from_panic(payload);
                    warn!(error = %err, "worker job panicked");
                }
            }
        }
    }
}

/// Worker main loop: `WaitingForWork → Executing → WaitingForWork`.
pub(crate) fn worker_loop(id: usize, shared: Arc<Shared>) {
    WORKER_OF.with(|w| w.set(shared.id));
    debug!(worker = id, "worker started");

    loop {
        if let Some(record) = shared.ready.pop() {
            trace!(worker = id, "executing record");
            record.run();
            continue;
        }

        if shared.is_shut_down() {
            break;
        }

        // Park until new work arrives. Emptiness is re-checked under the
        // lock the pusher takes before notifying, so no wakeup is lost.
        let (lock, cvar) = &shared.work_available;
        let mut guard = lock.lock();
        while shared.ready.is_empty() && !shared.is_shut_down() {
            cvar.wait(&mut guard);
        }
    }

    WORKER_OF.with(|w| w.set(0));
    debug!(worker = id, "worker exiting");
}

/// Suspension point that continues on one of the scheduler's workers.
#[must_use = "futures do nothing unless awaited"]
pub struct RunOnWorker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) hop: Option<Arc<Hop>>,
}

impl Future for RunOnWorker {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(hop) = &self.hop {
            if !hop.fired() {
                return Poll::Pending;
            }
            if self.shared.on_worker() {
                return Poll::Ready(());
            }
            // Resumed somewhere else; go around again.
        }
        let hop = Hop::new(cx.waker().clone());
        self.hop = Some(hop.clone());
        self.shared.push_ready(WorkRecord::Resume(hop));
        Poll::Pending
    }
}

/// Give up the current thread once: requeue on the ready-queue and
/// continue on whichever worker pops it.
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    pub(crate) shared: Arc<Shared>,
    pub(crate) hop: Option<Arc<Hop>>,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(hop) = &self.hop {
            return if hop.fired() {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }
        let hop = Hop::new(cx.waker().clone());
        self.hop = Some(hop.clone());
        self.shared.push_ready(WorkRecord::Resume(hop));
        Poll::Pending
    }
}
