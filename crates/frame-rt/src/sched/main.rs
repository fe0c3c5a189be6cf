// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Main-thread affinity.
//!
//! Continuations that must run on the thread that built the scheduler
//! (window/presentation context owner) go through a FIFO queue. The main
//! thread drains it whenever it is idle inside `Scheduler::run` or on an
//! explicit `pump_main`. Any number of requests may be pending at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake};

use parking_lot::{Condvar, Mutex};

use crate::list::SharedQueue;

use super::worker::Hop;
use super::Shared;

/// Latched wake-up for the main thread.
pub(crate) struct MainSignal {
    flag: Mutex<bool>,
    cvar: Condvar,
}

impl MainSignal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.flag.lock() = true;
        self.cvar.notify_one();
    }

    /// Block until notified, then clear the latch.
    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cvar.wait(&mut flag);
        }
        *flag = false;
    }
}

impl Wake for MainSignal {
    fn wake(self: Arc<Self>) {
        self.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify();
    }
}

pub(crate) struct MainQueue {
    hops: SharedQueue<Arc<Hop>>,
    pub signal: Arc<MainSignal>,
}

impl MainQueue {
    pub fn new() -> Self {
        Self {
            hops: SharedQueue::new(),
            signal: Arc::new(MainSignal::new()),
        }
    }

    pub fn push(&self, hop: Arc<Hop>) {
        self.hops.push(hop);
        self.signal.notify();
    }

    /// Resume every queued continuation on the calling thread, oldest
    /// first. Requests queued while draining wait for the next call.
    pub fn run_pending(&self) -> usize {
        let batch = self.hops.drain_all();
        let n = batch.len();
        for hop in batch {
            hop.fire();
        }
        n
    }

    pub fn discard(&self) -> usize {
        self.hops.drain_all().len()
    }
}

/// Suspension point that continues on the main thread.
#[must_use = "futures do nothing unless awaited"]
pub struct RunOnMain {
    pub(crate) shared: Arc<Shared>,
    pub(crate) hop: Option<Arc<Hop>>,
}

impl Future for RunOnMain {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(hop) = &self.hop {
            if !hop.fired() {
                return Poll::Pending;
            }
            if self.shared.is_main_thread() {
                return Poll::Ready(());
            }
        }
        let hop = Hop::new(cx.waker().clone());
        self.hop = Some(hop.clone());
        self.shared.main.push(hop);
        Poll::Pending
    }
}
