// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Handle to a task started on the scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::TaskError;

use super::slot::ResultSlot;

/// Where an error goes when no handle will ever read it.
pub(crate) type FaultSink = Arc<dyn Fn(TaskError) + Send + Sync>;

/// Owning handle to a spawned task's result.
///
/// Await it from another task, or `join()` it from a plain thread.
/// Dropping it detaches the task: it keeps running, and if it fails the
/// error is reported to the scheduler's `run` instead.
pub struct JoinHandle<T> {
    slot: Arc<ResultSlot<T>>,
    on_unobserved: FaultSink,
    consumed: bool,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(slot: Arc<ResultSlot<T>>, on_unobserved: FaultSink) -> Self {
        Self {
            slot,
            on_unobserved,
            consumed: false,
        }
    }

    /// Block the calling OS thread until the task completes.
    ///
    /// Don't call this from inside a task; await the handle instead.
    pub fn join(mut self) -> Result<T, TaskError> {
        self.consumed = true;
        self.slot.wait()
    }

    /// Fire-and-forget.
    pub fn detach(self) {
        // Drop does the work.
    }

    /// Check if the task has completed (non-blocking).
    pub fn is_complete(&self) -> bool {
        self.slot.is_complete()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.consumed {
            return Poll::Ready(Err(TaskError::ResultTaken));
        }
        let out = self.slot.poll_take(cx);
        if out.is_ready() {
            self.consumed = true;
        }
        out
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        if let Some(fault) = self.slot.detach() {
            (self.on_unobserved)(fault);
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}
