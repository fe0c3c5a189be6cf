// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Batching wait-queue.
//!
//! Many independent tasks each park with a payload; one consumer takes
//! the whole pending set at once, answers it with a single grouped call
//! (one GPU submission answering many queries, say), then resumes every
//! waiter with its rewritten payload.
//!
//! ```text
//!   task A: queue.wait(a).await ─┐
//!   task B: queue.wait(b).await ─┼─> drain_all() -> [A, B, C]
//!   task C: queue.wait(c).await ─┘     answer, then item.resume() each
//! ```
//!
//! Batches come out in arrival order. Resumption runs the waiter's
//! continuation on the consumer's thread, in whatever order the consumer
//! resumes the items.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::TaskError;
use crate::list::SharedQueue;
use crate::task::slot::ResultSlot;

struct Entry<T> {
    payload: T,
    slot: Arc<ResultSlot<T>>,
}

/// Queue of parked waiters, each carrying one `T`.
pub struct BatchQueue<T> {
    pending: SharedQueue<Entry<T>>,
}

impl<T: Send> BatchQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: SharedQueue::new(),
        }
    }

    /// Park the calling task with `payload`. Always suspends; resolves to
    /// the payload as the consumer left it, or `TaskError::Abandoned` if
    /// the consumer dropped the item unanswered.
    pub fn wait(&self, payload: T) -> Waiter<'_, T> {
        Waiter {
            queue: self,
            payload: Some(payload),
            slot: Arc::new(ResultSlot::new()),
        }
    }

    /// Take every waiter that is fully enqueued right now. Meant for one
    /// consumer at a time.
    pub fn drain_all(&self) -> Vec<BatchItem<T>> {
        self.pending
            .drain_all()
            .into_iter()
            .map(|entry| BatchItem {
                payload: Some(entry.payload),
                slot: entry.slot,
            })
            .collect()
    }

    /// Waiters parked and not yet drained.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T: Send> Default for BatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by `BatchQueue::wait`.
#[must_use = "futures do nothing unless awaited"]
pub struct Waiter<'a, T> {
    queue: &'a BatchQueue<T>,
    /// Moved into the queue on first poll.
    payload: Option<T>,
    slot: Arc<ResultSlot<T>>,
}

// The payload is only ever moved, never pinned.
impl<T> Unpin for Waiter<'_, T> {}

impl<T: Send> Future for Waiter<'_, T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(payload) = self.payload.take() {
            // Continuation first, so an immediate answer still finds it.
            self.slot.set_continuation(cx.waker().clone());
            self.queue.pending.push(Entry {
                payload,
                slot: self.slot.clone(),
            });
            return Poll::Pending;
        }
        self.slot.poll_take(cx)
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if self.payload.is_none() {
            // Enqueued; the consumer's answer now goes nowhere.
            let _ = self.slot.detach();
        }
    }
}

/// One drained waiter. Answer it through `payload_mut`, then `resume`.
///
/// Dropping an item without resuming it resumes the waiter with
/// `TaskError::Abandoned`.
pub struct BatchItem<T> {
    /// `Some` until resumed.
    payload: Option<T>,
    slot: Arc<ResultSlot<T>>,
}

impl<T> BatchItem<T> {
    pub fn payload(&self) -> &T {
        self.payload.as_ref().expect("payload present until resumed")
    }

    pub fn payload_mut(&mut self) -> &mut T {
        self.payload.as_mut().expect("payload present until resumed")
    }

    /// Resume the waiter with the current payload, on this thread.
    pub fn resume(mut self) {
        if let Some(payload) = self.payload.take() {
            let _ = self.slot.complete(Ok(payload));
        }
    }

    /// Replace the payload and resume.
    pub fn complete(mut self, value: T) {
        self.payload = None;
        let _ = self.slot.complete(Ok(value));
    }
}

impl<T> Drop for BatchItem<T> {
    fn drop(&mut self) {
        if self.payload.take().is_some() {
            let _ = self.slot.complete(Err(TaskError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Wake, Waker};

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cx_pair() -> (Arc<CountingWaker>, Waker) {
        let c = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (c.clone(), Waker::from(c))
    }

    #[test]
    fn wait_always_suspends_first() {
        let q = BatchQueue::new();
        let (count, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        let mut w = q.wait(1);
        assert!(Pin::new(&mut w).poll(&mut cx).is_pending());
        assert_eq!(q.pending(), 1);
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn payload_is_in_out() {
        let q = BatchQueue::new();
        let (count, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        let mut w = q.wait(21);
        assert!(Pin::new(&mut w).poll(&mut cx).is_pending());

        let mut batch = q.drain_all();
        assert_eq!(batch.len(), 1);
        let mut item = batch.pop().unwrap();
        assert_eq!(*item.payload(), 21);
        *item.payload_mut() *= 2;
        item.resume();

        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut w).poll(&mut cx), Poll::Ready(Ok(42)));
    }

    #[test]
    fn batch_in_arrival_order() {
        let q = BatchQueue::new();
        let (_count, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        let mut waiters: Vec<_> = (0..5).map(|i| q.wait(i)).collect();
        for w in waiters.iter_mut() {
            assert!(Pin::new(w).poll(&mut cx).is_pending());
        }
        let batch = q.drain_all();
        let seen: Vec<i32> = batch.iter().map(|i| *i.payload()).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(q.drain_all().is_empty());
    }

    #[test]
    fn dropped_item_abandons_waiter() {
        let q = BatchQueue::new();
        let (count, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        let mut w = q.wait("query");
        assert!(Pin::new(&mut w).poll(&mut cx).is_pending());

        drop(q.drain_all());
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            Pin::new(&mut w).poll(&mut cx),
            Poll::Ready(Err(TaskError::Abandoned))
        );
    }

    #[test]
    fn complete_replaces_payload() {
        let q = BatchQueue::new();
        let (_count, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        let mut w = q.wait(String::from("in"));
        assert!(Pin::new(&mut w).poll(&mut cx).is_pending());
        for item in q.drain_all() {
            item.complete(String::from("out"));
        }
        assert_eq!(Pin::new(&mut w).poll(&mut cx), Poll::Ready(Ok("out".to_string())));
    }

    #[test]
    fn waiter_dropped_before_answer() {
        let q = BatchQueue::new();
        let (_count, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        let mut w = q.wait(5u8);
        assert!(Pin::new(&mut w).poll(&mut cx).is_pending());
        drop(w);
        for item in q.drain_all() {
            item.resume();
        }
    }
}
