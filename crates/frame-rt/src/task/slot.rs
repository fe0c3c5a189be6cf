// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Result slot with a single continuation.
//!
//! Shared between whoever completes an operation and whoever reads it.
//! The reader either finds the result already there (ready fast path) or
//! parks its waker in the one continuation slot.

use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;

struct SlotState<T> {
    result: Option<Result<T, TaskError>>,
    continuation: Option<Waker>,
    complete: bool,
    /// No reader will ever look at the result.
    detached: bool,
}

pub(crate) struct ResultSlot<T> {
    state: Mutex<SlotState<T>>,
    /// Signalled on completion for blocking readers.
    done: Condvar,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                result: None,
                continuation: None,
                complete: false,
                detached: false,
            }),
            done: Condvar::new(),
        }
    }

    /// Store the result and resume the continuation, if any, on this
    /// thread. Returns the error when the slot was detached, since nobody
    /// else will see it.
    pub fn complete(&self, result: Result<T, TaskError>) -> Option<TaskError> {
        let (continuation, unobserved) = {
            let mut st = self.state.lock();
            if st.complete {
                return None;
            }
            st.complete = true;
            let unobserved = if st.detached {
                result.err()
            } else {
                st.result = Some(result);
                None
            };
            self.done.notify_all();
            (st.continuation.take(), unobserved)
        };

        if let Some(waker) = continuation {
            waker.wake();
        }
        unobserved
    }

    /// Register `waker` as the continuation. Replaces a previous waker of
    /// the same reader.
    pub fn set_continuation(&self, waker: Waker) {
        let mut st = self.state.lock();
        if !st.complete && !st.detached {
            st.continuation = Some(waker);
        }
    }

    /// Take the result, or park `cx`'s waker.
    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T, TaskError>> {
        let mut st = self.state.lock();
        if st.complete {
            return Poll::Ready(st.result.take().unwrap_or(Err(TaskError::ResultTaken)));
        }
        match &st.continuation {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => st.continuation = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Block the calling OS thread until completion, then take the result.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut st = self.state.lock();
        while !st.complete {
            self.done.wait(&mut st);
        }
        st.result.take().unwrap_or(Err(TaskError::ResultTaken))
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        let mut st = self.state.lock();
        if st.complete {
            Some(st.result.take().unwrap_or(Err(TaskError::ResultTaken)))
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Give up on reading. Returns an already stored error that would now
    /// go unseen.
    pub fn detach(&self) -> Option<TaskError> {
        let mut st = self.state.lock();
        st.detached = true;
        st.continuation = None;
        match st.result.take() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let c = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (c.clone(), Waker::from(c))
    }

    #[test]
    fn ready_fast_path() {
        let slot = ResultSlot::new();
        slot.complete(Ok(5));
        let (count, waker) = counting();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(slot.poll_take(&mut cx), Poll::Ready(Ok(5)));
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn continuation_resumed_exactly_once() {
        let slot = ResultSlot::new();
        let (count, waker) = counting();
        let mut cx = Context::from_waker(&waker);

        assert!(slot.poll_take(&mut cx).is_pending());
        // Re-polling with the same waker does not add a continuation.
        assert!(slot.poll_take(&mut cx).is_pending());

        slot.complete(Ok("done"));
        slot.complete(Ok("again"));
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert_eq!(slot.poll_take(&mut cx), Poll::Ready(Ok("done")));
    }

    #[test]
    fn no_continuation_is_noop() {
        let slot: ResultSlot<()> = ResultSlot::new();
        assert!(slot.complete(Ok(())).is_none());
        assert!(slot.is_complete());
    }

    #[test]
    fn second_read_reports_taken() {
        let slot = ResultSlot::new();
        slot.complete(Ok(1));
        assert_eq!(slot.try_take(), Some(Ok(1)));
        assert_eq!(slot.try_take(), Some(Err(TaskError::ResultTaken)));
    }

    #[test]
    fn detached_error_is_returned_to_completer() {
        let slot: ResultSlot<i32> = ResultSlot::new();
        assert!(slot.detach().is_none());
        let fault = slot.complete(Err(TaskError::Panicked("x".into())));
        assert_eq!(fault, Some(TaskError::Panicked("x".into())));
    }

    #[test]
    fn detach_after_error_returns_it() {
        let slot: ResultSlot<i32> = ResultSlot::new();
        slot.complete(Err(TaskError::Abandoned));
        assert_eq!(slot.detach(), Some(TaskError::Abandoned));
    }

    #[test]
    fn blocking_wait_across_threads() {
        let slot = Arc::new(ResultSlot::new());
        let s = slot.clone();
        let t = std::thread::spawn(move || s.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        slot.complete(Ok(42));
        assert_eq!(t.join().unwrap(), Ok(42));
    }
}
