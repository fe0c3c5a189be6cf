// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspendable units of work.
//!
//! - `Task<T>`: the awaitable operation. A boxed future whose panics are
//!   captured and replayed to the awaiter as `TaskError`.
//! - `raw`: root task state machine; its waker resumes it in place.
//! - `slot`: result slot with a single continuation.
//! - `handle`: `JoinHandle<T>` for tasks started on the scheduler.

pub mod handle;
pub(crate) mod raw;
pub(crate) mod slot;

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::TaskError;

pub use handle::JoinHandle;

/// One in-flight suspendable computation producing `T` or an error.
///
/// Awaiting a `Task` drives its body inline on the awaiting task. If the
/// body suspends, the awaiter's waker is what gets resumed later; when
/// the body finishes, the awaiter continues without a scheduler trip.
/// A panic in the body is stored and handed to the awaiter as
/// `Err(TaskError::Panicked)`; it does not unwind into the caller.
///
/// Not `Clone`: one owner, one awaiter.
#[must_use = "a Task does nothing until awaited"]
pub struct Task<T> {
    future: Option<Pin<Box<dyn Future<Output = T> + Send + 'static>>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            future: Some(Box::pin(future)),
        }
    }

    /// A task that is complete on first poll.
    pub fn ready(value: T) -> Self {
        Self::new(std::future::ready(value))
    }
}

impl<T> Task<T> {
    /// True once the result has been handed out.
    pub fn is_complete(&self) -> bool {
        self.future.is_none()
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(fut) = this.future.as_mut() else {
            return Poll::Ready(Err(TaskError::ResultTaken));
        };

        match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.future = None;
                Poll::Ready(Ok(value))
            }
            Err(payload) => {
                this.future = None;
                Poll::Ready(Err(TaskError::from_panic(payload)))
            }
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    struct Noop;

    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    fn poll_once<F: Future + Unpin>(f: &mut F) -> Poll<F::Output> {
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        Pin::new(f).poll(&mut cx)
    }

    #[test]
    fn ready_completes_on_first_poll() {
        let mut t = Task::ready(7);
        assert_eq!(poll_once(&mut t), Poll::Ready(Ok(7)));
        assert!(t.is_complete());
        assert_eq!(poll_once(&mut t), Poll::Ready(Err(TaskError::ResultTaken)));
    }

    #[test]
    fn chained_tasks_propagate_values() {
        let inner = Task::new(async { 20 });
        let mut outer = Task::new(async move {
            let v = inner.await?;
            Ok::<_, TaskError>(v + 1)
        });
        assert_eq!(poll_once(&mut outer), Poll::Ready(Ok(Ok(21))));
    }

    #[test]
    fn panic_is_captured_and_replayed_once() {
        let inner: Task<i32> = Task::new(async { panic!("kaboom") });
        let mut outer = Task::new(async move { inner.await });
        match poll_once(&mut outer) {
            Poll::Ready(Ok(Err(TaskError::Panicked(msg)))) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn error_propagates_through_question_mark() {
        let failing: Task<u8> = Task::new(async { panic!("deep") });
        let mut outer = Task::new(async move {
            let v = failing.await?;
            Ok::<_, TaskError>(v)
        });
        assert!(matches!(
            poll_once(&mut outer),
            Poll::Ready(Ok(Err(TaskError::Panicked(_))))
        ));
    }
}
