// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lock-free multi-producer lists.
//!
//! Two variants share one interface:
//! - `stack`: Treiber stack. Any number of pushers and poppers; LIFO.
//!   Backs the scheduler ready-queue where order doesn't matter.
//! - `queue`: head/tail queue. Any number of pushers, one logical
//!   consumer; FIFO, with O(1) splicing of a whole queue onto another.
//!   Backs the batch wait-queue and the main-thread hand-off.
//!
//! Both reclaim long chains iteratively, so a detached chain of a million
//! nodes drops without recursion.

pub mod queue;
pub mod stack;

pub use queue::SharedQueue;
pub use stack::SharedStack;

/// Common surface of the two list variants.
pub trait SharedList<T>: Send + Sync {
    /// Link `value` into the list. Never blocks; retries until it wins.
    fn push(&self, value: T);

    /// Remove one value, or `None` if the list is empty.
    fn pop(&self) -> Option<T>;

    /// Atomically detach every linked value.
    fn drain_all(&self) -> Vec<T>;

    fn is_empty(&self) -> bool;
}

impl<T: Send> SharedList<T> for SharedStack<T> {
    fn push(&self, value: T) {
        SharedStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        SharedStack::pop(self)
    }

    fn drain_all(&self) -> Vec<T> {
        SharedStack::drain_all(self)
    }

    fn is_empty(&self) -> bool {
        SharedStack::is_empty(self)
    }
}

impl<T: Send> SharedList<T> for SharedQueue<T> {
    fn push(&self, value: T) {
        SharedQueue::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        SharedQueue::pop(self)
    }

    fn drain_all(&self) -> Vec<T> {
        SharedQueue::drain_all(self)
    }

    fn is_empty(&self) -> bool {
        SharedQueue::is_empty(self)
    }
}
