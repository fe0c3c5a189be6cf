// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Treiber stack.
//!
//! Producers CAS a new node onto the head; poppers CAS the head forward.
//! Popped and drained nodes go through epoch-based reclamation so a
//! popper that lost a race never reads a freed `next`.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

struct Node<T> {
    /// Moved out exactly once: by `pop`, `drain_all`, or the stack's `Drop`.
    value: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

/// Lock-free LIFO list. No ordering between unrelated pushes.
pub struct SharedStack<T> {
    head: Atomic<Node<T>>,
}

// Values cross threads by move only; nodes are never shared by reference.
unsafe impl<T: Send> Send for SharedStack<T> {}
unsafe impl<T: Send> Sync for SharedStack<T> {}

impl<T> SharedStack<T> {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Push onto the head. Retries the CAS until it wins.
    pub fn push(&self, value: T) {
        let mut node = Owned::new(Node {
            value: ManuallyDrop::new(value),
            next: Atomic::null(),
        });
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    /// Pop the most recently pushed value.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: the node can't be reclaimed while we're pinned.
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Relaxed, &guard);

            if self
                .head
                .compare_exchange(head, next, Ordering::Relaxed, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // SAFETY: winning the CAS unlinked the node; we are the only
                // thread that moves its value out.
                unsafe {
                    let value = ptr::read(&*node.value);
                    guard.defer_destroy(head);
                    return Some(value);
                }
            }
        }
    }

    /// Swap the head with empty and collect the detached chain, newest
    /// first. Walks the chain in a loop.
    pub fn drain_all(&self) -> Vec<T> {
        let guard = epoch::pin();
        let mut cur = self.head.swap(Shared::null(), Ordering::Acquire, &guard);
        let mut out = Vec::new();

        // SAFETY: the swap detached the whole chain; concurrent poppers can
        // still hold pointers into it, hence deferred destruction.
        while let Some(node) = unsafe { cur.as_ref() } {
            let next = node.next.load(Ordering::Relaxed, &guard);
            unsafe {
                out.push(ptr::read(&*node.value));
                guard.defer_destroy(cur);
            }
            cur = next;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Default for SharedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SharedStack<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the nodes.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while let Some(node) = cur.as_ref() {
                let next = node.next.load(Ordering::Relaxed, guard);
                let mut owned = cur.into_owned();
                ManuallyDrop::drop(&mut owned.value);
                drop(owned);
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn push_pop_lifo() {
        let s = SharedStack::new();
        s.push(1);
        s.push(2);
        s.push(3);
        assert_eq!(s.pop(), Some(3));
        assert_eq!(s.pop(), Some(2));
        assert_eq!(s.pop(), Some(1));
        assert_eq!(s.pop(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn drain_all_newest_first() {
        let s = SharedStack::new();
        for i in 0..5 {
            s.push(i);
        }
        assert_eq!(s.drain_all(), vec![4, 3, 2, 1, 0]);
        assert!(s.is_empty());
        assert!(s.drain_all().is_empty());
    }

    #[test]
    fn drop_long_chain() {
        let s = SharedStack::new();
        for i in 0..1_000_000u32 {
            s.push(i);
        }
        drop(s);
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn values_dropped_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = SharedStack::new();
        for _ in 0..10 {
            s.push(Counted(drops.clone()));
        }
        let popped = s.pop();
        let drained = s.drain_all();
        assert_eq!(drained.len(), 9);
        for _ in 0..5 {
            s.push(Counted(drops.clone()));
        }
        drop(popped);
        drop(drained);
        drop(s);
        assert_eq!(drops.load(Ordering::Relaxed), 15);
    }
}
