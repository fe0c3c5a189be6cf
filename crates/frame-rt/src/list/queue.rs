// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Head/tail queue with many producers and one logical consumer.
//!
//! Producers swap themselves in as the new tail and then link the old
//! tail to their node. The consumer walks from a stub node at the head.
//! A producer that has swapped but not yet linked makes its node (and
//! everything behind it) invisible to the consumer until the link lands;
//! those items stay queued for the next pop or drain.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    /// `None` only for the current stub.
    value: Option<T>,
}

impl<T> Node<T> {
    fn alloc(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Lock-free FIFO for producers. The consumer side sits behind a mutex
/// that is uncontended when only one consumer drains.
pub struct SharedQueue<T> {
    tail: CachePadded<AtomicPtr<Node<T>>>,
    /// Current stub. Everything after it is queued.
    head: Mutex<*mut Node<T>>,
    /// Pushed minus popped. Counted before linking, so it may briefly run
    /// ahead of what a drain can see.
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for SharedQueue<T> {}
unsafe impl<T: Send> Sync for SharedQueue<T> {}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        let stub = Node::alloc(None);
        Self {
            tail: CachePadded::new(AtomicPtr::new(stub)),
            head: Mutex::new(stub),
            len: AtomicUsize::new(0),
        }
    }

    /// Append one value at the tail.
    pub fn push(&self, value: T) {
        let node = Node::alloc(Some(value));
        self.len.fetch_add(1, Ordering::Relaxed);
        self.link(node, node);
    }

    /// Splice the chain `first..=last` after the current tail.
    /// `last.next` must be null.
    fn link(&self, first: *mut Node<T>, last: *mut Node<T>) {
        let prev = self.tail.swap(last, Ordering::AcqRel);
        // SAFETY: `prev` was the tail, so the consumer won't free it until
        // its `next` is non-null, which is the store below.
        unsafe { (*prev).next.store(first, Ordering::Release) };
    }

    /// Pop the oldest visible value.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.lock();
        // SAFETY: holding the consumer lock.
        unsafe { self.pop_locked(&mut head) }
    }

    /// Detach every visible value, oldest first.
    pub fn drain_all(&self) -> Vec<T> {
        let mut head = self.head.lock();
        let mut out = Vec::new();
        // SAFETY: holding the consumer lock.
        while let Some(value) = unsafe { self.pop_locked(&mut head) } {
            out.push(value);
        }
        out
    }

    /// Caller must hold the consumer lock that guards `head`.
    unsafe fn pop_locked(&self, head: &mut *mut Node<T>) -> Option<T> {
        let stub = *head;
        let next = (*stub).next.load(Ordering::Acquire);
        if next.is_null() {
            return None;
        }

        *head = next;
        // `next` becomes the new stub. Its producer is done with it except
        // for `next.next`, which is a separate field.
        let value = (*next).value.take();
        drop(Box::from_raw(stub));
        self.len.fetch_sub(1, Ordering::Relaxed);
        value
    }

    /// Move every value of `other` to the back of `self` in O(1).
    /// `other` is left empty.
    pub fn append(&self, other: &mut SharedQueue<T>) {
        let stub = *other.head.get_mut();
        // SAFETY: `&mut other` excludes its producers and consumer, so its
        // chain from `stub` to `tail` is fully linked.
        let first = unsafe { (*stub).next.swap(ptr::null_mut(), Ordering::Relaxed) };
        if first.is_null() {
            return;
        }
        let last = std::mem::replace(other.tail.get_mut(), stub);
        let moved = std::mem::take(other.len.get_mut());

        self.len.fetch_add(moved, Ordering::Relaxed);
        self.link(first, last);
    }

    /// Number of queued values, including pushes still being linked.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access; each node is freed once.
            unsafe {
                let next = (*cur).next.load(Ordering::Relaxed);
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}
