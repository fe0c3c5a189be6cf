// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Epoch-deferred reclamation.
//!
//! Handles to external resources (GPU buffers, descriptor sets, ...) must
//! outlive every epoch that may still read them. Callers hand ownership
//! to the reclaimer together with the epoch that produced them; the
//! values are dropped only once that epoch has been retired.
//!
//! Epochs are opaque `u64`s supplied by the frame loop:
//!
//! ```text
//!   begin_epoch(n) ... defer(n, handles) ... retire_epoch(n)
//! ```
//!
//! An epoch `e` counts as retired once `e <= last begun` and `e` is not
//! in flight. Deferral is lock-free from any thread; the epoch book is
//! only touched by the thread driving frames.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::ReclaimError;
use crate::list::SharedStack;

/// Owned value held only to delay its destructor.
pub struct Deferred {
    _value: Box<dyn Any + Send>,
}

impl Deferred {
    /// Keep `value` alive until reclaimed. Tuples carry several handles.
    pub fn new<R: Send + 'static>(value: R) -> Self {
        Self {
            _value: Box::new(value),
        }
    }

    /// Run `f` when reclaimed.
    pub fn from_fn<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Self::new(OnDrop(Some(f)))
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Deferred")
    }
}

struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

#[derive(Default)]
struct EpochBook {
    last_begun: Option<u64>,
    in_flight: BTreeSet<u64>,
    held: BTreeMap<u64, Vec<Deferred>>,
}

impl EpochBook {
    fn is_retired(&self, epoch: u64) -> bool {
        matches!(self.last_begun, Some(last) if epoch <= last) && !self.in_flight.contains(&epoch)
    }

    /// Move every held entry of a retired epoch into `out`.
    fn sweep(&mut self, out: &mut Vec<Deferred>) {
        let retired: Vec<u64> = self
            .held
            .keys()
            .copied()
            .filter(|e| self.is_retired(*e))
            .collect();
        for epoch in retired {
            if let Some(mut batch) = self.held.remove(&epoch) {
                out.append(&mut batch);
            }
        }
    }
}

/// Per-epoch ownership lists.
pub struct Reclaimer {
    depth: usize,
    incoming: SharedStack<(u64, Deferred)>,
    book: Mutex<EpochBook>,
}

impl Reclaimer {
    /// `depth` is the number of epochs allowed in flight at once
    /// (double buffering = 2, triple = 3).
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            incoming: SharedStack::new(),
            book: Mutex::new(EpochBook::default()),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Hand `value` over until `epoch` retires. Callable from any thread.
    pub fn defer<R: Send + 'static>(&self, epoch: u64, value: R) {
        self.defer_boxed(epoch, Deferred::new(value));
    }

    pub fn defer_boxed(&self, epoch: u64, deferred: Deferred) {
        self.incoming.push((epoch, deferred));
    }

    /// Sort freshly deferred values into their epochs and drop whatever
    /// already belongs to a retired epoch. Returns how many were dropped.
    pub fn collect(&self) -> usize {
        let mut doomed = Vec::new();
        {
            let mut book = self.book.lock();
            self.file_incoming(&mut book, &mut doomed);
        }
        let n = doomed.len();
        drop(doomed);
        if n > 0 {
            trace!(reclaimed = n, "collected late deferrals");
        }
        n
    }

    fn file_incoming(&self, book: &mut EpochBook, doomed: &mut Vec<Deferred>) {
        for (epoch, deferred) in self.incoming.drain_all() {
            if book.is_retired(epoch) {
                doomed.push(deferred);
            } else {
                book.held.entry(epoch).or_default().push(deferred);
            }
        }
    }

    /// Start filling `epoch`. Epochs must increase, and at most `depth`
    /// may be in flight.
    pub fn begin_epoch(&self, epoch: u64) -> Result<(), ReclaimError> {
        let mut doomed = Vec::new();
        {
            let mut book = self.book.lock();
            if let Some(last) = book.last_begun {
                if epoch <= last {
                    return Err(ReclaimError::NonMonotonic { epoch, last });
                }
            }
            if book.in_flight.len() >= self.depth {
                return Err(ReclaimError::TooManyInFlight {
                    epoch,
                    depth: self.depth,
                });
            }
            self.file_incoming(&mut book, &mut doomed);
            book.in_flight.insert(epoch);
            book.last_begun = Some(epoch);
            // Skipped epochs below `epoch` are now retired.
            book.sweep(&mut doomed);
        }
        debug!(epoch, "epoch begun");
        drop(doomed);
        Ok(())
    }

    /// The consumer is done with `epoch`; drop everything deferred for it.
    /// Returns how many values were reclaimed.
    pub fn retire_epoch(&self, epoch: u64) -> Result<usize, ReclaimError> {
        let mut doomed = Vec::new();
        {
            let mut book = self.book.lock();
            if !book.in_flight.remove(&epoch) {
                return Err(ReclaimError::UnknownEpoch(epoch));
            }
            self.file_incoming(&mut book, &mut doomed);
            book.sweep(&mut doomed);
        }
        let n = doomed.len();
        drop(doomed);
        debug!(epoch, reclaimed = n, "epoch retired");
        Ok(n)
    }

    /// Last epoch passed to `begin_epoch`.
    pub fn current_epoch(&self) -> Option<u64> {
        self.book.lock().last_begun
    }

    pub fn in_flight(&self) -> Vec<u64> {
        self.book.lock().in_flight.iter().copied().collect()
    }

    /// Values still held for `epoch`, not counting unsorted deferrals.
    pub fn held_for(&self, epoch: u64) -> usize {
        self.book.lock().held.get(&epoch).map_or(0, Vec::len)
    }

    /// Values not yet reclaimed, sorted or not.
    pub fn pending_count(&self) -> usize {
        self.collect();
        self.book.lock().held.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.book.lock();
        f.debug_struct("Reclaimer")
            .field("depth", &self.depth)
            .field("last_begun", &book.last_begun)
            .field("in_flight", &book.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Probe(Arc<AtomicBool>);

    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn not_dropped_before_retire() {
        let r = Reclaimer::new(2);
        r.begin_epoch(0).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        r.defer(0, Probe(dropped.clone()));

        r.collect();
        r.begin_epoch(1).unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        assert_eq!(r.retire_epoch(0), Ok(1));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn retire_only_touches_its_epoch() {
        let r = Reclaimer::new(3);
        let (a, b) = (Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(false)));
        r.begin_epoch(1).unwrap();
        r.defer(1, Probe(a.clone()));
        r.begin_epoch(2).unwrap();
        r.defer(2, Probe(b.clone()));

        assert_eq!(r.retire_epoch(2), Ok(1));
        assert!(!a.load(Ordering::SeqCst));
        assert!(b.load(Ordering::SeqCst));
        assert_eq!(r.held_for(1), 1);
        assert_eq!(r.retire_epoch(1), Ok(1));
        assert!(a.load(Ordering::SeqCst));
    }

    #[test]
    fn late_deferral_to_retired_epoch_drops_on_collect() {
        let r = Reclaimer::new(2);
        r.begin_epoch(4).unwrap();
        r.retire_epoch(4).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        r.defer(4, Probe(dropped.clone()));
        assert!(!dropped.load(Ordering::SeqCst));
        assert_eq!(r.collect(), 1);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn future_epoch_waits_for_its_own_retirement() {
        let r = Reclaimer::new(2);
        let dropped = Arc::new(AtomicBool::new(false));
        r.defer(9, Probe(dropped.clone()));
        r.begin_epoch(8).unwrap();
        r.retire_epoch(8).unwrap();
        assert!(!dropped.load(Ordering::SeqCst));
        r.begin_epoch(9).unwrap();
        r.retire_epoch(9).unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn depth_bounds_in_flight_epochs() {
        let r = Reclaimer::new(2);
        r.begin_epoch(0).unwrap();
        r.begin_epoch(1).unwrap();
        assert_eq!(
            r.begin_epoch(2),
            Err(ReclaimError::TooManyInFlight { epoch: 2, depth: 2 })
        );
        r.retire_epoch(0).unwrap();
        r.begin_epoch(2).unwrap();
        assert_eq!(r.in_flight(), vec![1, 2]);
        assert_eq!(r.current_epoch(), Some(2));
    }

    #[test]
    fn epochs_must_increase() {
        let r = Reclaimer::new(3);
        r.begin_epoch(5).unwrap();
        assert_eq!(
            r.begin_epoch(5),
            Err(ReclaimError::NonMonotonic { epoch: 5, last: 5 })
        );
        assert_eq!(r.retire_epoch(7), Err(ReclaimError::UnknownEpoch(7)));
    }

    #[test]
    fn cleanup_closure_runs_on_retire() {
        let r = Reclaimer::new(2);
        let runs = Arc::new(AtomicUsize::new(0));
        r.begin_epoch(0).unwrap();
        let c = runs.clone();
        r.defer_boxed(0, Deferred::from_fn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(r.pending_count(), 1);
        r.retire_epoch(0).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn concurrent_deferrals_all_reclaimed() {
        let r = Arc::new(Reclaimer::new(2));
        r.begin_epoch(0).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));

        struct Count(Arc<AtomicUsize>);
        impl Drop for Count {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = r.clone();
                let d = drops.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        r.defer(0, Count(d.clone()));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(r.retire_epoch(0), Ok(1000));
        assert_eq!(drops.load(Ordering::SeqCst), 1000);
    }
}
