// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fan-in barrier over a fixed set of jobs.
//!
//! Each job is wrapped in a `GroupItem`. Whatever happens to the job
//! (runs, panics, or is dropped unrun), its item counts exactly once. The
//! count and the callback share one lock, so the callback runs exactly
//! once, after the last item, and `is_finished` can't observe "finished"
//! while the callback is still running.
//!
//! Tasks the callback wakes are resumed only after the lock is released,
//! so a woken task may query the group it was waiting on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::TaskError;
use crate::task::raw::defer_wakes;

/// A plain unit of CPU work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct GroupState {
    completed: usize,
    on_complete: Option<Callback>,
}

struct GroupShared {
    total: usize,
    state: Mutex<GroupState>,
}

impl GroupShared {
    fn finish_one(&self) {
        self.count(1);
    }

    /// Add `n` completions; fire the callback on reaching the total.
    fn count(&self, n: usize) {
        defer_wakes(|| {
            let mut st = self.state.lock();
            st.completed += n;
            if st.completed != self.total {
                return;
            }
            if let Some(callback) = st.on_complete.take() {
                // Runs under the lock.
                if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
                    let err = TaskError::from_panic(payload);
                    warn!(error = %err, "group completion callback panicked");
                }
            }
        });
    }
}

/// Observer side of a fan-in barrier. Cheap to clone.
#[derive(Clone)]
pub struct WorkGroup {
    shared: Arc<GroupShared>,
}

impl WorkGroup {
    /// Wrap `jobs` and arm `on_complete`. Returns the observer and one
    /// item per job; run the items anywhere, in any order.
    ///
    /// With no jobs the callback fires here.
    pub fn new<I, F>(jobs: I, on_complete: F) -> (WorkGroup, Vec<GroupItem>)
    where
        I: IntoIterator<Item = Job>,
        F: FnOnce() + Send + 'static,
    {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        let shared = Arc::new(GroupShared {
            total: jobs.len(),
            state: Mutex::new(GroupState {
                completed: 0,
                on_complete: Some(Box::new(on_complete)),
            }),
        });

        if jobs.is_empty() {
            shared.count(0);
        }

        let items = jobs
            .into_iter()
            .map(|job| GroupItem {
                job: Some(job),
                shared: shared.clone(),
            })
            .collect();
        (WorkGroup { shared }, items)
    }

    pub fn total(&self) -> usize {
        self.shared.total
    }

    pub fn remaining(&self) -> usize {
        self.shared.total - self.shared.state.lock().completed
    }

    /// True once every item has counted and the callback has returned.
    pub fn is_finished(&self) -> bool {
        let st = self.shared.state.lock();
        st.completed == self.shared.total && st.on_complete.is_none()
    }
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("total", &self.total())
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// One job of a `WorkGroup`. Counts toward completion when run or dropped.
pub struct GroupItem {
    job: Option<Job>,
    shared: Arc<GroupShared>,
}

impl GroupItem {
    /// Run the job. A panic is logged and returned; the item still counts.
    pub fn run(mut self) -> Result<(), TaskError> {
        let Some(job) = self.job.take() else {
            return Ok(());
        };
        catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
            let err = TaskError::from_panic(payload);
            warn!(error = %err, "group job failed");
            err
        })
        // Drop counts the item.
    }
}

impl Drop for GroupItem {
    fn drop(&mut self) {
        if self.job.is_some() {
            warn!("group job dropped without running");
        }
        self.shared.finish_one();
    }
}
