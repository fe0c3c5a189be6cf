// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Frame runtime: a small concurrency core for real-time graphics engines.
//!
//! Components:
//! - task: suspendable operations, root-task state machine, join handles
//! - sched: worker pool, main-thread affinity, ready-queue
//! - batch: wait-queue whose consumer answers all waiters at once
//! - group: fan-in barrier over a fixed set of jobs
//! - reclaim: per-epoch deferred destruction of external resources
//! - list: lock-free stack and queue the rest is built on
//! - config / error: builder, env overrides, error types
//!
//! ```no_run
//! use frame_rt::Scheduler;
//!
//! let sched = Scheduler::new(0)?;
//! let h = sched.handle();
//! let total = sched.run(async move {
//!     h.run_on_worker().await;
//!     let sum: u64 = (1..=1000).sum();
//!     h.run_on_main().await;
//!     sum
//! })?;
//! assert_eq!(total, 500500);
//! # Ok::<(), frame_rt::SchedulerError>(())
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod group;
pub mod list;
pub mod reclaim;
pub mod sched;
pub mod task;

pub use batch::{BatchItem, BatchQueue};
pub use config::{Builder, SchedulerConfig};
pub use error::{ReclaimError, SchedulerError, TaskError};
pub use group::{GroupItem, Job, WorkGroup};
pub use list::{SharedList, SharedQueue, SharedStack};
pub use reclaim::{Deferred, Reclaimer};
pub use sched::{Handle, Scheduler};
pub use task::{JoinHandle, Task};
