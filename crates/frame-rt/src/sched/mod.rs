// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread-pool scheduler with main-thread affinity.
//!
//! N worker threads pop records from a shared ready stack and sleep on a
//! condvar while it is empty. The thread that builds the scheduler is the
//! main thread: `run` drives a root future there and services
//! `run_on_main` requests between polls.
//!
//! Continuations are wakers. A worker popping a `Resume` record, the main
//! loop draining its queue, or anything completing a task's result slot
//! polls the parked root task right there on its own thread, one task
//! after another rather than nested (see `task::raw`).
//!
//! After a `run` has surfaced a fault the scheduler is terminated: tasks
//! already started keep running, but `spawn`, `execute` and
//! `submit_group` refuse new work.

mod main;
mod worker;

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::{ReclaimError, SchedulerError, TaskError};
use crate::group::{Job, WorkGroup};
use crate::list::SharedStack;
use crate::reclaim::Reclaimer;
use crate::task::handle::FaultSink;
use crate::task::raw::{RawTask, ScheduleFn};
use crate::task::slot::ResultSlot;
use crate::task::{JoinHandle, Task};

pub use main::RunOnMain;
pub use worker::{RunOnWorker, YieldNow};

use main::MainQueue;
use worker::{worker_loop, WorkRecord};

/// Scheduler ids start at 1; 0 marks "not a worker".
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// State shared between workers, the main thread, and handles.
pub(crate) struct Shared {
    id: usize,
    ready: SharedStack<WorkRecord>,
    work_available: (Mutex<()>, Condvar),
    main: MainQueue,
    main_thread: ThreadId,
    shutdown: AtomicBool,
    terminated: AtomicBool,
    /// First unobserved fault, surfaced by the next `run`.
    fault: Mutex<Option<TaskError>>,
    reclaim: Reclaimer,
    worker_count: usize,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn on_worker(&self) -> bool {
        worker::current_worker_of() == self.id
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub(crate) fn push_ready(&self, record: WorkRecord) {
        self.ready.push(record);
        if self.is_shut_down() {
            // Nobody will pop it; drop it here so waiting joiners see
            // their task abandoned.
            drop(self.ready.drain_all());
            return;
        }
        let (lock, cvar) = &self.work_available;
        let _guard = lock.lock();
        cvar.notify_one();
    }

    fn report_fault(&self, err: TaskError) {
        warn!(error = %err, "detached task failed");
        {
            let mut slot = self.fault.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.main.signal.notify();
    }

    fn take_fault(&self) -> Option<TaskError> {
        self.fault.lock().take()
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Entry point for new work from `spawn`, `execute` and
    /// `submit_group`. A terminated scheduler drops the record, which
    /// abandons a spawned task and counts a group item.
    fn submit(&self, record: WorkRecord) {
        if self.is_terminated() {
            warn!("scheduler terminated, rejecting new work");
            drop(record);
            return;
        }
        self.push_ready(record);
    }

    fn schedule_fn(self: &Arc<Self>) -> ScheduleFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |task: Arc<RawTask>| match weak.upgrade() {
            Some(shared) => shared.push_ready(WorkRecord::Job(Box::new(move || task.resume()))),
            None => warn!("task woken after its scheduler was dropped"),
        })
    }

    fn fault_sink(self: &Arc<Self>) -> FaultSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |err| {
            if let Some(shared) = weak.upgrade() {
                shared.report_fault(err);
            }
        })
    }

    /// Wrap `future` as a root task that writes its result into `slot`.
    fn root_task<F, T>(self: &Arc<Self>, future: F, slot: Arc<ResultSlot<T>>) -> Arc<RawTask>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut finish = SlotGuard {
            slot: Some(slot),
            shared: Arc::downgrade(self),
        };
        let body = async move {
            let result = Task::new(future).await;
            finish.complete(result);
        };
        RawTask::new(Box::pin(body), Some(self.schedule_fn()))
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(workers = self.worker_count, "scheduler shutting down");

        {
            let (lock, cvar) = &self.work_available;
            let _guard = lock.lock();
            cvar.notify_all();
        }
        self.main.signal.notify();

        let me = thread::current().id();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        // Parked continuations hold the scheduler alive through their
        // futures; dropping them breaks the cycle.
        let dropped = self.ready.drain_all().len() + self.main.discard();
        debug!(dropped, "scheduler stopped");
    }
}

/// Completes a root task's slot, with `Abandoned` if the task is dropped
/// before finishing.
struct SlotGuard<T> {
    slot: Option<Arc<ResultSlot<T>>>,
    shared: Weak<Shared>,
}

impl<T> SlotGuard<T> {
    fn complete(&mut self, result: Result<T, TaskError>) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if let Some(err) = slot.complete(result) {
            if let Some(shared) = self.shared.upgrade() {
                shared.report_fault(err);
            }
        }
    }
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let _ = slot.complete(Err(TaskError::Abandoned));
        }
    }
}

/// Cloneable reference to a running scheduler.
///
/// Everything except `run` and `pump_main` may be called from any thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Start `future` as a root task on a worker.
    ///
    /// On a terminated or shut down scheduler the handle resolves to
    /// `TaskError::Abandoned`.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(ResultSlot::new());
        let task = self.shared.root_task(future, slot.clone());
        self.shared
            .submit(WorkRecord::Job(Box::new(move || task.resume())));
        JoinHandle::new(slot, self.shared.fault_sink())
    }

    /// Run a plain closure on a worker. A panic is logged and swallowed.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(WorkRecord::Job(Box::new(job)));
    }

    /// Run every job on the workers, then `on_complete` once after the
    /// last one finishes.
    pub fn submit_group<I, F>(&self, jobs: I, on_complete: F) -> WorkGroup
    where
        I: IntoIterator<Item = Job>,
        F: FnOnce() + Send + 'static,
    {
        let (group, items) = WorkGroup::new(jobs, on_complete);
        for item in items {
            self.shared.submit(WorkRecord::Job(Box::new(move || {
                // A failed job is logged by the item itself.
                let _ = item.run();
            })));
        }
        group
    }

    /// Continue the awaiting task on a worker thread.
    pub fn run_on_worker(&self) -> RunOnWorker {
        RunOnWorker {
            shared: self.shared.clone(),
            hop: None,
        }
    }

    /// Continue the awaiting task on the main thread.
    pub fn run_on_main(&self) -> RunOnMain {
        RunOnMain {
            shared: self.shared.clone(),
            hop: None,
        }
    }

    /// Requeue the awaiting task once.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            shared: self.shared.clone(),
            hop: None,
        }
    }

    /// Drive `future` on the main thread until it finishes, resuming
    /// main-thread requests whenever it is suspended.
    ///
    /// The first unobserved failure of a detached task ends the run with
    /// `SchedulerError::Fault`, as does a failure of `future` itself.
    /// After that every later `run` returns `SchedulerError::Terminated`.
    pub fn run<F, T>(&self, future: F) -> Result<T, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = &self.shared;
        if !shared.is_main_thread() {
            return Err(SchedulerError::NotMainThread);
        }
        if shared.is_terminated() {
            return Err(SchedulerError::Terminated);
        }
        if shared.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }

        let slot = Arc::new(ResultSlot::new());
        slot.set_continuation(Waker::from(shared.main.signal.clone()));
        shared.root_task(future, slot.clone()).resume();

        loop {
            shared.main.run_pending();
            if let Some(fault) = shared.take_fault() {
                shared.terminate();
                return Err(SchedulerError::Fault(fault));
            }
            if slot.is_complete() {
                break;
            }
            if shared.is_shut_down() {
                return Err(SchedulerError::ShutDown);
            }
            shared.main.signal.wait();
        }

        match slot.try_take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => {
                shared.terminate();
                Err(SchedulerError::Fault(err))
            }
            None => Err(SchedulerError::Fault(TaskError::ResultTaken)),
        }
    }

    /// Resume every queued main-thread request without blocking. Returns
    /// how many ran.
    pub fn pump_main(&self) -> Result<usize, SchedulerError> {
        if !self.shared.is_main_thread() {
            return Err(SchedulerError::NotMainThread);
        }
        Ok(self.shared.main.run_pending())
    }

    /// Keep `value` alive until `epoch` is retired.
    pub fn defer_reclaim<R: Send + 'static>(&self, epoch: u64, value: R) {
        self.shared.reclaim.defer(epoch, value);
    }

    pub fn begin_epoch(&self, epoch: u64) -> Result<(), ReclaimError> {
        self.shared.reclaim.begin_epoch(epoch)
    }

    pub fn retire_epoch(&self, epoch: u64) -> Result<usize, ReclaimError> {
        self.shared.reclaim.retire_epoch(epoch)
    }

    /// Drop late deferrals whose epoch is already retired.
    pub fn collect_deferred(&self) -> usize {
        self.shared.reclaim.collect()
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.shared.reclaim.current_epoch()
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.shared.reclaim
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// True on one of this scheduler's worker threads.
    pub fn is_worker_thread(&self) -> bool {
        self.shared.on_worker()
    }

    pub fn is_main_thread(&self) -> bool {
        self.shared.is_main_thread()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// True once a `run` has returned `SchedulerError::Fault`.
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Stop the workers and drop every queued record. Work still parked
    /// elsewhere (a batch queue, a result slot) is not waited for.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("workers", &self.shared.worker_count)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Owning scheduler. Shuts down on drop.
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// `n` workers with default settings. `0` means one per core.
    pub fn new(n: usize) -> Result<Self, SchedulerError> {
        crate::config::Builder::new().worker_threads(n).build()
    }

    pub(crate) fn start(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let worker_count = if config.worker_threads == 0 {
            thread::available_parallelism().map_or(4, |p| p.get())
        } else {
            config.worker_threads
        };

        let shared = Arc::new(Shared {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            ready: SharedStack::new(),
            work_available: (Mutex::new(()), Condvar::new()),
            main: MainQueue::new(),
            main_thread: thread::current().id(),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            fault: Mutex::new(None),
            reclaim: Reclaimer::new(config.epoch_depth),
            worker_count,
            workers: Mutex::new(Vec::with_capacity(worker_count)),
        });
        let handle = Handle { shared };

        for id in 0..worker_count {
            let mut builder = thread::Builder::new().name(format!("{}-{}", config.thread_name, id));
            if let Some(size) = config.thread_stack_size {
                builder = builder.stack_size(size);
            }
            let shared = handle.shared.clone();
            match builder.spawn(move || worker_loop(id, shared)) {
                Ok(join) => handle.shared.workers.lock().push(join),
                Err(e) => {
                    handle.shutdown();
                    return Err(SchedulerError::Spawn(e));
                }
            }
        }

        debug!(
            workers = worker_count,
            epoch_depth = config.epoch_depth,
            "scheduler started"
        );
        Ok(Self { handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}
