// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use std::any::Any;
use std::io;

use thiserror::Error;

/// Failure carried in a task's result slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body panicked with the given message.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The operation was dropped by its consumer without being answered.
    #[error("operation abandoned before it was resumed")]
    Abandoned,

    /// The result was already read by an earlier awaiter.
    #[error("task result was already taken")]
    ResultTaken,
}

impl TaskError {
    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panicked(msg)
    }
}

/// Errors surfaced by the scheduler itself.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Main-thread-only entry point called from another thread.
    #[error("operation requires the thread that built the scheduler")]
    NotMainThread,

    /// A previous `run` already surfaced a fault.
    #[error("scheduler terminated after an earlier fault")]
    Terminated,

    /// The scheduler was shut down.
    #[error("scheduler is shut down")]
    ShutDown,

    /// A detached task faulted and nobody observed it.
    #[error("unobserved task fault: {0}")]
    Fault(#[from] TaskError),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Errors from epoch bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReclaimError {
    #[error("epoch {epoch} does not follow last begun epoch {last}")]
    NonMonotonic { epoch: u64, last: u64 },

    #[error("cannot begin epoch {epoch}: {depth} epochs already in flight")]
    TooManyInFlight { epoch: u64, depth: usize },

    #[error("epoch {0} is not in flight")]
    UnknownEpoch(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_str() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(TaskError::from_panic(payload), TaskError::Panicked("boom".into()));
    }

    #[test]
    fn panic_payload_string() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(TaskError::from_panic(payload), TaskError::Panicked("bang".into()));
    }

    #[test]
    fn panic_payload_other() {
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panicked("unknown panic".into())
        );
    }

    #[test]
    fn fault_converts_from_task_error() {
        let err: SchedulerError = TaskError::Abandoned.into();
        assert!(matches!(err, SchedulerError::Fault(TaskError::Abandoned)));
        assert!(err.to_string().contains("abandoned"));
    }
}
