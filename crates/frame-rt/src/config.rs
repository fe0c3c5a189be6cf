// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.

use std::env;

use tracing::warn;

use crate::error::SchedulerError;
use crate::sched::Scheduler;

/// Worker count override (`0` = one per core).
pub const ENV_WORKERS: &str = "FRAME_RT_WORKERS";
/// Max in-flight epochs override.
pub const ENV_EPOCH_DEPTH: &str = "FRAME_RT_EPOCH_DEPTH";

/// Triple buffering.
pub const DEFAULT_EPOCH_DEPTH: usize = 3;

const DEFAULT_THREAD_NAME: &str = "frame-rt-worker";

/// Settings a `Scheduler` is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads. `0` means available parallelism.
    pub worker_threads: usize,
    /// Worker threads are named `{thread_name}-{index}`.
    pub thread_name: String,
    pub thread_stack_size: Option<usize>,
    /// How many epochs may be in flight before `begin_epoch` refuses.
    pub epoch_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            thread_stack_size: None,
            epoch_depth: DEFAULT_EPOCH_DEPTH,
        }
    }
}

impl SchedulerConfig {
    /// Defaults with `FRAME_RT_WORKERS` / `FRAME_RT_EPOCH_DEPTH` applied.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, ENV_WORKERS) {
            config.worker_threads = n;
        }
        match parse_var(&lookup, ENV_EPOCH_DEPTH) {
            Some(0) => warn!(var = ENV_EPOCH_DEPTH, "epoch depth must be at least 1, ignoring"),
            Some(n) => config.epoch_depth = n,
            None => {}
        }
        config
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(var = key, value = %raw, "ignoring invalid value");
            None
        }
    }
}

/// Builds a `Scheduler` with custom settings.
///
/// ```no_run
/// let sched = frame_rt::config::Builder::new()
///     .worker_threads(4)
///     .epoch_depth(2)
///     .build()?;
/// # Ok::<(), frame_rt::error::SchedulerError>(())
/// ```
///
/// The thread calling `build` becomes the scheduler's main thread.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: SchedulerConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `SchedulerConfig::from_env()`.
    pub fn from_env() -> Self {
        Self {
            config: SchedulerConfig::from_env(),
        }
    }

    /// Number of worker threads. `0` (the default) means one per core.
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        self.config.worker_threads = val;
        self
    }

    /// Prefix for worker thread names.
    ///
    /// The default is "frame-rt-worker", giving "frame-rt-worker-{N}".
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        self.config.thread_name = val.into();
        self
    }

    /// Stack size in bytes for worker threads. The platform may round up.
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.config.thread_stack_size = Some(val);
        self
    }

    /// Maximum number of epochs in flight at once (2 for double
    /// buffering, 3 for triple).
    ///
    /// # Panics
    ///
    /// Panics if `val` is 0.
    pub fn epoch_depth(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "epoch depth must be greater than 0");
        self.config.epoch_depth = val;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the worker threads.
    pub fn build(&mut self) -> Result<Scheduler, SchedulerError> {
        Scheduler::start(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let c = SchedulerConfig::default();
        assert_eq!(c.worker_threads, 0);
        assert_eq!(c.epoch_depth, DEFAULT_EPOCH_DEPTH);
        assert_eq!(c.thread_name, "frame-rt-worker");
        assert_eq!(c.thread_stack_size, None);
    }

    #[test]
    fn env_overrides() {
        let c = SchedulerConfig::from_lookup(lookup(&[
            (ENV_WORKERS, "6"),
            (ENV_EPOCH_DEPTH, " 2 "),
        ]));
        assert_eq!(c.worker_threads, 6);
        assert_eq!(c.epoch_depth, 2);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let c = SchedulerConfig::from_lookup(lookup(&[
            (ENV_WORKERS, "many"),
            (ENV_EPOCH_DEPTH, "0"),
        ]));
        assert_eq!(c, SchedulerConfig::default());
    }

    #[test]
    fn builder_sets_fields() {
        let mut b = Builder::new();
        b.worker_threads(3)
            .thread_name("render")
            .thread_stack_size(1 << 20)
            .epoch_depth(2);
        assert_eq!(
            *b.config(),
            SchedulerConfig {
                worker_threads: 3,
                thread_name: "render".into(),
                thread_stack_size: Some(1 << 20),
                epoch_depth: 2,
            }
        );
    }

    #[test]
    #[should_panic(expected = "epoch depth")]
    fn zero_epoch_depth_panics() {
        Builder::new().epoch_depth(0);
    }

    #[test]
    fn built_scheduler_uses_config() {
        let sched = Builder::new()
            .worker_threads(2)
            .thread_name("cfg-test")
            .epoch_depth(1)
            .build()
            .unwrap();
        assert_eq!(sched.worker_count(), 2);
        assert_eq!(sched.reclaimer().depth(), 1);

        let name = sched
            .spawn(async { std::thread::current().name().map(str::to_string) })
            .join()
            .unwrap();
        assert!(name.is_some_and(|n| n.starts_with("cfg-test-")));
    }
}
