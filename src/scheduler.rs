//! Pluggable scheduling for deferred effects.
//!
//! The side-effects manager only depends on the [`Scheduler`] trait. The
//! adapters here run on tokio's current-thread machinery and must be used
//! from inside a [`tokio::task::LocalSet`].

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Number of executor turns an [`IdleScheduler`] yields before running its
/// task, so that already-ready work goes first.
const IDLE_YIELDS: usize = 8;

/// Schedules one unit of work to run later on the current thread.
///
/// Implementations must never run `task` synchronously from inside
/// `schedule`.
pub trait Scheduler {
    /// Arrange for `task` to run later.
    fn schedule(&self, task: Task) -> ScheduleToken;
}

/// Handle to one scheduled task, used to cancel it.
#[derive(Debug, Default)]
pub struct ScheduleToken {
    handle: Option<AbortHandle>,
}

impl ScheduleToken {
    /// A token for a tokio task.
    pub fn from_abort_handle(handle: AbortHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// A token that cannot cancel anything, for schedulers without
    /// cancellation support.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Prevent the task from running, if it has not run yet.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Run `task` in a fresh local task, after the current one yields.
///
/// This is the microtask primitive used to start a drain cycle.
pub(crate) fn queue_microtask(task: Task) -> ScheduleToken {
    let handle = tokio::task::spawn_local(async move { task() });
    ScheduleToken::from_abort_handle(handle.abort_handle())
}

/// Runs each task as soon as the executor gets to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: Task) -> ScheduleToken {
        queue_microtask(task)
    }
}

/// Runs each task after a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutScheduler {
    delay: Duration,
}

impl TimeoutScheduler {
    /// Delay every task by `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Scheduler for TimeoutScheduler {
    fn schedule(&self, task: Task) -> ScheduleToken {
        let delay = self.delay;
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduleToken::from_abort_handle(handle.abort_handle())
    }
}

/// Runs each task once the executor has had a few idle turns, or after
/// `timeout`, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct IdleScheduler {
    timeout: Duration,
}

impl IdleScheduler {
    /// Run tasks when idle, but never later than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Scheduler for IdleScheduler {
    fn schedule(&self, task: Task) -> ScheduleToken {
        let timeout = self.timeout;
        let handle = tokio::task::spawn_local(async move {
            tokio::select! {
                biased;
                _ = wait_for_idle() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
            task();
        });
        ScheduleToken::from_abort_handle(handle.abort_handle())
    }
}

async fn wait_for_idle() {
    for _ in 0..IDLE_YIELDS {
        tokio::task::yield_now().await;
    }
}

/// Serializable choice of scheduler, for [`StoreConfig`](crate::StoreConfig).
///
/// # Examples
///
/// ```
/// use slicefold::SchedulerConfig;
///
/// let config: SchedulerConfig =
///     serde_json::from_str(r#"{"kind": "timeout", "delay_ms": 20}"#).unwrap();
/// assert_eq!(config, SchedulerConfig::Timeout { delay_ms: 20 });
/// assert_eq!(SchedulerConfig::default(), SchedulerConfig::Immediate);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// [`ImmediateScheduler`].
    #[default]
    Immediate,
    /// [`TimeoutScheduler`] with the given delay.
    Timeout {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// [`IdleScheduler`] with the given upper bound.
    Idle {
        /// Upper bound in milliseconds.
        timeout_ms: u64,
    },
}

impl SchedulerConfig {
    /// Instantiate the configured scheduler.
    pub fn build(&self) -> Rc<dyn Scheduler> {
        match *self {
            SchedulerConfig::Immediate => Rc::new(ImmediateScheduler),
            SchedulerConfig::Timeout { delay_ms } => {
                Rc::new(TimeoutScheduler::new(Duration::from_millis(delay_ms)))
            }
            SchedulerConfig::Idle { timeout_ms } => {
                Rc::new(IdleScheduler::new(Duration::from_millis(timeout_ms)))
            }
        }
    }
}

impl fmt::Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerConfig::Immediate => f.write_str("immediate"),
            SchedulerConfig::Timeout { delay_ms } => write!(f, "timeout({delay_ms}ms)"),
            SchedulerConfig::Idle { timeout_ms } => write!(f, "idle({timeout_ms}ms)"),
        }
    }
}
