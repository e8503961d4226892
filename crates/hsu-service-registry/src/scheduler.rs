//! Recurring task scheduler keyed by id.
//!
//! Runs a closure every interval until it is cancelled, either by id or
//! through the parent token it was registered with. Heartbeats use the
//! service id as task id and the service's liveness token as parent, so
//! deregistering a service stops its heartbeat without a separate call.

use dashmap::DashMap;
use hsu_common::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

struct ScheduledTask {
    cancel: CancellationToken,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

/// Handle to the set of recurring tasks. Clones share the same tasks.
#[derive(Clone, Default)]
pub struct TaskScheduler {
    tasks: Arc<DashMap<String, ScheduledTask>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` every `interval`, starting one interval from now.
    ///
    /// Fails if a live task already uses `id`. A task whose parent was
    /// cancelled is considered gone and its id can be reused. Errors from
    /// a run are logged and the next run happens on schedule.
    pub fn add_with_id<F, Fut>(
        &self,
        id: impl Into<String>,
        interval: Duration,
        parent: &CancellationToken,
        task: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = id.into();
        if interval.is_zero() {
            return Err(Error::Scheduler(format!("Task {} has a zero interval", id)));
        }

        let cancel = parent.child_token();
        let mut slot = match self.tasks.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if !existing.get().cancel.is_cancelled() {
                    return Err(Error::Scheduler(format!("Task {} already exists", id)));
                }
                let mut slot = existing.into_ref();
                *slot = ScheduledTask {
                    cancel: cancel.clone(),
                    interval,
                    handle: None,
                };
                slot
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => vacant.insert(ScheduledTask {
                cancel: cancel.clone(),
                interval,
                handle: None,
            }),
        };

        slot.handle = Some(tokio::spawn(Self::run(id, interval, cancel, task)));
        Ok(())
    }

    async fn run<F, Fut>(id: String, interval: Duration, cancel: CancellationToken, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(task = %id, ?interval, "Recurring task started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(task = %id, "Recurring task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    trace!(task = %id, "Running recurring task");
                    // A run in flight is abandoned on cancellation.
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            debug!(task = %id, "Recurring task cancelled mid-run");
                            break;
                        }
                        result = task() => {
                            if let Err(e) = result {
                                warn!(task = %id, error = %e, "Recurring task run failed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Cancels and forgets the task with `id`. Returns false if unknown.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tasks.remove(id) {
            Some((_, task)) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the task with `id` and waits until it has stopped, so no run
    /// of it is still in progress on return. Returns false if unknown.
    pub async fn stop(&self, id: &str) -> bool {
        let Some((_, mut task)) = self.tasks.remove(id) else {
            return false;
        };
        task.cancel.cancel();
        if let Some(handle) = task.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = %id, error = %e, "Recurring task ended abnormally");
            }
        }
        true
    }

    /// Returns true if a task with `id` is scheduled and not cancelled.
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.tasks
            .get(id)
            .map(|task| !task.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Interval of a live task.
    pub fn interval_of(&self, id: &str) -> Option<Duration> {
        self.tasks
            .get(id)
            .filter(|task| !task.cancel.is_cancelled())
            .map(|task| task.interval)
    }

    /// Number of live tasks.
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| !task.cancel.is_cancelled())
            .count()
    }

    /// Cancels every task.
    pub fn cancel_all(&self) {
        for task in self.tasks.iter() {
            task.cancel.cancel();
        }
        self.tasks.clear();
    }
}
