//! The clock loop.
//!
//! Once a minute the scheduler lists enabled jobs, asks each job's
//! [`ScheduleSpec`](crate::schedule::ScheduleSpec) whether it is due, and hands
//! due jobs to the injected [`JobHandler`]. Handler invocations run on their
//! own tasks; an error or panic in one never reaches the loop.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{CronError, Result};
use crate::job::{Job, Run};
use crate::schedule::truncate_to_minute;
use crate::store::Store;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Handles a job that should run now.
///
/// `run` is `None` for a scheduled trigger; the handler creates the run itself.
/// A manual trigger passes the run it already created.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job, run: Option<Run>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    handler: Arc<dyn JobHandler>,
    tick_interval: Duration,
    /// Minute each job last fired in, so a job fires at most once per minute.
    last_fired: HashMap<Uuid, DateTime<Utc>>,
    state: SchedulerState,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            store,
            handler,
            tick_interval: DEFAULT_TICK_INTERVAL,
            last_fired: HashMap::new(),
            state: SchedulerState::Stopped,
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Tick until `shutdown` is cancelled. In-flight handlers keep running;
    /// use [`Scheduler::drain`] to wait for them.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        self.state = SchedulerState::Running;
        tracing::info!(tick_ms = self.tick_interval.as_millis() as u64, "Scheduler started");

        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        self.state = SchedulerState::Stopped;
        tracing::info!(in_flight = self.tracker.len(), "Scheduler stopped");
    }

    /// Evaluate every enabled job at `now` and dispatch the due ones.
    /// Returns how many were dispatched.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let jobs = match self.store.list_jobs(true).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list jobs, skipping tick");
                return 0;
            }
        };

        let minute = truncate_to_minute(&now);
        self.last_fired.retain(|id, _| jobs.iter().any(|job| job.id == *id));

        let mut dispatched = 0;
        for job in jobs {
            if !job.enabled || !job.schedule.is_due(&minute) {
                continue;
            }
            if self.last_fired.get(&job.id) == Some(&minute) {
                tracing::debug!(job_id = %job.id, "Already fired this minute");
                continue;
            }
            self.last_fired.insert(job.id, minute);

            tracing::info!(job_id = %job.id, job = %job.name, "Job due");
            dispatch(&self.tracker, Arc::clone(&self.handler), job, None);
            dispatched += 1;
        }
        dispatched
    }

    /// Wait up to `grace` for dispatched handlers. Returns false on timeout.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let done = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        done
    }

    fn ticker(&self) -> Interval {
        // Minute ticks land just after the minute boundary.
        let start = if self.tick_interval == DEFAULT_TICK_INTERVAL {
            Instant::now() + until_next_minute(Utc::now())
        } else {
            Instant::now()
        };
        let mut ticker = tokio::time::interval_at(start, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Run `handler.handle(job, run)` on its own tracked task, logging errors
/// and containing panics.
pub(crate) fn dispatch(
    tracker: &TaskTracker,
    handler: Arc<dyn JobHandler>,
    job: Job,
    run: Option<Run>,
) {
    tracker.spawn(async move {
        let job_id = job.id;
        match AssertUnwindSafe(handler.handle(job, run)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(CronError::Busy(active))) => {
                tracing::info!(job_id = %job_id, active_run = %active, "Skipping job, another run is active");
            }
            Ok(Err(e)) => tracing::error!(job_id = %job_id, error = %e, "Job handler failed"),
            Err(panic) => {
                tracing::error!(job_id = %job_id, panic = %panic_message(&panic), "Job handler panicked");
            }
        }
    });
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let next = truncate_to_minute(&now) + chrono::Duration::minutes(1);
    (next - now).to_std().unwrap_or_default()
}
