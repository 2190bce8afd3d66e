//! Wiring between triggers and the executor.
//!
//! [`Runner`] is the [`JobHandler`] the scheduler calls for due jobs, and the
//! entry point for manual triggers and live subscriptions. Both trigger paths
//! go through the gate before anything reaches the executor.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{CronError, Result};
use crate::events::{EventHub, Subscription};
use crate::executor::Executor;
use crate::gate::ConcurrencyGate;
use crate::job::{Job, Run, TriggerType};
use crate::notify::{LogNotifier, Notifier};
use crate::scheduler::{dispatch, panic_message, JobHandler};
use crate::store::Store;

/// How many recent runs are checked for leftovers at startup. Only the most
/// recent run can be active while the gate holds, so one page is plenty.
const ORPHAN_SCAN_LIMIT: usize = 100;

pub struct Runner {
    store: Arc<dyn Store>,
    gate: ConcurrencyGate,
    executor: Executor,
    hub: EventHub,
    notifier: Arc<dyn Notifier>,
    tracker: TaskTracker,
}

impl Runner {
    pub fn new(store: Arc<dyn Store>, hub: EventHub, config: ExecutorConfig) -> Self {
        Self {
            gate: ConcurrencyGate::new(Arc::clone(&store)),
            executor: Executor::new(Arc::clone(&store), hub.clone(), config),
            store,
            hub,
            notifier: Arc::new(LogNotifier),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Register a live listener, optionally for a single run.
    pub fn subscribe(&self, run_id: Option<Uuid>) -> Subscription {
        self.hub.subscribe(run_id)
    }

    /// Start a manual run of `job_id` in the background and return it while
    /// still `pending`. Fails with [`CronError::Busy`] if another run is active.
    pub async fn trigger_job(self: &Arc<Self>, job_id: Uuid) -> Result<Run> {
        self.trigger(job_id, false).await.map(|(run, _)| run)
    }

    /// Like [`Runner::trigger_job`], but subscribes to the run before it
    /// starts so no event is missed.
    pub async fn trigger_and_watch(self: &Arc<Self>, job_id: Uuid) -> Result<(Run, Subscription)> {
        let (run, subscription) = self.trigger(job_id, true).await?;
        let subscription = subscription.unwrap_or_else(|| self.hub.subscribe(Some(run.id)));
        Ok((run, subscription))
    }

    async fn trigger(
        self: &Arc<Self>,
        job_id: Uuid,
        watch: bool,
    ) -> Result<(Run, Option<Subscription>)> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CronError::JobNotFound(job_id.to_string()))?;

        let run = self.gate.admit(&job, TriggerType::Manual).await?;
        tracing::info!(job_id = %job.id, run_id = %run.id, job = %job.name, "Manual trigger");

        let subscription = watch.then(|| self.hub.subscribe(Some(run.id)));
        let handler: Arc<dyn JobHandler> = Arc::clone(self) as Arc<dyn JobHandler>;
        dispatch(&self.tracker, handler, job, Some(run.clone()));
        Ok((run, subscription))
    }

    /// Fail runs a previous process left `pending` or `running`.
    pub async fn recover_orphaned_runs(&self) -> Result<usize> {
        let recent = self.store.list_runs(None, ORPHAN_SCAN_LIMIT, 0).await?;
        let mut recovered = 0;
        for run in recent.into_iter().filter(|run| run.status.is_active()) {
            tracing::warn!(run_id = %run.id, job_id = %run.job_id, status = %run.status, "Recovering orphaned run");
            self.executor
                .fail_run(run, "interrupted: scheduler restarted".to_string())
                .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Wait up to `grace` for manually triggered runs. Returns false on timeout.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let done = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        done
    }

    /// The executor applies `job.timeout_secs` itself, so no caller deadline is passed.
    async fn run_job(&self, job: &Job, run: Run) -> Result<Run> {
        let fallback = run.clone();

        match AssertUnwindSafe(self.executor.execute(run, job, None))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    job_id = %job.id,
                    run_id = %fallback.id,
                    panic = %panic_message(&panic),
                    "Executor panicked"
                );
                let current = match self.store.get_run(fallback.id).await {
                    Ok(Some(stored)) => stored,
                    _ => fallback,
                };
                if current.is_terminal() {
                    return Ok(current);
                }
                Ok(self
                    .executor
                    .fail_run(current, "executor panicked".to_string())
                    .await)
            }
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobHandler for Runner {
    async fn handle(&self, job: Job, run: Option<Run>) -> Result<()> {
        let run = match run {
            Some(run) => run,
            None => self.gate.admit(&job, TriggerType::Scheduled).await?,
        };
        let run_id = run.id;

        let span = tracing::info_span!("run", run_id = %run.id, job = %job.name, trigger = %run.trigger);
        let result = self.run_job(&job, run).instrument(span).await;

        // A spawn failure still leaves a terminal run behind.
        let finished = match &result {
            Ok(run) => Some(run.clone()),
            Err(_) => self.store.get_run(run_id).await.ok().flatten(),
        };
        if let Some(finished) = finished.filter(|run| job.notify.should_notify(run.status)) {
            self.notifier.notify(&job, &finished).await;
        }

        result.map(|_| ())
    }
}
