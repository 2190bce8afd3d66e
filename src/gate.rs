//! Single-active-run policy.
//!
//! At most one run may be `pending` or `running` across all jobs. The gate
//! answers from the store's most recent run rather than an in-memory counter,
//! so the rule holds across restarts.
//!
//! The executor does not re-check the gate. Every trigger path must go
//! through [`ConcurrencyGate::admit`] (or at least [`ConcurrencyGate::can_execute`])
//! before a run is handed to the executor. `admit` serializes check-and-create
//! within one process; two processes sharing a store can still both observe
//! an idle gate and create a run each.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{CronError, Result};
use crate::job::{Job, Run, TriggerType};
use crate::store::Store;

pub struct ConcurrencyGate {
    store: Arc<dyn Store>,
    admission: Mutex<()>,
}

impl ConcurrencyGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            admission: Mutex::new(()),
        }
    }

    pub async fn can_execute(&self) -> Result<bool> {
        Ok(self.active_run().await?.is_none())
    }

    /// The most recent run, when it is still pending or running.
    pub async fn active_run(&self) -> Result<Option<Run>> {
        let latest = self.store.list_runs(None, 1, 0).await?;
        Ok(latest.into_iter().next().filter(|run| run.status.is_active()))
    }

    /// Create a pending run for `job` if nothing else is active.
    pub async fn admit(&self, job: &Job, trigger: TriggerType) -> Result<Run> {
        let _guard = self.admission.lock().await;

        if let Some(active) = self.active_run().await? {
            return Err(CronError::Busy(active.id));
        }

        let run = self.store.create_run(job.id, trigger).await?;
        tracing::debug!(job_id = %job.id, run_id = %run.id, %trigger, "Run admitted");
        Ok(run)
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RunStatus;
    use crate::schedule::ScheduleSpec;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn setup() -> (Arc<MemoryStore>, ConcurrencyGate) {
        let store = Arc::new(MemoryStore::new());
        let gate = ConcurrencyGate::new(store.clone());
        (store, gate)
    }

    #[tokio::test]
    async fn empty_store_can_execute() {
        let (_, gate) = setup();
        assert!(gate.can_execute().await.unwrap());
        assert!(gate.active_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocks_while_pending_or_running_and_releases_on_terminal() {
        let (store, gate) = setup();
        let job = Job::new("a", "true", ScheduleSpec::default());

        let mut run = gate.admit(&job, TriggerType::Manual).await.unwrap();
        assert!(!gate.can_execute().await.unwrap());
        assert_eq!(gate.active_run().await.unwrap().unwrap().id, run.id);

        run.mark_running(Utc::now());
        store.update_run(&run).await.unwrap();
        assert!(!gate.can_execute().await.unwrap());

        for status in [RunStatus::Success, RunStatus::Failure, RunStatus::Timeout] {
            let mut r = run.clone();
            r.finish(status, None, None, Utc::now());
            store.update_run(&r).await.unwrap();
            assert!(gate.can_execute().await.unwrap(), "{status} should release the gate");
        }
    }

    #[tokio::test]
    async fn gate_is_global_across_jobs() {
        let (_, gate) = setup();
        let a = Job::new("a", "true", ScheduleSpec::default());
        let b = Job::new("b", "true", ScheduleSpec::default());

        let active = gate.admit(&a, TriggerType::Scheduled).await.unwrap();
        match gate.admit(&b, TriggerType::Manual).await {
            Err(CronError::Busy(id)) => assert_eq!(id, active.id),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_admissions_let_exactly_one_through() {
        let (store, gate) = setup();
        let gate = Arc::new(gate);
        let job = Job::new("a", "true", ScheduleSpec::default());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                gate.admit(&job, TriggerType::Scheduled).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.list_runs(None, 100, 0).await.unwrap().len(), 1);
    }
}
