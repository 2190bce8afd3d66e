//! Persistence boundary for jobs, runs and log lines.
//!
//! The engine only talks to [`Store`]. [`MemoryStore`] keeps everything in
//! process and backs the tests; [`crate::db::MongoStore`] is the durable
//! implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CronError, Result};
use crate::job::{Job, LogLine, Run, Stream, TriggerType};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert or replace a job by id. Schedules with out-of-range values
    /// are rejected.
    async fn save_job(&self, job: Job) -> Result<Job>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn list_jobs(&self, enabled_only: bool) -> Result<Vec<Job>>;

    async fn delete_job(&self, id: Uuid) -> Result<bool>;

    /// Create a `pending` run for the job.
    async fn create_run(&self, job_id: Uuid, trigger: TriggerType) -> Result<Run>;

    async fn update_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;

    /// Runs ordered newest first, optionally restricted to one job.
    async fn list_runs(&self, job_id: Option<Uuid>, limit: usize, offset: usize)
        -> Result<Vec<Run>>;

    /// Append a line to a run's log, assigning the next sequence number.
    /// `timestamp` is when the line was captured.
    async fn add_log(
        &self,
        run_id: Uuid,
        stream: Stream,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Result<LogLine>;

    /// All lines of a run in sequence order.
    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<LogLine>>;
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// Creation order, oldest first.
    runs: Vec<Run>,
    logs: HashMap<Uuid, Vec<LogLine>>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_job(&self, job: Job) -> Result<Job> {
        job.schedule.validate()?;
        self.inner.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, enabled_only: bool) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| !enabled_only || job.enabled)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.inner.lock().jobs.remove(&id).is_some())
    }

    async fn create_run(&self, job_id: Uuid, trigger: TriggerType) -> Result<Run> {
        let run = Run::new(job_id, trigger);
        self.inner.lock().runs.push(run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.runs.iter_mut().find(|r| r.id == run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(CronError::RunNotFound(run.id)),
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.inner.lock().runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(
        &self,
        job_id: Option<Uuid>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>> {
        let inner = self.inner.lock();
        Ok(inner
            .runs
            .iter()
            .rev()
            .filter(|r| job_id.map_or(true, |id| r.job_id == id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn add_log(
        &self,
        run_id: Uuid,
        stream: Stream,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Result<LogLine> {
        let mut inner = self.inner.lock();
        let lines = inner.logs.entry(run_id).or_default();
        let line = LogLine {
            run_id,
            seq: lines.len() as u64 + 1,
            stream,
            content,
            timestamp,
        };
        lines.push(line.clone());
        Ok(line)
    }

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<LogLine>> {
        Ok(self
            .inner
            .lock()
            .logs
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
