//! MongoDB implementation of [`Store`].
//!
//! Documents use string ids and millisecond timestamps so that filters and
//! sorts behave the same regardless of how the driver encodes `Uuid` and
//! `DateTime`. Run and log ordering comes from per-key counters in the
//! `counters` collection.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions, ReturnDocument,
};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Database;
use crate::error::{CronError, Result};
use crate::job::{Job, LogLine, Run, RunStatus, Stream, TriggerType};
use crate::notify::NotifyPolicy;
use crate::schedule::ScheduleSpec;
use crate::store::Store;

const RUNS_COUNTER: &str = "runs";

pub struct MongoStore {
    jobs: Collection<JobRecord>,
    runs: Collection<RunRecord>,
    logs: Collection<LogRecord>,
    counters: Collection<Document>,
}

impl MongoStore {
    /// Connect, ping the server and make sure the indexes exist.
    pub async fn connect(config: &Database) -> Result<MongoStore> {
        let client = Client::with_uri_str(&config.uri).await?;
        client
            .database("admin")
            .run_command(doc! {"ping": 1}, None)
            .await?;

        let db = client.database(&config.name);
        let store = MongoStore {
            jobs: db.collection("jobs"),
            runs: db.collection("runs"),
            logs: db.collection("logs"),
            counters: db.collection("counters"),
        };
        store.ensure_indexes().await?;

        tracing::info!(database = %config.name, "Connected to MongoDB");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.runs
            .create_index(IndexModel::builder().keys(doc! {"seq": -1}).build(), None)
            .await?;
        self.runs
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"job_id": 1, "seq": -1})
                    .build(),
                None,
            )
            .await?;
        self.logs
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"run_id": 1, "seq": 1})
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn next_seq(&self, key: &str) -> Result<i64> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = self
            .counters
            .find_one_and_update(doc! {"_id": key}, doc! {"$inc": {"seq": 1_i64}}, options)
            .await?
            .ok_or_else(|| CronError::Store(format!("counter '{key}' missing after upsert")))?;
        counter
            .get_i64("seq")
            .map_err(|e| CronError::Store(format!("counter '{key}': {e}")))
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn save_job(&self, job: Job) -> Result<Job> {
        job.schedule.validate()?;
        let record = JobRecord::from(&job);
        let options = ReplaceOptions::builder().upsert(true).build();
        self.jobs
            .replace_one(doc! {"_id": record.id.as_str()}, &record, options)
            .await?;
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.jobs
            .find_one(doc! {"_id": id.to_string()}, None)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_jobs(&self, enabled_only: bool) -> Result<Vec<Job>> {
        let filter = enabled_only.then(|| doc! {"enabled": true});
        let options = FindOptions::builder().sort(doc! {"name": 1}).build();
        let records: Vec<JobRecord> = self.jobs.find(filter, options).await?.try_collect().await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool> {
        let result = self
            .jobs
            .delete_one(doc! {"_id": id.to_string()}, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn create_run(&self, job_id: Uuid, trigger: TriggerType) -> Result<Run> {
        let run = Run::new(job_id, trigger);
        let mut record = RunRecord::from(&run);
        record.seq = Some(self.next_seq(RUNS_COUNTER).await?);
        self.runs.insert_one(&record, None).await?;
        Ok(run)
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut fields = bson::to_document(&RunRecord::from(run))
            .map_err(|e| CronError::Store(format!("encoding run {}: {e}", run.id)))?;
        fields.remove("_id");
        let result = self
            .runs
            .update_one(doc! {"_id": run.id.to_string()}, doc! {"$set": fields}, None)
            .await?;
        if result.matched_count == 0 {
            return Err(CronError::RunNotFound(run.id));
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        self.runs
            .find_one(doc! {"_id": id.to_string()}, None)
            .await?
            .map(Run::try_from)
            .transpose()
    }

    async fn list_runs(
        &self,
        job_id: Option<Uuid>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>> {
        let filter = job_id.map(|id| doc! {"job_id": id.to_string()});
        let options = FindOptions::builder()
            .sort(doc! {"seq": -1})
            .skip(offset as u64)
            .limit(limit as i64)
            .build();
        let records: Vec<RunRecord> = self.runs.find(filter, options).await?.try_collect().await?;
        records.into_iter().map(Run::try_from).collect()
    }

    async fn add_log(
        &self,
        run_id: Uuid,
        stream: Stream,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Result<LogLine> {
        let line = LogLine {
            run_id,
            seq: self.next_seq(&run_id.to_string()).await? as u64,
            stream,
            content,
            timestamp,
        };
        self.logs.insert_one(LogRecord::from(&line), None).await?;
        Ok(line)
    }

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<LogLine>> {
        let options = FindOptions::builder().sort(doc! {"seq": 1}).build();
        let records: Vec<LogRecord> = self
            .logs
            .find(doc! {"run_id": run_id.to_string()}, options)
            .await?
            .try_collect()
            .await?;
        records.into_iter().map(LogLine::try_from).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    script: String,
    #[serde(default)]
    working_dir: Option<String>,
    timeout_secs: i64,
    schedule: ScheduleSpec,
    enabled: bool,
    notify: NotifyPolicy,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name.clone(),
            script: job.script.clone(),
            working_dir: job
                .working_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            timeout_secs: job.timeout_secs as i64,
            schedule: job.schedule.clone(),
            enabled: job.enabled,
            notify: job.notify,
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = CronError;

    fn try_from(record: JobRecord) -> Result<Self> {
        record.schedule.validate()?;
        Ok(Job {
            id: parse_id(&record.id)?,
            name: record.name,
            script: record.script,
            working_dir: record.working_dir.map(PathBuf::from),
            timeout_secs: record.timeout_secs.max(0) as u64,
            schedule: record.schedule,
            enabled: record.enabled,
            notify: record.notify,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RunRecord {
    #[serde(rename = "_id")]
    id: String,
    job_id: String,
    /// Creation order; only written on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<i64>,
    status: RunStatus,
    trigger: TriggerType,
    created_ms: i64,
    started_ms: Option<i64>,
    finished_ms: Option<i64>,
    duration_ms: Option<i64>,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl From<&Run> for RunRecord {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.to_string(),
            job_id: run.job_id.to_string(),
            seq: None,
            status: run.status,
            trigger: run.trigger,
            created_ms: run.created_at.timestamp_millis(),
            started_ms: run.started_at.map(|t| t.timestamp_millis()),
            finished_ms: run.finished_at.map(|t| t.timestamp_millis()),
            duration_ms: run.duration_ms,
            exit_code: run.exit_code,
            error: run.error.clone(),
        }
    }
}

impl TryFrom<RunRecord> for Run {
    type Error = CronError;

    fn try_from(record: RunRecord) -> Result<Self> {
        Ok(Run {
            id: parse_id(&record.id)?,
            job_id: parse_id(&record.job_id)?,
            status: record.status,
            trigger: record.trigger,
            created_at: from_millis(record.created_ms)?,
            started_at: record.started_ms.map(from_millis).transpose()?,
            finished_at: record.finished_ms.map(from_millis).transpose()?,
            duration_ms: record.duration_ms,
            exit_code: record.exit_code,
            error: record.error,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    run_id: String,
    seq: i64,
    stream: Stream,
    content: String,
    timestamp_ms: i64,
}

impl From<&LogLine> for LogRecord {
    fn from(line: &LogLine) -> Self {
        Self {
            run_id: line.run_id.to_string(),
            seq: line.seq as i64,
            stream: line.stream,
            content: line.content.clone(),
            timestamp_ms: line.timestamp.timestamp_millis(),
        }
    }
}

impl TryFrom<LogRecord> for LogLine {
    type Error = CronError;

    fn try_from(record: LogRecord) -> Result<Self> {
        Ok(LogLine {
            run_id: parse_id(&record.run_id)?,
            seq: record.seq.max(0) as u64,
            stream: record.stream,
            content: record.content,
            timestamp: from_millis(record.timestamp_ms)?,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CronError::Store(format!("invalid id '{raw}': {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CronError::Store(format!("invalid timestamp {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_record_round_trips_through_bson() {
        let mut run = Run::new(Uuid::new_v4(), TriggerType::Manual);
        run.mark_running(Utc::now());
        run.finish(RunStatus::Failure, Some(3), Some("exit status: 3".into()), Utc::now());

        let doc = bson::to_document(&RunRecord::from(&run)).unwrap();
        assert!(doc.get("seq").is_none());
        assert_eq!(doc.get_str("status").unwrap(), "failure");

        let back: RunRecord = bson::from_document(doc).unwrap();
        let back = Run::try_from(back).unwrap();
        assert_eq!(back.id, run.id);
        assert_eq!(back.status, RunStatus::Failure);
        assert_eq!(back.exit_code, Some(3));
        assert_eq!(
            back.started_at.unwrap().timestamp_millis(),
            run.started_at.unwrap().timestamp_millis()
        );
    }

    #[test]
    fn job_record_keeps_schedule_sets() {
        let mut job = Job::new("nightly", "echo hi", ScheduleSpec::parse("0 2 * * 1-5").unwrap());
        job.working_dir = Some(PathBuf::from("/srv"));
        let doc = bson::to_document(&JobRecord::from(&job)).unwrap();
        let back = Job::try_from(bson::from_document::<JobRecord>(doc).unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn out_of_range_schedule_rejected_on_load() {
        let job = Job::new("broken", "echo hi", ScheduleSpec::every_minute());
        let mut record = JobRecord::from(&job);
        record.schedule.hours.insert(25);

        let err = Job::try_from(record).unwrap_err();
        assert!(matches!(err, CronError::InvalidSchedule { .. }));
    }

    #[test]
    fn corrupt_id_is_a_store_error() {
        assert!(matches!(parse_id("not-a-uuid"), Err(CronError::Store(_))));
    }
}
