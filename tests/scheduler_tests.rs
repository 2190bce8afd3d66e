use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cronrunner::{
    CronError, Job, JobHandler, MemoryStore, Result, Run, ScheduleSpec, Scheduler,
    SchedulerState, Store,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Records every job it is asked to handle.
#[derive(Default)]
struct RecordingHandler {
    handled: Mutex<Vec<(String, bool)>>,
    fail: Option<String>,
    panic: Option<String>,
}

impl RecordingHandler {
    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handled.lock().iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: Job, run: Option<Run>) -> Result<()> {
        self.handled.lock().push((job.name.clone(), run.is_some()));
        if self.panic.as_deref() == Some(job.name.as_str()) {
            panic!("handler blew up on {}", job.name);
        }
        if self.fail.as_deref() == Some(job.name.as_str()) {
            return Err(CronError::InvalidJob(job.name));
        }
        Ok(())
    }
}

async fn add_job(store: &Arc<MemoryStore>, name: &str, expr: &str) -> Job {
    let job = Job::new(name, "true", ScheduleSpec::parse(expr).unwrap());
    store.save_job(job).await.unwrap()
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, h, m, s).unwrap()
}

fn scheduler(store: &Arc<MemoryStore>, handler: &Arc<RecordingHandler>) -> Scheduler {
    Scheduler::new(store.clone(), handler.clone())
}

#[tokio::test]
async fn test_tick_dispatches_only_due_jobs() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler::default());
    add_job(&store, "nine-am", "0 9 * * *").await;
    add_job(&store, "every-minute", "* * * * *").await;
    add_job(&store, "ten-am", "0 10 * * *").await;

    let mut scheduler = scheduler(&store, &handler);
    assert_eq!(scheduler.tick(at(9, 0, 30)).await, 2);
    assert!(scheduler.drain(Duration::from_secs(1)).await);

    assert_eq!(handler.names(), vec!["every-minute", "nine-am"]);
    // Scheduled triggers leave run creation to the handler.
    assert!(handler.handled.lock().iter().all(|(_, has_run)| !has_run));
}

#[tokio::test]
async fn test_same_minute_fires_once() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler::default());
    add_job(&store, "nine-am", "0 9 * * *").await;

    let mut scheduler = scheduler(&store, &handler);
    assert_eq!(scheduler.tick(at(9, 0, 1)).await, 1);
    assert_eq!(scheduler.tick(at(9, 0, 59)).await, 0);
    assert_eq!(scheduler.tick(at(9, 1, 0)).await, 0);
    assert!(scheduler.drain(Duration::from_secs(1)).await);

    assert_eq!(handler.names(), vec!["nine-am"]);
}

#[tokio::test]
async fn test_next_matching_minute_fires_again() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler::default());
    add_job(&store, "every-minute", "* * * * *").await;

    let mut scheduler = scheduler(&store, &handler);
    assert_eq!(scheduler.tick(at(9, 0, 0)).await, 1);
    assert_eq!(scheduler.tick(at(9, 1, 0)).await, 1);
    assert!(scheduler.drain(Duration::from_secs(1)).await);

    assert_eq!(handler.handled.lock().len(), 2);
}

#[tokio::test]
async fn test_disabled_jobs_skipped() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let mut job = add_job(&store, "paused", "* * * * *").await;
    job.enabled = false;
    store.save_job(job).await.unwrap();

    let mut scheduler = scheduler(&store, &handler);
    assert_eq!(scheduler.tick(at(9, 0, 0)).await, 0);
    assert!(handler.handled.lock().is_empty());
}

#[tokio::test]
async fn test_handler_errors_and_panics_are_contained() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler {
        fail: Some("broken".to_string()),
        panic: Some("explosive".to_string()),
        ..RecordingHandler::default()
    });
    add_job(&store, "broken", "* * * * *").await;
    add_job(&store, "explosive", "* * * * *").await;
    add_job(&store, "healthy", "* * * * *").await;

    let mut scheduler = scheduler(&store, &handler);
    assert_eq!(scheduler.tick(at(9, 0, 0)).await, 3);
    assert!(scheduler.drain(Duration::from_secs(1)).await);

    // The loop keeps going on the next minute.
    assert_eq!(scheduler.tick(at(9, 1, 0)).await, 3);
    assert!(scheduler.drain(Duration::from_secs(1)).await);

    assert_eq!(handler.handled.lock().len(), 6);
}

#[tokio::test]
async fn test_deleted_job_stops_firing() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let job = add_job(&store, "short-lived", "* * * * *").await;

    let mut scheduler = scheduler(&store, &handler);
    assert_eq!(scheduler.tick(at(9, 0, 0)).await, 1);
    assert!(store.delete_job(job.id).await.unwrap());
    assert_eq!(scheduler.tick(at(9, 1, 0)).await, 0);
    assert!(!store.delete_job(Uuid::new_v4()).await.unwrap());
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RecordingHandler::default());
    add_job(&store, "every-minute", "* * * * *").await;

    let mut scheduler =
        scheduler(&store, &handler).with_tick_interval(Duration::from_millis(20));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        scheduler.run(token).await;
        scheduler
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    let scheduler = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(scheduler.drain(Duration::from_secs(1)).await);
    // Many ticks, but at most one firing per wall-clock minute.
    let fired = handler.handled.lock().len();
    assert!((1..=2).contains(&fired), "fired {fired} times");
}
