//! Runs shell jobs on a cron-like schedule or on demand.
//!
//! * [`schedule`] decides when a job is due.
//! * [`scheduler`] ticks once a minute and hands due jobs to a [`JobHandler`].
//! * [`gate`] allows one active run across all jobs.
//! * [`executor`] spawns and supervises the job process.
//! * [`events`] fans status and log events out to live subscribers.
//! * [`runner`] wires the pieces together and exposes manual triggers.
//!
//! Jobs, runs and log lines live behind the [`Store`] trait.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
pub mod job;
pub mod logging;
pub mod notify;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use config::Config;
pub use error::{CronError, Result};
pub use events::{Event, EventHub, EventPayload, Subscription};
pub use executor::{Executor, TIMEOUT_EXIT_CODE};
pub use gate::ConcurrencyGate;
pub use job::{Job, LogLine, Run, RunStatus, Stream, TriggerType};
pub use notify::{NotifyPolicy, Notifier};
pub use runner::Runner;
pub use schedule::ScheduleSpec;
pub use scheduler::{JobHandler, Scheduler, SchedulerState};
pub use store::{MemoryStore, Store};
