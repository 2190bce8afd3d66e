use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::NotifyPolicy;
use crate::schedule::ScheduleSpec;

/// Upper bound for a job's script body.
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// A user-defined shell job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    /// Shell script body, run through `<shell> -c`.
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Kill the run after this many seconds. Zero disables the job-level limit.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notify: NotifyPolicy,
}

impl Job {
    pub fn new(name: impl Into<String>, script: impl Into<String>, schedule: ScheduleSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            script: script.into(),
            working_dir: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            schedule,
            enabled: true,
            notify: NotifyPolicy::default(),
        }
    }

    /// Stable id derived from the job name, so re-declaring a job updates it.
    pub fn id_for_name(name: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
}

impl RunStatus {
    /// Success, failure and timeout never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub trigger: TriggerType,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl Run {
    pub fn new(job_id: Uuid, trigger: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            status: RunStatus::Pending,
            trigger,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.started_at = Some(at);
    }

    /// Move to a terminal status. A run that is already terminal is left untouched.
    pub fn finish(
        &mut self,
        status: RunStatus,
        exit_code: Option<i32>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.error = error;
        self.finished_at = Some(at);
        self.duration_ms = self
            .started_at
            .map(|started| (at - started).num_milliseconds().max(0));
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
    System,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
            Self::System => f.write_str("system"),
        }
    }
}

/// A captured line of output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub run_id: Uuid,
    /// Per-run order assigned by the store.
    pub seq: u64,
    pub stream: Stream,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
    }

    #[test]
    fn finish_computes_duration_and_is_final() {
        let mut run = Run::new(Uuid::new_v4(), TriggerType::Manual);
        let start = Utc::now();
        run.mark_running(start);

        assert!(run.finish(RunStatus::Failure, Some(3), Some("exit status: 3".into()), start + Duration::milliseconds(1500)));
        assert_eq!(run.duration_ms, Some(1500));
        assert_eq!(run.exit_code, Some(3));

        assert!(!run.finish(RunStatus::Success, Some(0), None, start + Duration::seconds(5)));
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.duration_ms, Some(1500));
    }

    #[test]
    fn run_never_started_has_no_duration() {
        let mut run = Run::new(Uuid::new_v4(), TriggerType::Scheduled);
        run.finish(RunStatus::Failure, None, Some("script is empty".into()), Utc::now());
        assert_eq!(run.duration_ms, None);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RunStatus::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(serde_json::to_string(&Stream::Stderr).unwrap(), "\"stderr\"");
    }

    #[test]
    fn name_derived_id_is_stable() {
        assert_eq!(Job::id_for_name("backup"), Job::id_for_name("backup"));
        assert_ne!(Job::id_for_name("backup"), Job::id_for_name("report"));
    }
}
