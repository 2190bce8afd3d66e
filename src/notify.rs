use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{Job, Run, RunStatus};

/// When a job's owner hears about a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    #[default]
    Never,
    /// Failures and timeouts.
    OnFailure,
    Always,
}

impl NotifyPolicy {
    pub fn should_notify(self, status: RunStatus) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure => matches!(status, RunStatus::Failure | RunStatus::Timeout),
            Self::Always => status.is_terminal(),
        }
    }
}

/// Receives terminal runs whose job policy asks for a notification.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, job: &Job, run: &Run);
}

/// Writes notifications to the tracing output.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &Job, run: &Run) {
        let subject = summary(job, run);
        if run.status == RunStatus::Success {
            tracing::info!(job_id = %job.id, run_id = %run.id, "{subject}");
        } else {
            tracing::warn!(
                job_id = %job.id,
                run_id = %run.id,
                error = run.error.as_deref().unwrap_or(""),
                "{subject}"
            );
        }
    }
}

/// One-line description of a run outcome.
pub fn summary(job: &Job, run: &Run) -> String {
    let mut line = format!("Job '{}' finished with status {}", job.name, run.status);
    if let Some(code) = run.exit_code {
        line.push_str(&format!(" (exit code {code})"));
    }
    if let Some(ms) = run.duration_ms {
        line.push_str(&format!(" after {ms}ms"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_matrix() {
        assert!(!NotifyPolicy::Never.should_notify(RunStatus::Failure));
        assert!(NotifyPolicy::OnFailure.should_notify(RunStatus::Failure));
        assert!(NotifyPolicy::OnFailure.should_notify(RunStatus::Timeout));
        assert!(!NotifyPolicy::OnFailure.should_notify(RunStatus::Success));
        assert!(NotifyPolicy::Always.should_notify(RunStatus::Success));
        assert!(!NotifyPolicy::Always.should_notify(RunStatus::Running));
    }
}
