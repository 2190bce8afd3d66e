//! Process supervision for a single run.
//!
//! [`Executor::execute`] owns the run from `pending` to its terminal status:
//! it spawns `<shell> -c <script>` in a fresh process group, captures stdout
//! and stderr line by line on two tasks, enforces the deadline by killing the
//! whole group, and records the outcome. Callers must have admitted the run
//! through [`crate::gate::ConcurrencyGate`] first; nothing here re-checks it.
//!
//! Event order per run: the `running` status, then log lines, then one final
//! `system` line, the terminal write to the store, and the terminal status.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{CronError, Result};
use crate::events::{Event, EventHub};
use crate::job::{Job, LogLine, Run, RunStatus, Stream};
use crate::store::Store;

/// Exit code recorded for runs killed at their deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// How long to wait for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Executor {
    store: Arc<dyn Store>,
    hub: EventHub,
    config: ExecutorConfig,
}

enum Exit {
    Waited(io::Result<ExitStatus>),
    DeadlineExceeded,
}

/// Which limit produced the effective deadline.
#[derive(Debug, Clone, Copy)]
enum Limit {
    Job(u64),
    Caller(Duration),
}

impl Limit {
    fn describe(self) -> String {
        match self {
            Self::Job(secs) => format!("job exceeded its timeout of {secs}s"),
            Self::Caller(d) => format!(
                "execution deadline reached after {:.1}s",
                d.as_secs_f64()
            ),
        }
    }
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, hub: EventHub, config: ExecutorConfig) -> Self {
        Self { store, hub, config }
    }

    /// Run `job` for the pending `run` and return the terminal run.
    ///
    /// Once the process has started the outcome is reported through the run
    /// (and the store/events), never through `Err`. `Err` means the process
    /// could not be started; the run is still marked `failure` first.
    pub async fn execute(&self, mut run: Run, job: &Job, deadline: Option<Instant>) -> Result<Run> {
        if let Err(reason) = self.validate(job) {
            tracing::warn!(job_id = %job.id, run_id = %run.id, reason = %reason, "Rejecting job");
            return Ok(self.fail_run(run, reason).await);
        }

        run.mark_running(Utc::now());
        self.persist(&run).await;
        self.hub.publish(Event::status(&run));

        let start = Instant::now();
        let limit = effective_deadline(start, job.timeout_secs, deadline);

        let mut child = match self.spawn(job, &run) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job.id, run_id = %run.id, error = %e, "Failed to spawn process");
                self.fail_run(run, format!("failed to spawn process: {e}")).await;
                return Err(CronError::Spawn(e));
            }
        };
        let pid = child.id();
        tracing::debug!(job_id = %job.id, run_id = %run.id, pid = ?pid, "Process started");

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                kill_tree(&mut child, pid).await;
                self.fail_run(run, "failed to capture process output".to_string())
                    .await;
                return Err(CronError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stdout/stderr pipe missing",
                )));
            }
        };

        let sink = LogSink {
            run_id: run.id,
            store: Arc::clone(&self.store),
            hub: self.hub.clone(),
        };
        let mut readers = JoinSet::new();
        readers.spawn(capture(stdout, Stream::Stdout, sink.clone()));
        readers.spawn(capture(stderr, Stream::Stderr, sink));

        let exit = match limit {
            Some((at, _)) => tokio::select! {
                status = child.wait() => Exit::Waited(status),
                _ = tokio::time::sleep_until(at) => Exit::DeadlineExceeded,
            },
            None => Exit::Waited(child.wait().await),
        };

        if matches!(exit, Exit::DeadlineExceeded) {
            tracing::warn!(
                job_id = %job.id,
                run_id = %run.id,
                timeout_secs = job.timeout_secs,
                "Deadline exceeded, killing process group"
            );
            kill_tree(&mut child, pid).await;
        }

        self.drain(&mut readers, pid, run.id).await;

        let (status, exit_code, error) = classify(exit, limit.map(|(_, limit)| limit));
        self.finish(&mut run, status, exit_code, error).await;
        Ok(run)
    }

    /// Mark a run `failure` without running anything and publish the outcome.
    pub async fn fail_run(&self, mut run: Run, reason: String) -> Run {
        self.finish(&mut run, RunStatus::Failure, None, Some(reason))
            .await;
        run
    }

    fn validate(&self, job: &Job) -> std::result::Result<(), String> {
        if job.script.trim().is_empty() {
            return Err("script is empty".to_string());
        }
        if job.script.len() > self.config.max_script_bytes {
            return Err(format!(
                "script is {} bytes, limit is {} bytes",
                job.script.len(),
                self.config.max_script_bytes
            ));
        }
        Ok(())
    }

    fn spawn(&self, job: &Job, run: &Run) -> io::Result<Child> {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(&job.script)
            .env("CRONRUNNER_JOB_ID", job.id.to_string())
            .env("CRONRUNNER_JOB_NAME", &job.name)
            .env("CRONRUNNER_RUN_ID", run.id.to_string())
            .env("CRONRUNNER_TRIGGER", run.trigger.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &job.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so a deadline kill reaches everything the script forks.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }

    /// Wait for both readers. If background processes keep the pipes open past
    /// the grace period, kill the group and try once more before giving up.
    async fn drain(&self, readers: &mut JoinSet<()>, pid: Option<u32>, run_id: Uuid) {
        let grace = self.config.drain_grace();
        if join_within(readers, grace).await {
            return;
        }

        tracing::warn!(run_id = %run_id, "Output still open after exit, killing process group");
        kill_group(pid);
        if !join_within(readers, grace).await {
            tracing::error!(run_id = %run_id, "Log readers did not finish, aborting them");
            readers.abort_all();
        }
    }

    async fn finish(
        &self,
        run: &mut Run,
        status: RunStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        run.finish(status, exit_code, error, Utc::now());

        let sink = LogSink {
            run_id: run.id,
            store: Arc::clone(&self.store),
            hub: self.hub.clone(),
        };
        sink.emit(Stream::System, summarize(run), Utc::now()).await;

        self.persist(run).await;
        self.hub.publish(Event::status(run));

        tracing::info!(
            run_id = %run.id,
            job_id = %run.job_id,
            status = %run.status,
            exit_code = ?run.exit_code,
            duration_ms = ?run.duration_ms,
            "Run finished"
        );
    }

    async fn persist(&self, run: &Run) {
        if let Err(e) = self.store.update_run(run).await {
            tracing::warn!(run_id = %run.id, status = %run.status, error = %e, "Failed to persist run");
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Persists and broadcasts captured lines for one run.
#[derive(Clone)]
struct LogSink {
    run_id: Uuid,
    store: Arc<dyn Store>,
    hub: EventHub,
}

impl LogSink {
    async fn emit(&self, stream: Stream, content: String, captured: DateTime<Utc>) {
        let line = match self
            .store
            .add_log(self.run_id, stream, content.clone(), captured)
            .await
        {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, %stream, error = %e, "Failed to persist log line");
                LogLine {
                    run_id: self.run_id,
                    seq: 0,
                    stream,
                    content,
                    timestamp: captured,
                }
            }
        };
        self.hub.publish(Event::log(&line));
    }
}

async fn capture<R>(reader: R, stream: Stream, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            // A final chunk without a newline is emitted as-is.
            Ok(_) => sink.emit(stream, decode_line(&buf), Utc::now()).await,
            Err(e) => {
                tracing::warn!(run_id = %sink.run_id, %stream, error = %e, "Output read failed");
                break;
            }
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

async fn join_within(readers: &mut JoinSet<()>, grace: Duration) -> bool {
    let until = Instant::now() + grace;
    loop {
        match tokio::time::timeout_at(until, readers.join_next()).await {
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) if e.is_panic() => {
                tracing::error!(error = %e, "Log reader panicked");
            }
            Ok(Some(Err(_))) => {}
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

fn effective_deadline(
    start: Instant,
    timeout_secs: u64,
    caller: Option<Instant>,
) -> Option<(Instant, Limit)> {
    let job = (timeout_secs > 0)
        .then(|| (start + Duration::from_secs(timeout_secs), Limit::Job(timeout_secs)));
    let caller = caller.map(|at| (at, Limit::Caller(at.saturating_duration_since(start))));
    match (job, caller) {
        (Some(job), Some(caller)) => Some(if caller.0 < job.0 { caller } else { job }),
        (job, caller) => job.or(caller),
    }
}

fn classify(exit: Exit, limit: Option<Limit>) -> (RunStatus, Option<i32>, Option<String>) {
    match exit {
        Exit::DeadlineExceeded => {
            let reason = limit.map_or_else(|| "deadline exceeded".to_string(), Limit::describe);
            (RunStatus::Timeout, Some(TIMEOUT_EXIT_CODE), Some(reason))
        }
        Exit::Waited(Ok(status)) if status.success() => (RunStatus::Success, Some(0), None),
        // Signal deaths carry no exit code.
        Exit::Waited(Ok(status)) => (RunStatus::Failure, status.code(), Some(status.to_string())),
        Exit::Waited(Err(e)) => (RunStatus::Failure, None, Some(e.to_string())),
    }
}

fn summarize(run: &Run) -> String {
    let mut line = format!("Run finished with status {}", run.status);
    if let Some(code) = run.exit_code {
        line.push_str(&format!(", exit code {code}"));
    }
    if let Some(ms) = run.duration_ms {
        line.push_str(&format!(", took {ms}ms"));
    }
    if let Some(error) = &run.error {
        line.push_str(&format!(": {error}"));
    }
    line
}

/// SIGKILL the process group, then reap the direct child.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    let _ = child.start_kill();
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(pid = ?pid, error = %e, "Error waiting for killed process"),
        Err(_) => tracing::error!(pid = ?pid, "Process still alive after SIGKILL"),
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        // ESRCH just means the group is already gone.
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
