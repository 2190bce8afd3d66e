use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CronError, Result};
use crate::events::DEFAULT_CAPACITY;
use crate::job::{Job, DEFAULT_TIMEOUT_SECS, MAX_SCRIPT_BYTES};
use crate::notify::NotifyPolicy;
use crate::schedule::ScheduleSpec;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CRONRUNNER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "app.toml";

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    /// Without a database the scheduler keeps everything in memory.
    pub database: Option<Database>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    /// Jobs upserted into the store when the scheduler starts.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Database {
    pub uri: String,
    #[serde(default = "default_database_name")]
    pub name: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Fail runs left active by a previous process so the gate reopens.
    pub recover_orphaned_runs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            shutdown_grace_secs: 30,
            recover_orphaned_runs: true,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ExecutorConfig {
    pub shell: String,
    pub max_script_bytes: usize,
    /// How long to wait for output pipes to close after the shell exits.
    pub drain_grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            max_script_bytes: MAX_SCRIPT_BYTES,
            drain_grace_secs: 5,
        }
    }
}

impl ExecutorConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// A job declared in the config file.
#[derive(Deserialize, Clone, Debug)]
pub struct JobDefinition {
    pub name: String,
    /// 5-field cron expression.
    pub schedule: String,
    pub script: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notify: NotifyPolicy,
}

impl JobDefinition {
    pub fn to_job(&self) -> Result<Job> {
        let mut job = Job::new(&self.name, &self.script, ScheduleSpec::parse(&self.schedule)?);
        job.id = Job::id_for_name(&self.name);
        job.timeout_secs = self.timeout_secs;
        job.working_dir = self.working_dir.clone();
        job.enabled = self.enabled;
        job.notify = self.notify;
        Ok(job)
    }
}

fn default_database_name() -> String {
    "cronrunner".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from(file: &str) -> Result<Config> {
        let raw = fs::read_to_string(file)
            .map_err(|e| CronError::Config(format!("cannot read '{file}': {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The config path from `CRONRUNNER_CONFIG`, falling back to `app.toml`.
    pub fn path_from_env() -> String {
        env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(CronError::Config("scheduler.tick_secs must be >= 1".into()));
        }
        if self.executor.shell.trim().is_empty() {
            return Err(CronError::Config("executor.shell must not be empty".into()));
        }
        if self.executor.max_script_bytes == 0 {
            return Err(CronError::Config(
                "executor.max_script_bytes must be >= 1".into(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(CronError::Config("events.capacity must be >= 1".into()));
        }
        for def in &self.jobs {
            def.to_job()
                .map_err(|e| CronError::Config(format!("job '{}': {e}", def.name)))?;
            if def.script.len() > self.executor.max_script_bytes {
                return Err(CronError::Config(format!(
                    "job '{}': script exceeds {} bytes",
                    def.name, self.executor.max_script_bytes
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.scheduler.tick_secs, 60);
        assert!(config.scheduler.recover_orphaned_runs);
        assert_eq!(config.executor.shell, "/bin/sh");
        assert_eq!(config.executor.max_script_bytes, 1024 * 1024);
        assert_eq!(config.events.capacity, DEFAULT_CAPACITY);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [database]
            uri = "mongodb://localhost:27017"

            [scheduler]
            tick_secs = 30
            shutdown_grace_secs = 5

            [executor]
            shell = "/bin/bash"

            [[jobs]]
            name = "backup"
            schedule = "0 3 * * *"
            script = "tar czf /tmp/backup.tgz /srv"
            timeout_secs = 600
            notify = "on_failure"
        "#;
        let config = Config::parse(raw).unwrap();

        let db = config.database.unwrap();
        assert_eq!(db.uri, "mongodb://localhost:27017");
        assert_eq!(db.name, "cronrunner");
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.scheduler.shutdown_grace_secs, 5);
        assert_eq!(config.executor.shell, "/bin/bash");
        assert_eq!(config.executor.drain_grace_secs, 5);

        let job = config.jobs[0].to_job().unwrap();
        assert_eq!(job.id, Job::id_for_name("backup"));
        assert_eq!(job.timeout_secs, 600);
        assert_eq!(job.notify, NotifyPolicy::OnFailure);
        assert!(job.enabled);
        assert_eq!(job.schedule.hours.iter().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::parse("[scheduler]\ntick_secs = 0").is_err());
        assert!(Config::parse("[events]\ncapacity = 0").is_err());
        assert!(Config::parse("[executor]\nshell = \"\"").is_err());

        let bad_job = r#"
            [[jobs]]
            name = "broken"
            schedule = "61 * * * *"
            script = "true"
        "#;
        match Config::parse(bad_job) {
            Err(CronError::Config(msg)) => assert!(msg.contains("broken")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            Config::from("/nonexistent/cronrunner.toml"),
            Err(CronError::Config(_))
        ));
    }
}
