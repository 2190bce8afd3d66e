extern crate clap;
use std::fs;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use cronrunner::config::Config;
use cronrunner::db::MongoStore;
use cronrunner::events::EventPayload;
use cronrunner::{logging, EventHub, Job, NotifyPolicy, Runner, RunStatus, ScheduleSpec, Store};
use once_cell::sync::OnceCell;
use uuid::Uuid;

static CONFIG: OnceCell<Config> = OnceCell::new();

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config_file = Config::path_from_env();
    let config = Config::from(&config_file)
        .with_context(|| format!("Error while trying to read configuration file {config_file}"))?;
    CONFIG
        .set(config)
        .map_err(|_| anyhow!("configuration already initialised"))?;

    let matches = App::new("cronrunner-client")
        .version("0.1.0")
        .about("Manages cronrunner jobs and triggers runs by hand")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("add")
                .about("Creates or replaces a job")
                .arg(
                    Arg::with_name("name")
                        .short("n")
                        .long("name")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("schedule")
                        .short("t")
                        .long("schedule")
                        .value_name("CRON_SYNTAX")
                        .help("minute hour day-of-month month day-of-week")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("script")
                        .short("s")
                        .long("script")
                        .value_name("FILE")
                        .help("File holding the shell script to run")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("timeout")
                        .short("o")
                        .long("timeout")
                        .value_name("SECONDS")
                        .help("Kill the run after this many seconds, 0 for no limit")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("workdir")
                        .short("w")
                        .long("workdir")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("notify")
                        .long("notify")
                        .possible_values(&["never", "on_failure", "always"])
                        .takes_value(true),
                )
                .arg(Arg::with_name("disabled").long("disabled")),
        )
        .subcommand(SubCommand::with_name("list").about("Lists jobs"))
        .subcommand(
            SubCommand::with_name("runs")
                .about("Lists recent runs, newest first")
                .arg(Arg::with_name("job").long("job").takes_value(true))
                .arg(
                    Arg::with_name("limit")
                        .long("limit")
                        .takes_value(true)
                        .default_value("20"),
                ),
        )
        .subcommand(
            SubCommand::with_name("logs")
                .about("Prints the captured output of a run")
                .arg(Arg::with_name("run").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Runs a job now and follows its output")
                .arg(Arg::with_name("job").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("enable")
                .about("Enables a job")
                .arg(Arg::with_name("job").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("disable")
                .about("Disables a job")
                .arg(Arg::with_name("job").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("remove")
                .about("Deletes a job")
                .arg(Arg::with_name("job").required(true).index(1)),
        )
        .get_matches();

    let store = connect().await?;

    match matches.subcommand() {
        ("add", Some(args)) => add_job(&store, args).await,
        ("list", Some(_)) => list_jobs(&store).await,
        ("runs", Some(args)) => list_runs(&store, args).await,
        ("logs", Some(args)) => print_logs(&store, required(args, "run")?).await,
        ("run", Some(args)) => run_job(store, required(args, "job")?).await,
        ("enable", Some(args)) => set_enabled(&store, required(args, "job")?, true).await,
        ("disable", Some(args)) => set_enabled(&store, required(args, "job")?, false).await,
        ("remove", Some(args)) => remove_job(&store, required(args, "job")?).await,
        _ => bail!("unknown subcommand"),
    }
}

fn config() -> anyhow::Result<&'static Config> {
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("Could not get a config object"))
}

async fn connect() -> anyhow::Result<Arc<dyn Store>> {
    let database = config()?
        .database
        .as_ref()
        .ok_or_else(|| anyhow!("No [database] section in the configuration"))?;
    Ok(Arc::new(MongoStore::connect(database).await?))
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    args.value_of(name)
        .ok_or_else(|| anyhow!("missing argument '{name}'"))
}

/// Look a job up by id or by name.
async fn find_job(store: &Arc<dyn Store>, key: &str) -> anyhow::Result<Job> {
    if let Ok(id) = Uuid::parse_str(key) {
        if let Some(job) = store.get_job(id).await? {
            return Ok(job);
        }
    }
    store
        .list_jobs(false)
        .await?
        .into_iter()
        .find(|job| job.name == key)
        .ok_or_else(|| anyhow!("Job not found: {key}"))
}

async fn add_job(store: &Arc<dyn Store>, args: &ArgMatches<'_>) -> anyhow::Result<()> {
    let name = required(args, "name")?;
    let schedule = ScheduleSpec::parse(required(args, "schedule")?)?;
    let path = required(args, "script")?;
    let script = fs::read_to_string(path).with_context(|| format!("cannot read script {path}"))?;

    let max = config()?.executor.max_script_bytes;
    if script.len() > max {
        bail!("script is {} bytes, limit is {max} bytes", script.len());
    }

    let mut job = Job::new(name, script, schedule);
    job.id = Job::id_for_name(name);
    if let Some(timeout) = args.value_of("timeout") {
        job.timeout_secs = timeout
            .parse()
            .with_context(|| format!("invalid timeout '{timeout}'"))?;
    }
    job.working_dir = args.value_of("workdir").map(Into::into);
    job.notify = match args.value_of("notify") {
        Some("on_failure") => NotifyPolicy::OnFailure,
        Some("always") => NotifyPolicy::Always,
        _ => NotifyPolicy::Never,
    };
    job.enabled = !args.is_present("disabled");

    let job = store.save_job(job).await?;
    println!("{}\t{}\t{}", job.id, job.name, job.schedule);
    Ok(())
}

async fn list_jobs(store: &Arc<dyn Store>) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    for job in store.list_jobs(false).await? {
        let next = if job.enabled {
            job.schedule
                .next_after(&now)
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
        } else {
            "disabled".to_string()
        };
        println!(
            "{}\t{}\t{}\ttimeout={}s\tnext={}",
            job.id, job.name, job.schedule, job.timeout_secs, next
        );
    }
    Ok(())
}

async fn list_runs(store: &Arc<dyn Store>, args: &ArgMatches<'_>) -> anyhow::Result<()> {
    let job_id = match args.value_of("job") {
        Some(key) => Some(find_job(store, key).await?.id),
        None => None,
    };
    let limit: usize = required(args, "limit")?
        .parse()
        .context("invalid --limit")?;

    for run in store.list_runs(job_id, limit, 0).await? {
        println!(
            "{}\t{}\t{}\t{}\texit={}\t{}ms\t{}",
            run.id,
            run.job_id,
            run.trigger,
            run.status,
            run.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
            run.duration_ms.unwrap_or(0),
            run.error.unwrap_or_default()
        );
    }
    Ok(())
}

async fn print_logs(store: &Arc<dyn Store>, run: &str) -> anyhow::Result<()> {
    let run_id = Uuid::parse_str(run).with_context(|| format!("invalid run id '{run}'"))?;
    for line in store.list_logs(run_id).await? {
        println!("{} [{}] {}", line.timestamp.to_rfc3339(), line.stream, line.content);
    }
    Ok(())
}

async fn run_job(store: Arc<dyn Store>, key: &str) -> anyhow::Result<()> {
    let config = config()?;
    let job = find_job(&store, key).await?;
    let runner = Arc::new(Runner::new(
        store,
        EventHub::new(config.events.capacity),
        config.executor.clone(),
    ));

    let (run, mut events) = runner.trigger_and_watch(job.id).await?;
    eprintln!("run {} started for job {}", run.id, job.name);

    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event.payload {
            EventPayload::Log { stream, content } => println!("[{stream}] {content}"),
            EventPayload::Status { status } => {
                eprintln!("status: {status}");
                if status.is_terminal() {
                    outcome = Some(status);
                    break;
                }
            }
        }
    }
    runner.drain(config.scheduler.shutdown_grace()).await;

    if outcome != Some(RunStatus::Success) {
        process::exit(1);
    }
    Ok(())
}

async fn set_enabled(store: &Arc<dyn Store>, key: &str, enabled: bool) -> anyhow::Result<()> {
    let mut job = find_job(store, key).await?;
    job.enabled = enabled;
    store.save_job(job).await?;
    Ok(())
}

async fn remove_job(store: &Arc<dyn Store>, key: &str) -> anyhow::Result<()> {
    let job = find_job(store, key).await?;
    if !store.delete_job(job.id).await? {
        bail!("Job not found: {key}");
    }
    Ok(())
}
