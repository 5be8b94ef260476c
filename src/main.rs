//! # Pushclock — Scheduled Notification Engine
//!
//! Usage:
//!   pushclock serve                          # Run the scheduler until Ctrl-C
//!   pushclock add task.json                  # Submit a task (JSON)
//!   pushclock pause 12 | resume 12 | cancel 12
//!   pushclock jobs                           # List registered jobs
//!   pushclock history 12 --limit 20          # Firing log of a task
//!   pushclock next "0 9 * * 1-5" -n 5        # Preview cron fire times
//!   pushclock test bark '{"device_key":"…"}' # Send a test message

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pushclock_channels::ChannelDispatcher;
use pushclock_core::PushclockConfig;
use pushclock_core::traits::Notifier;
use pushclock_core::types::{ChannelConfig, Task};
use pushclock_scheduler::{SchedulerDb, SchedulerEngine, cron};

#[derive(Parser)]
#[command(name = "pushclock", version, about = "⏰ Pushclock — scheduled multi-channel notifications")]
struct Cli {
    /// Config file (default: ~/.pushclock/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Serve,
    /// Submit a task from a JSON file
    Add { file: String },
    /// Cancel a task
    Cancel { id: i64 },
    /// Pause a pending task
    Pause { id: i64 },
    /// Resume a paused task
    Resume { id: i64 },
    /// Re-arm a sent, failed or cancelled task
    Rearm { id: i64 },
    /// Delete a task (its history is kept)
    Delete { id: i64 },
    /// List registered jobs
    Jobs,
    /// Show the firing history of a task
    History {
        id: i64,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Preview the next fire times of a cron expression
    Next {
        expression: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Send a test message through one channel
    Test {
        channel: String,
        /// Channel config as a JSON object
        channel_config: String,
        #[arg(long, default_value = "Pushclock test")]
        title: String,
        #[arg(long, default_value = "测试消息 {{datetime}}")]
        body: String,
    },
    /// Write the default config file
    Init,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&str>) -> Result<PushclockConfig> {
    let config = match path {
        Some(p) => PushclockConfig::load_from(Path::new(&expand_path(p)))?,
        None => PushclockConfig::load()?,
    };
    Ok(config)
}

fn init_logging(cli: &Cli, config: &PushclockConfig) {
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    let filter = format!("pushclock={level},pushclock_scheduler={level},pushclock_channels={level},pushclock_hooks={level}");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn open_db(config: &PushclockConfig) -> Result<Arc<SchedulerDb>> {
    let db_path = expand_path(&config.database_path);
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SchedulerDb::open(Path::new(&db_path)).with_context(|| format!("opening {db_path}"))?;
    Ok(Arc::new(db))
}

fn build_engine(config: &PushclockConfig) -> Result<SchedulerEngine> {
    let db = open_db(config)?;
    let dispatcher: Arc<dyn Notifier> = Arc::new(ChannelDispatcher::new(&config.dispatch, config.time_zone()?)?);
    Ok(SchedulerEngine::from_config(db, dispatcher, config)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match cli.command {
        Command::Init => PushclockConfig::default(),
        _ => load_config(cli.config.as_deref())?,
    };
    init_logging(&cli, &config);

    match &cli.command {
        Command::Serve => {
            let engine = build_engine(&config)?;
            let summary = engine.load_pending_on_startup()?;
            println!(
                "⏰ Pushclock worker {} — {} jobs restored, {} expired",
                engine.worker_id(),
                summary.registered,
                summary.dropped
            );
            engine.start();
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Interrupt received, shutting down");
            engine.shutdown().await;
        }
        Command::Add { file } => {
            let engine = build_engine(&config)?;
            let raw = std::fs::read_to_string(expand_path(file)).with_context(|| format!("reading {file}"))?;
            let task: Task = serde_json::from_str(&raw).with_context(|| format!("parsing task from {file}"))?;
            let task = engine.submit_task(task)?;
            println!("✅ Task {} scheduled for {}", task.id, task.scheduled_time);
        }
        Command::Cancel { id } => {
            let task = build_engine(&config)?.cancel_task(*id)?;
            println!("🚫 Task {} is {}", task.id, task.status);
        }
        Command::Pause { id } => {
            let task = build_engine(&config)?.pause_task(*id)?;
            println!("⏸️ Task {} is {}", task.id, task.status);
        }
        Command::Resume { id } => {
            let task = build_engine(&config)?.resume_task(*id)?;
            println!("▶️ Task {} resumes at {}", task.id, task.scheduled_time);
        }
        Command::Rearm { id } => {
            let task = build_engine(&config)?.rearm_task(*id)?;
            println!("🔁 Task {} re-armed for {}", task.id, task.scheduled_time);
        }
        Command::Delete { id } => {
            if build_engine(&config)?.delete_task(*id)? {
                println!("🗑️ Task {id} deleted");
            } else {
                println!("⚠️ Task {id} not found");
            }
        }
        Command::Jobs => {
            let jobs = build_engine(&config)?.scheduled_jobs()?;
            if jobs.is_empty() {
                println!("No jobs registered.");
            }
            for job in jobs {
                println!(
                    "{:<24} {:<5} {:<28} next {}",
                    job.id,
                    job.trigger.kind(),
                    job.trigger.data(),
                    job.next_run_time
                );
            }
        }
        Command::History { id, limit } => {
            let engine = build_engine(&config)?;
            let history = engine.execution_history(*id, *limit)?;
            print_json(&history)?;
        }
        Command::Next { expression, count } => {
            let tz = config.time_zone()?;
            let mut at = chrono::Utc::now();
            for _ in 0..*count {
                at = cron::next_fire_in(expression, at, tz)?;
                println!("{}", at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z"));
            }
        }
        Command::Test {
            channel,
            channel_config,
            title,
            body,
        } => {
            let channel_config: ChannelConfig =
                serde_json::from_str(channel_config).context("channel config must be a JSON object")?;
            let dispatcher = ChannelDispatcher::new(&config.dispatch, config.time_zone()?)?;
            dispatcher.send(channel, &channel_config, title, body).await?;
            println!("✅ Test message sent via {channel}");
        }
        Command::Init => {
            let path = match &cli.config {
                Some(p) => expand_path(p).into(),
                None => PushclockConfig::default_path(),
            };
            if path.exists() {
                println!("⚠️ {} already exists", path.display());
            } else {
                PushclockConfig::default().save_to(&path)?;
                println!("✅ Wrote {}", path.display());
            }
        }
    }
    Ok(())
}
