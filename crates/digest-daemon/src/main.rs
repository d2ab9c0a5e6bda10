use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use digest_core::DigestConfig;
use digest_scheduler::{
    ExecutionEvent, NewSchedule, ScheduleStatus, Scheduler, SqliteScheduleStore,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod cli;
mod summarizer;

use cli::{Cli, Command};
use summarizer::HttpSummarizer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "digest_daemon=info,digest_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > DIGEST_CONFIG env > ~/.digest/digest.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("DIGEST_CONFIG").ok());
    let config = DigestConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        DigestConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    let store = Arc::new(SqliteScheduleStore::new(conn)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let summarizer = Arc::new(HttpSummarizer::new(&config.summarizer)?);
            let (events_tx, events_rx) = mpsc::channel::<ExecutionEvent>(256);
            let scheduler = Arc::new(
                Scheduler::new(store, summarizer, &config.scheduler).with_events(events_tx),
            );
            tokio::spawn(report_events(events_rx));

            scheduler.start();
            info!(summarizer = %config.summarizer.base_url, "digest daemon running");
            shutdown_signal().await;
            scheduler.stop().await;
            info!("digest daemon stopped");
        }
        Command::Add {
            user,
            name,
            description,
            run_at,
            timezone,
            targets,
            max_retries,
            options,
        } => {
            let schedule = store.create(
                NewSchedule {
                    user_id: user,
                    name,
                    description,
                    run_at,
                    timezone,
                    targets,
                    options: options.unwrap_or(serde_json::Value::Null),
                    max_retries,
                },
                Utc::now(),
            )?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        Command::List { user } => {
            let schedules = match user {
                Some(user) => store.list_for_user(&user)?,
                None => store.list_all()?,
            };
            println!("{}", serde_json::to_string_pretty(&schedules)?);
        }
        Command::Pause { id } => {
            let schedule = store.set_status(&id, ScheduleStatus::Paused, Utc::now())?;
            println!("{} paused", schedule.id);
        }
        Command::Resume { id } => {
            let schedule = store.set_status(&id, ScheduleStatus::Active, Utc::now())?;
            println!(
                "{} resumed; next run at {}",
                schedule.id, schedule.next_execution_at
            );
        }
        Command::Remove { id } => {
            store.delete(&id)?;
            println!("{id} removed");
        }
        Command::Trigger { id } => {
            let summarizer = Arc::new(HttpSummarizer::new(&config.summarizer)?);
            let scheduler = Scheduler::new(store, summarizer, &config.scheduler);
            let record = scheduler
                .execute_schedule_by_id(&id)
                .await
                .with_context(|| format!("manual run of {id} failed"))?;
            match record {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => bail!("schedule not found: {id}"),
            }
        }
    }

    Ok(())
}

/// Log completed runs; a paused schedule needs a human to resume it.
async fn report_events(mut rx: mpsc::Receiver<ExecutionEvent>) {
    while let Some(event) = rx.recv().await {
        if let Some(reason) = event.pause_reason {
            warn!(
                schedule_id = %event.schedule_id,
                name = %event.schedule_name,
                ?reason,
                error = event.record.error.as_deref().unwrap_or(""),
                "schedule paused; resume it once the cause is fixed"
            );
        } else {
            info!(
                schedule_id = %event.schedule_id,
                name = %event.schedule_name,
                status = %event.record.status,
                next = %event.next_execution_at,
                "digest run finished"
            );
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), "cannot create database directory: {e}");
            }
        }
    }
}
