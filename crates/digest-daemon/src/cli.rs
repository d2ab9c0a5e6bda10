use clap::{Parser, Subcommand};
use digest_scheduler::Target;

#[derive(Debug, Parser)]
#[command(name = "digest-daemon", version, about = "Daily digest scheduler")]
pub struct Cli {
    /// Path to digest.toml (falls back to DIGEST_CONFIG, then ~/.digest/digest.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the polling loop until Ctrl-C / SIGTERM (default).
    Run,
    /// Create a daily schedule.
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Local wall-clock time, HH:MM.
        #[arg(long)]
        run_at: String,
        /// IANA timezone, e.g. Asia/Jerusalem.
        #[arg(long)]
        timezone: String,
        /// Repeatable: `--target <id>=<name>`.
        #[arg(long = "target", value_parser = parse_target, required = true)]
        targets: Vec<Target>,
        /// Consecutive failures before auto-pause; 0 disables.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Opaque JSON forwarded to the summarizer.
        #[arg(long, value_parser = parse_json)]
        options: Option<serde_json::Value>,
    },
    /// List schedules, optionally for one user.
    List {
        #[arg(long)]
        user: Option<String>,
    },
    Pause { id: String },
    /// Reactivate a paused schedule; its next run is recomputed from now.
    Resume { id: String },
    Remove { id: String },
    /// Run one schedule immediately and print the execution record.
    Trigger { id: String },
}

fn parse_target(s: &str) -> Result<Target, String> {
    let (id, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<name>, got {s:?}"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("empty target id in {s:?}"));
    }
    let name = name.trim();
    Ok(Target::new(id, if name.is_empty() { id } else { name }))
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}
