//! callosum - operator CLI for the action gate.
//!
//! Inspects a gate's coordination state: active advisory locks, recent
//! context activity, and the audit journal. Works against a state
//! directory directly or against a running daemon, and carries a small
//! demo that plays the classic two-session coordination failures.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use callosum_core::remote::GateClient;
use callosum_core::{
    CoordinationStore, Gate, GateConfig, JournalEntry, StoreSnapshot, Verdict,
};

/// Default request timeout against a daemon.
const CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// callosum - coordination sidecar for multi-session agents
#[derive(Parser, Debug)]
#[command(name = "callosum")]
#[command(version, about, long_about = None)]
struct Cli {
    /// State directory to inspect
    #[arg(long, global = true, default_value = ".callosum")]
    state_dir: PathBuf,

    /// Daemon base URL; when set, queries go over HTTP instead of the
    /// state directory
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show active locks and recent context activity
    Status {
        /// Restrict the snapshot to one context key
        #[arg(long)]
        context_key: Option<String>,
    },

    /// Show the tail of the audit journal
    Journal {
        /// Number of entries to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Play the two-session coordination scenarios in a throwaway
    /// state directory
    Demo,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Status { context_key } => status(&cli.state_dir, cli.server.as_deref(), context_key.as_deref()),
        Commands::Journal { limit } => journal(&cli.state_dir, cli.server.as_deref(), limit),
        Commands::Demo => demo(),
    }
}

fn open_store(state_dir: &PathBuf) -> Result<CoordinationStore> {
    let defaults = GateConfig::new("cli");
    CoordinationStore::open(state_dir, defaults.lock_expiry(), defaults.context_window())
        .with_context(|| format!("opening state directory {}", state_dir.display()))
}

fn status(state_dir: &PathBuf, server: Option<&str>, context_key: Option<&str>) -> Result<()> {
    let snapshot = match server {
        Some(url) => {
            let client = GateClient::new(url, CLIENT_TIMEOUT)?;
            client.status(context_key)?.snapshot
        },
        None => open_store(state_dir)?.snapshot(context_key)?,
    };
    print_snapshot(&snapshot);
    Ok(())
}

fn journal(state_dir: &PathBuf, server: Option<&str>, limit: usize) -> Result<()> {
    let entries = match server {
        Some(url) => {
            let client = GateClient::new(url, CLIENT_TIMEOUT)?;
            client.journal(Some(limit))?.entries
        },
        None => open_store(state_dir)?.journal_tail(limit)?,
    };
    if entries.is_empty() {
        println!("journal is empty");
        return Ok(());
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

fn print_snapshot(snapshot: &StoreSnapshot) {
    if snapshot.locks.is_empty() {
        println!("no active locks");
    } else {
        println!("active locks:");
        for lock in &snapshot.locks {
            println!(
                "  {:<32} held by {:<12} tier {}  expires {}",
                lock.context_key,
                lock.instance,
                lock.tier,
                lock.expires_at.format("%H:%M:%S"),
            );
        }
    }

    if snapshot.recent_contexts.is_empty() {
        println!("no recent context activity");
    } else {
        println!("recent contexts:");
        for record in &snapshot.recent_contexts {
            println!(
                "  {:<32} {:<12} tier {}  {}  via {}",
                record.context_key,
                record.instance,
                record.tier,
                record.timestamp.format("%H:%M:%S"),
                record.tool,
            );
        }
    }
}

fn print_entry(entry: &JournalEntry) {
    println!(
        "{}  {:<9} [{}] {:<10} tier {}  {}{}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.action.as_str(),
        entry.instance,
        entry.tool,
        entry.tier,
        entry.context_key.as_deref().unwrap_or("-"),
        entry
            .conflict_note
            .as_deref()
            .map(|note| format!("  ({note})"))
            .unwrap_or_default(),
    );
}

/// Plays the duplicate-email and irreversible-race scenarios with two
/// in-process sessions sharing one throwaway state directory.
fn demo() -> Result<()> {
    let dir = tempfile::TempDir::new().context("creating demo state directory")?;

    let gate_for = |instance: &str| -> Result<Gate> {
        let mut config = GateConfig::new(instance);
        config.state_dir = dir.path().to_path_buf();
        Ok(Gate::new(config)?)
    };
    let alpha = gate_for("alpha")?;
    let beta = gate_for("beta")?;

    println!("== duplicate email ==");
    let email: callosum_core::Params = serde_json::from_str(
        r#"{"command": "curl --url 'smtp://mail' --mail-rcpt 'alice@example.com' -T body"}"#,
    )?;
    describe("alpha sends email", &alpha.intercept("alpha", "exec", &email));
    alpha.complete("alpha", "exec", &email, None);
    describe("alpha repeats it", &alpha.intercept("alpha", "exec", &email));

    println!();
    println!("== irreversible race ==");
    let delete: callosum_core::Params =
        serde_json::from_str(r#"{"action": "channel-delete"}"#)?;
    describe("alpha deletes channel", &alpha.intercept("alpha", "message", &delete));
    describe("beta races the delete", &beta.intercept("beta", "message", &delete));
    alpha.complete("alpha", "message", &delete, None);

    println!();
    println!("== journal ==");
    for entry in alpha.store().journal_tail(20)? {
        print_entry(&entry);
    }
    Ok(())
}

fn describe(label: &str, verdict: &Verdict) {
    match verdict {
        Verdict::Allow { tier, context_key, rule_name, warning } => {
            println!(
                "{label}: allowed (tier {tier}, rule {rule_name}, key {}){}",
                context_key.as_deref().unwrap_or("-"),
                warning
                    .as_deref()
                    .map(|w| format!(" -- warning: {w}"))
                    .unwrap_or_default(),
            );
        },
        Verdict::Pause { reason } => println!("{label}: paused -- {reason}"),
        Verdict::Block { reason } => println!("{label}: blocked -- {reason}"),
    }
}
