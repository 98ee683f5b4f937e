//! Standalone admin CLI: `stats`, `peek <queue> [n]`, `purge-dlq`, talking to a running
//! jobline-server's admin HTTP surface (§6 CLI surface), mirroring the teacher's `ferrexctl`
//! binary's command/exit-code conventions.

mod client;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::{AdminClient, ClientError};

/// Exit codes per §6: 0 success, 1 user error, 2 remote error.
const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_REMOTE_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "jobline-admin", about = "Admin CLI for a running jobline-server")]
struct Cli {
    /// Base URL of the jobline-server admin HTTP surface.
    #[arg(long, env = "JOBLINE_ADMIN_URL", default_value = "http://127.0.0.1:8080")]
    server_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show dead-letter counts for every queue.
    Stats,
    /// Show up to `n` (default 20) dead-lettered entries for `queue`.
    Peek {
        queue: String,
        #[arg(default_value_t = 20)]
        n: usize,
        /// Only show entries dead-lettered within this long (e.g. `15m`, `2h`).
        #[arg(long, value_parser = humantime::parse_duration)]
        since: Option<std::time::Duration>,
    },
    /// Purge a queue's dead-letter list, or every queue's with `--all`.
    PurgeDlq {
        queue: Option<String>,
        #[arg(long)]
        all: bool,
        /// Skip the interactive confirmation prompt.
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_target(false).init();

    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let client = AdminClient::new(cli.server_url);

    match cli.command {
        Command::Stats => run_stats(&client).await,
        Command::Peek { queue, n, since } => run_peek(&client, &queue, n, since).await,
        Command::PurgeDlq { queue, all, confirm } => match run_purge_dlq(&client, queue, all, confirm).await {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error: {err:#}");
                EXIT_USER_ERROR
            }
        },
    }
}

async fn run_stats(client: &AdminClient) -> i32 {
    match client.dlq_stats().await {
        Ok(stats) => {
            println!("{:<32} {:>10}", "QUEUE", "DLQ COUNT");
            for entry in stats {
                println!("{:<32} {:>10}", entry.queue, entry.count);
            }
            EXIT_OK
        }
        Err(err) => remote_error(err),
    }
}

async fn run_peek(client: &AdminClient, queue: &str, n: usize, since: Option<std::time::Duration>) -> i32 {
    match client.peek_dlq(queue, n).await {
        Ok(entries) => {
            let cutoff = since.map(|d| chrono::Utc::now() - chrono::Duration::from_std(d).unwrap_or_default());
            let entries: Vec<_> = entries
                .into_iter()
                .filter(|e| cutoff.is_none_or(|cutoff| e.dead_lettered_at >= cutoff))
                .collect();
            if entries.is_empty() {
                println!("no dead-lettered entries in {queue}");
            }
            for entry in entries {
                println!(
                    "{}  retries={}  priority={:?}  reason={}  dead_lettered_at={}",
                    entry.envelope.id, entry.envelope.retries, entry.envelope.priority, entry.reason, entry.dead_lettered_at
                );
            }
            EXIT_OK
        }
        Err(err) => remote_error(err),
    }
}

async fn run_purge_dlq(client: &AdminClient, queue: Option<String>, all: bool, confirm: bool) -> anyhow::Result<i32> {
    if all && queue.is_some() {
        eprintln!("error: pass either a queue name or --all, not both");
        return Ok(EXIT_USER_ERROR);
    }
    if !all && queue.is_none() {
        eprintln!("error: specify a queue name or --all");
        return Ok(EXIT_USER_ERROR);
    }

    let prompt = match &queue {
        Some(q) => format!("purge the dead-letter queue for '{q}'? this cannot be undone"),
        None => "purge every queue's dead-letter list? this cannot be undone".to_string(),
    };

    if !confirm {
        let proceed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("could not read confirmation prompt")?;
        if !proceed {
            println!("aborted");
            return Ok(EXIT_USER_ERROR);
        }
    }

    let result = match &queue {
        Some(q) => client.purge_dlq(q).await,
        None => client.purge_all_dlq().await,
    };

    match result {
        Ok(purged) => {
            println!("purged {purged} entries");
            Ok(EXIT_OK)
        }
        Err(err) => Ok(remote_error(err)),
    }
}

fn remote_error(err: ClientError) -> i32 {
    eprintln!("error: {err}");
    EXIT_REMOTE_ERROR
}
