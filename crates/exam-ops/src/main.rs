//! exam-ops
//!
//! Operational commands for the mock exam app.
//!
//! Usage:
//!   exam-ops migrate
//!   exam-ops verify-schema
//!   exam-ops urls
//!   exam-ops clear-cache --restart
//!   exam-ops install-hooks
//!   exam-ops pre-push origin git@host:repo.git < refs

mod cache;
mod hooks;
mod urls;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exam_db::{ColumnCheck, Database};
use exam_payments::config::parse_flag;

use crate::hooks::PushDecision;

#[derive(Parser, Debug)]
#[command(name = "exam-ops")]
#[command(about = "Operational commands for the mock exam app")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "DATABASE_PATH", default_value = "exam.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations and print the schema check
    Migrate,

    /// Print the schema check; fails if a column is missing
    VerifySchema,

    /// Print the local and hosted URLs
    Urls,

    /// Delete cache directories, optionally restarting the server
    ClearCache {
        /// Directories to delete
        #[arg(long = "dir", value_name = "DIR", default_value = cache::DEFAULT_CACHE_DIR)]
        dirs: Vec<PathBuf>,

        /// Stop the running server and start it again
        #[arg(long)]
        restart: bool,

        /// Port for the restarted server
        #[arg(long, default_value_t = cache::DEFAULT_PORT)]
        port: u16,
    },

    /// Install the pre-push hook into a git checkout
    InstallHooks {
        /// Repository root
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },

    /// Git pre-push hook entry point; reads pushed refs from stdin
    PrePush {
        /// Remote name (passed by git)
        remote: Option<String>,

        /// Remote URL (passed by git)
        url: Option<String>,

        /// Push even if an exam is in progress
        #[arg(long)]
        force: bool,

        /// Branch ref that redeploys the hosted app
        #[arg(long, default_value = hooks::PROTECTED_REF)]
        protected: String,

        /// Minutes since the last attempt activity that count as in progress
        #[arg(long, default_value_t = hooks::DEFAULT_WINDOW_MINUTES)]
        window_minutes: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let secrets_file = std::env::var("SECRETS_FILE").unwrap_or_else(|_| ".env".into());
    if let Err(e) = dotenvy::from_filename(&secrets_file) {
        if !e.not_found() {
            tracing::warn!(file = %secrets_file, error = %e, "Could not read secrets file");
        }
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let db = open(&cli.database)?;
            let report = db.migrate().context("running migrations")?;
            println!(
                "Schema version {} -> {} ({} migration(s) applied)",
                report.from_version,
                report.to_version,
                report.applied.len()
            );
            print_schema(&db.verify_schema()?);
        }

        Commands::VerifySchema => {
            if !cli.database.exists() {
                bail!("database {} does not exist", cli.database.display());
            }
            let checks = open(&cli.database)?.verify_schema()?;
            let missing = print_schema(&checks);
            if missing > 0 {
                bail!("{missing} expected column(s) missing");
            }
        }

        Commands::Urls => {
            print!("{}", urls::resolve(|key| std::env::var(key).ok()));
        }

        Commands::ClearCache { dirs, restart, port } => {
            if restart && cache::stop_server()? {
                println!("Stopped running {}", cache::SERVER_BINARY);
            }
            for cleared in cache::clear_dirs(&dirs)? {
                let state = if cleared.existed { "removed" } else { "absent" };
                println!("{state:>8}  {}", cleared.path.display());
            }
            if restart {
                let pid = cache::start_server(port)?;
                println!("Started {} (pid {pid}) on http://localhost:{port}", cache::SERVER_BINARY);
            }
        }

        Commands::InstallHooks { repo } => {
            let hook = hooks::install_hook(&repo)?;
            println!("Installed {}", hook.display());
        }

        Commands::PrePush {
            remote,
            url,
            force,
            protected,
            window_minutes,
        } => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("reading pushed refs")?;
            let refs = hooks::parse_pushed_refs(&input);
            tracing::debug!(remote = ?remote, url = ?url, refs = refs.len(), "pre-push");

            if !hooks::touches(&refs, &protected) {
                return Ok(());
            }

            let last_activity = if cli.database.exists() {
                let db = open(&cli.database)?;
                let conn = db.conn()?;
                exam_db::attempts::latest_activity(&conn)?
            } else {
                tracing::warn!(path = %cli.database.display(), "No database - cannot check for active exams");
                None
            };

            let override_push =
                force || std::env::var(hooks::OVERRIDE_ENV).is_ok_and(|v| parse_flag(&v));

            match hooks::decide(
                &refs,
                &protected,
                last_activity,
                Utc::now(),
                Duration::minutes(window_minutes),
                override_push,
            ) {
                PushDecision::Allow => {}
                PushDecision::Overridden { last_activity } => {
                    eprintln!(
                        "warning: exam activity at {last_activity}, pushing to {protected} anyway (override)"
                    );
                }
                PushDecision::Block { last_activity } => {
                    eprintln!("Push to {protected} blocked: exam activity at {last_activity}.");
                    eprintln!("Deploying now would interrupt exams in progress.");
                    eprintln!(
                        "Wait {window_minutes} minutes after the last activity, or override with --force or {}=1.",
                        hooks::OVERRIDE_ENV
                    );
                    bail!("push blocked");
                }
            }
        }
    }

    Ok(())
}

fn open(path: &Path) -> Result<Database> {
    Database::open(path).with_context(|| format!("opening {}", path.display()))
}

/// Print the verification table; returns the number of missing columns
fn print_schema(checks: &[ColumnCheck]) -> usize {
    println!(
        "{:<10} {:<20} {:<8} {:<10} {:<10} {}",
        "table", "column", "present", "type", "default", "not_null"
    );
    for check in checks {
        println!(
            "{:<10} {:<20} {:<8} {:<10} {:<10} {}",
            check.table,
            check.column,
            if check.present { "yes" } else { "MISSING" },
            check.declared_type.as_deref().unwrap_or("-"),
            check.default.as_deref().unwrap_or("-"),
            check.not_null,
        );
    }
    checks.iter().filter(|c| !c.present).count()
}
