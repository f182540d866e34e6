use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use repowatch::cli::{audit, checkpoint, list, runs};
use repowatch::config::Config;
use repowatch::monitor::AuditRequest;
use repowatch::source::{RestClient, TimestampField};
use repowatch::store::TrackingStore;

#[derive(Parser)]
#[command(name = "repowatch")]
#[command(about = "Audits repository projects for new and changed entities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "repowatch.yaml")]
    config: String,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug detail
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check projects for new and updated entities
    Audit {
        /// Project ids to audit
        #[arg(short, long = "project", required = true, num_args = 1..)]
        projects: Vec<String>,

        /// Look back this many days instead of using stored checkpoints
        #[arg(short, long, value_parser = parse_days)]
        days: Option<f64>,

        /// Advance each project's checkpoint to the start of this run
        #[arg(long)]
        update_project: bool,

        /// Subject of the notification
        #[arg(long)]
        email_subject: Option<String>,

        /// Principal id to notify (defaults to the authenticated user)
        #[arg(long)]
        user_id: Option<String>,

        /// Write the Markdown activity digest to this file
        #[arg(long)]
        digest: Option<PathBuf>,

        /// Detect and report without writing the table, checkpoints or outbox
        #[arg(long)]
        dry_run: bool,

        /// Timestamp compared against the checkpoint
        #[arg(long, value_enum)]
        by: Option<ByField>,
    },

    /// List tracked entities
    List {
        /// Filter by project id
        #[arg(short, long)]
        project: Option<String>,

        /// Filter by status (new, updated, existing)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show or move project checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Show recent audit runs
    Runs {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Show the stored checkpoint of each project
    Show {
        /// Project ids
        #[arg(required = true)]
        projects: Vec<String>,
    },
    /// Set a project's checkpoint (defaults to now)
    Set {
        /// Project id
        project: String,
        /// Epoch millis
        #[arg(long, conflicts_with = "days")]
        at: Option<i64>,
        /// This many days before now
        #[arg(long, value_parser = parse_days)]
        days: Option<f64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ByField {
    Modified,
    Created,
}

impl From<ByField> for TimestampField {
    fn from(value: ByField) -> Self {
        match value {
            ByField::Modified => TimestampField::Modified,
            ByField::Created => TimestampField::Created,
        }
    }
}

fn parse_days(value: &str) -> Result<f64, String> {
    let days: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if !days.is_finite() || days < 0.0 {
        return Err(format!("expected a non-negative number of days, got {value}"));
    }
    Ok(days)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Audit {
            projects,
            days,
            update_project,
            email_subject,
            user_id,
            digest,
            dry_run,
            by,
        } => {
            let request = AuditRequest {
                projects,
                days,
                update_checkpoint: update_project,
                subject: email_subject,
                recipient: user_id,
                digest_path: digest,
                dry_run,
                timestamp_field: by.map(Into::into),
            };
            let client = Arc::new(RestClient::new(&config.source, config.auth_token())?);
            audit::run(config, client, request).await?;
        }
        Commands::List { project, status } => {
            let store = TrackingStore::open(&config.database_path())?;
            list::run(&store, project, status)?;
        }
        Commands::Checkpoint { command } => {
            let client = Arc::new(RestClient::new(&config.source, config.auth_token())?);
            let checkpoints = repowatch::cli::checkpoint_store(&config, client)?;
            match command {
                CheckpointCommands::Show { projects } => {
                    checkpoint::show(checkpoints.as_ref(), &projects).await?;
                }
                CheckpointCommands::Set { project, at, days } => {
                    checkpoint::set(checkpoints.as_ref(), &project, at, days).await?;
                }
            }
        }
        Commands::Runs { limit } => {
            let store = TrackingStore::open(&config.database_path())?;
            runs::run(&store, limit)?;
        }
    }

    Ok(())
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("REPOWATCH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn days_must_be_finite_and_non_negative() {
        assert_eq!(parse_days("1.5"), Ok(1.5));
        assert_eq!(parse_days("0"), Ok(0.0));
        assert!(parse_days("-1").is_err());
        assert!(parse_days("-1e300").is_err());
        assert!(parse_days("NaN").is_err());
        assert!(parse_days("inf").is_err());
        assert!(parse_days("week").is_err());
    }

    #[test]
    fn audit_rejects_negative_days_on_the_command_line() {
        let parsed = Cli::try_parse_from(["repowatch", "audit", "-p", "syn0", "--days=-3"]);
        assert!(parsed.is_err());
        let parsed = Cli::try_parse_from(["repowatch", "audit", "-p", "syn0", "--days", "7"]);
        assert!(parsed.is_ok());
    }
}
