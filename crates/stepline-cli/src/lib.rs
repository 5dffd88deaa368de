// Stepline CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Applications embed `Cli` and hand `run` their own activity group.
// Design Decision: One activity runs on a Worker, several on a WorkersManager.

pub mod demo;
pub mod output;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use stepline::activity::{Activity, ActivityRegistration};
use stepline::config::{Session, WorkerConfig};
use stepline::worker::{Worker, WorkersManager};
use tracing::info;

use crate::output::{print_table_row, OutputFormat};

/// Prefix of the demo activity group
pub const DEFAULT_PREFIX: &str = "stepline";

#[derive(Debug, Parser)]
#[command(name = "stepline")]
#[command(about = "Stepline - Serve AWS Step Functions activities")]
#[command(version)]
pub struct Cli {
    /// More log output (repeatable)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Less log output (repeatable)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Activity name prefix of the group
    #[arg(long, env = "STEPLINE_PREFIX", global = true)]
    pub prefix: Option<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Net verbosity: `-v` count minus `-q` count
    pub fn verbosity(&self) -> i8 {
        let verbose = i8::try_from(self.verbose).unwrap_or(i8::MAX);
        let quiet = i8::try_from(self.quiet).unwrap_or(i8::MAX);
        verbose.saturating_sub(quiet)
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the group's activities on the service
    Register,

    /// Delete the group's activities from the service
    Deregister,

    /// List remote activities carrying the group prefix
    Activities,

    /// Poll for and execute tasks of the named activities
    Worker {
        /// Activity names, with or without the group prefix (all when omitted)
        names: Vec<String>,

        /// Worker name reported to the service
        #[arg(long, env = "STEPLINE_WORKER_NAME")]
        worker_name: Option<String>,
    },
}

/// Run a parsed command against the environment's AWS session
pub async fn run(cli: Cli, activities: ActivityRegistration) -> Result<()> {
    let session = Session::from_env().context("Failed to configure AWS session")?;
    run_with_session(cli, activities, session).await
}

/// Run a parsed command against an explicit session
pub async fn run_with_session(
    cli: Cli,
    activities: ActivityRegistration,
    session: Session,
) -> Result<()> {
    let prefix = cli
        .prefix
        .clone()
        .unwrap_or_else(|| activities.prefix().to_string());

    match cli.command {
        Commands::Register => {
            let created = activities
                .register(&session)
                .await
                .context("Failed to register activities")?;
            if cli.output.is_text() {
                for activity in &created {
                    println!("Registered {}", activity.activity_arn);
                }
            } else {
                cli.output.print_value(&created)?;
            }
        }
        Commands::Deregister => {
            let deleted = activities
                .deregister(&session)
                .await
                .context("Failed to deregister activities")?;
            if cli.output.is_text() {
                for arn in &deleted {
                    println!("Deregistered {}", arn);
                }
            } else {
                cli.output.print_value(&deleted)?;
            }
        }
        Commands::Activities => {
            let remote = session
                .service()
                .list_activities()
                .await
                .context("Failed to list activities")?;
            let ours: Vec<_> = remote
                .into_iter()
                .filter(|a| a.name.starts_with(&prefix))
                .collect();

            if cli.output.is_text() {
                if ours.is_empty() {
                    println!("No activities found");
                    return Ok(());
                }
                print_table_row(&[("NAME", 30), ("CREATED", 20), ("ARN", 80)]);
                for activity in &ours {
                    let created = activity.creation_date.format("%Y-%m-%d %H:%M:%S").to_string();
                    print_table_row(&[
                        (&activity.name, 30),
                        (&created, 20),
                        (&activity.activity_arn, 80),
                    ]);
                }
            } else {
                cli.output.print_value(&ours)?;
            }
        }
        Commands::Worker { names, worker_name } => {
            let selected = select_activities(&activities, &names)?;
            let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

            if let [activity] = selected.as_slice() {
                let worker = Worker::with_config(activity.clone(), worker_name, session, config);
                info!(worker = %worker.name(), activity = %activity.name(), "Serving activity");
                worker.run().await.context("Worker failed")?;
            } else {
                let manager = WorkersManager::with_config(selected, worker_name, session, config);
                info!(worker = %manager.name(), count = manager.workers().len(), "Serving activities");
                manager.run().await.context("Workers failed")?;
            }
        }
    }

    Ok(())
}

/// Pick the named activities from the group, in the order given
pub fn select_activities(
    activities: &ActivityRegistration,
    names: &[String],
) -> Result<Vec<Activity>> {
    if names.is_empty() {
        if activities.is_empty() {
            bail!("No activities to serve");
        }
        return Ok(activities.activities().to_vec());
    }

    names
        .iter()
        .map(|name| {
            activities.find(name).cloned().with_context(|| {
                format!(
                    "Unknown activity '{}' (known: {})",
                    name,
                    activities.names().join(", ")
                )
            })
        })
        .collect()
}
