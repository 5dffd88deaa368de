// Stepline demo binary: serves the Echo and Sleep activities

use clap::Parser;
use stepline::telemetry::{init_tracing, TelemetryConfig};
use stepline_cli::demo::demo_activities;
use stepline_cli::{run, Cli, DEFAULT_PREFIX};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(TelemetryConfig::from_env().with_verbosity(cli.verbosity()));

    let activities = demo_activities(cli.prefix.as_deref().unwrap_or(DEFAULT_PREFIX))?;
    run(cli, activities).await
}
