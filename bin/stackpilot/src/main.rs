//! stackpilot deploys game backend stacks through reviewed change sets.

mod aws;
mod cli;
mod commands;
mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use aws::{AwsCli, AwsCliStackClient};
use cli::{Cli, Command};
use config::CliConfig;
use stackpilot_deploy::{DeploymentSettings, FileStore, KeyValueStore, ScenarioCatalog};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config = CliConfig::load(cli.config.as_deref())?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&config.state_file));

    tracing::debug!(
        state_file = %config.state_file.display(),
        scenarios_dir = %config.scenarios_dir.display(),
        "Loaded configuration"
    );

    let aws = AwsCli::new(&config.aws_program);
    let settings = || {
        DeploymentSettings::new(
            Arc::new(AwsCliStackClient::new(aws.clone())),
            store.clone(),
            ScenarioCatalog::new(&config.scenarios_dir),
            config.timings.clone(),
        )
    };

    match cli.command {
        Command::Configure {
            profile,
            region,
            bucket,
        } => commands::configure(store.as_ref(), &profile, &region, &bucket),
        Command::Scenarios => commands::scenarios(&ScenarioCatalog::new(&config.scenarios_dir)),
        Command::Deploy(args) => {
            let development = args.development;
            commands::deploy(&settings().development_build(development), store.as_ref(), args).await
        }
        Command::Wait => commands::wait(&settings(), store.as_ref()).await,
        Command::Status => commands::status(&settings(), store.clone()).await,
        Command::Delete { game, yes } => commands::delete(&settings(), game, yes).await,
        Command::Containers(args) => commands::containers(&config, aws.clone(), store.clone(), args).await,
    }
}
