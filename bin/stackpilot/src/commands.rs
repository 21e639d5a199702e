//! Subcommand implementations.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use stackpilot_deploy::pipeline::{FleetSpec, GroupDefinitionSpec};
use stackpilot_deploy::request::is_valid_region;
use stackpilot_deploy::store::keys;
use stackpilot_deploy::{
    ChangeSetDiff, ContainerContext, ContainerPipelineConfig, DeployError, DeploymentEvent,
    DeploymentIdSlot, DeploymentResponse, DeploymentSettings, KeyValueStore, ScenarioCatalog,
    ShellProcessRunner, StatusLevel, StepEvent, container_pipeline,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::aws::{AwsCli, AwsCliFleetClient, AwsCliStackClient};
use crate::cli::{ContainersArgs, DeployArgs};
use crate::config::CliConfig;

type Settings = DeploymentSettings<AwsCliStackClient>;

pub fn configure(store: &dyn KeyValueStore, profile: &str, region: &str, bucket: &str) -> Result<()> {
    ensure!(!profile.trim().is_empty(), "Profile must not be empty");
    ensure!(is_valid_region(region), "Unknown region '{region}'");
    ensure!(!bucket.trim().is_empty(), "Bucket must not be empty");

    store.put(keys::CURRENT_PROFILE, profile)?;
    store.put(keys::CURRENT_REGION, region)?;
    store.put(keys::CURRENT_BUCKET, bucket)?;

    tracing::info!(profile, region, bucket, "Configuration saved");
    Ok(())
}

pub fn scenarios(catalog: &ScenarioCatalog) -> Result<()> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Scenario", "Name", "Game server", "Installed", "Description"]);

    for scenario in catalog.scenarios() {
        let installed = catalog.path_of(scenario).is_dir();
        table.add_row(vec![
            scenario.to_string(),
            scenario.display_name().to_string(),
            yes_no(scenario.has_game_server()).to_string(),
            yes_no(installed).to_string(),
            scenario.description().to_string(),
        ]);
    }

    println!("{table}");
    println!("Scenarios are read from {}", catalog.root().display());
    Ok(())
}

pub async fn deploy(settings: &Settings, store: &dyn KeyValueStore, args: DeployArgs) -> Result<()> {
    settings.restore().context("Failed to restore saved settings")?;
    settings.edit_form(|form| {
        if let Some(scenario) = args.scenario {
            form.scenario = Some(scenario);
        }
        if let Some(game) = &args.game {
            form.game_name = game.clone();
        }
        override_with(&mut form.build_folder, &args.build_folder);
        override_with(&mut form.build_file, &args.build_file);
        override_with(&mut form.build_operating_system, &args.build_os);
        override_with(&mut form.fleet_name, &args.fleet_name);
        override_with(&mut form.build_name, &args.build_name);
        override_with(&mut form.launch_parameters, &args.launch_parameters);
    });
    settings.save().context("Failed to save settings")?;
    settings.refresh().await?;

    ensure!(settings.is_bootstrapped(), "Not configured, run `stackpilot configure` first");
    ensure!(
        settings.is_form_filled(),
        "A scenario and a game name are required; server scenarios also need an existing \
         --build-folder and --build-file"
    );
    ensure!(
        settings.is_current_stack_modifiable(),
        "The stack is busy ({}), wait until it settles",
        settings.current_stack_info().status
    );

    let events = report_events(settings.subscribe());
    let response = if args.yes {
        interruptible(settings, settings.start_deployment(auto_accept)).await
    } else {
        interruptible(settings, settings.start_deployment(ask_confirmation)).await
    };
    events.abort();

    let response = response.context("Deployment did not start, see the errors above")?;
    report(response, store)
}

pub async fn wait(settings: &Settings, store: &dyn KeyValueStore) -> Result<()> {
    settings.restore().context("Failed to restore saved settings")?;
    settings.refresh().await?;

    let events = report_events(settings.subscribe());
    let response = interruptible(settings, settings.wait_for_current_deployment()).await;
    events.abort();

    match response {
        Some(response) => report(response, store),
        None => {
            println!("No deployment to resume");
            Ok(())
        }
    }
}

pub async fn status(settings: &Settings, store: Arc<dyn KeyValueStore>) -> Result<()> {
    settings.restore().context("Failed to restore saved settings")?;
    settings.refresh().await?;

    let bootstrap = settings.bootstrap();
    let form = settings.form();
    let info = settings.current_stack_info();
    let resumable = DeploymentIdSlot::new(store).get()?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    let rows = [
        ("Profile", bootstrap.profile.unwrap_or_default()),
        ("Region", bootstrap.region.unwrap_or_default()),
        ("Bucket", bootstrap.bucket.unwrap_or_default()),
        (
            "Scenario",
            form.scenario
                .map(|scenario| scenario.display_name().to_string())
                .unwrap_or_default(),
        ),
        ("Game", form.game_name.clone()),
        ("Stack", info.status.clone()),
        ("Details", info.details.clone().unwrap_or_default()),
        (
            "API endpoint",
            info.api_gateway_endpoint().unwrap_or_default().to_string(),
        ),
        (
            "User pool client",
            info.user_pool_client_id().unwrap_or_default().to_string(),
        ),
        (
            "Unfinished deployment",
            resumable.map(|id| id.to_string()).unwrap_or_default(),
        ),
    ];
    for (name, value) in rows {
        table.add_row(vec![name.to_string(), value]);
    }

    println!("{table}");
    Ok(())
}

pub async fn delete(settings: &Settings, game: Option<String>, yes: bool) -> Result<()> {
    settings.restore().context("Failed to restore saved settings")?;
    if let Some(game) = game {
        settings.edit_form(|form| form.game_name = game);
    }
    settings.refresh().await?;

    let game = settings.form().game_name;
    ensure!(settings.has_current_stack(), "Nothing is deployed for '{game}'");
    if !yes && !confirm(&format!("Delete the stack of '{game}'?")).await {
        println!("Deletion cancelled");
        return Ok(());
    }

    let events = report_events(settings.subscribe());
    let response = interruptible(settings, settings.delete_deployment()).await;
    events.abort();

    match response?.context("Another deployment is running")? {
        Ok(_) => {
            println!("Stack of '{game}' deleted");
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            println!("Stopped watching the deletion, run `stackpilot wait` to resume");
            Ok(())
        }
        Err(err) => Err(err).context("Deletion failed"),
    }
}

pub async fn containers(
    config: &CliConfig,
    aws: AwsCli,
    store: Arc<dyn KeyValueStore>,
    args: ContainersArgs,
) -> Result<()> {
    let profile = store
        .get(keys::CURRENT_PROFILE)?
        .context("Not configured, run `stackpilot configure` first")?;
    let region = store
        .get(keys::CURRENT_REGION)?
        .context("Not configured, run `stackpilot configure` first")?;
    let fleet_role_arn = config
        .fleet_role_arn
        .clone()
        .context("Set fleet_role_arn in Stackpilot.toml or STACKPILOT_FLEET_ROLE_ARN")?;

    let repository_name = args
        .repository_uri
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .context("Repository URI must look like registry/repository")?
        .to_string();

    // An existing image only needs tagging and pushing.
    let image_id = match &args.image_id {
        Some(image_id) => {
            store.put(keys::CONTAINER_IMAGE_BUILT, "true")?;
            image_id.clone()
        }
        None => format!("{repository_name}:{}", args.tag),
    };

    let context = ContainerContext {
        profile,
        region,
        repository_name,
        repository_uri: args.repository_uri.clone(),
        image_id: Some(image_id),
        image_tag: args.tag.clone(),
    };
    let pipeline = ContainerPipelineConfig {
        output_dir: config.logs_dir.clone(),
        build_template: config.containers.build.clone(),
        push_template: config.containers.push.clone(),
        group_definition: GroupDefinitionSpec {
            name: args.group_name.clone(),
            image_uri: context.image_uri(),
            total_memory_limit_mib: args.memory_mib,
            total_vcpu_limit: args.vcpu,
            from_port: args.from_port,
            to_port: args.to_port,
        },
        fleet: FleetSpec {
            description: format!("{} container fleet", args.group_name),
            instance_type: args.instance_type.clone(),
        },
    };

    let mut chain = container_pipeline(
        Arc::new(ShellProcessRunner::default()),
        Arc::new(AwsCliFleetClient::new(aws, fleet_role_arn)),
        store.clone(),
        &context,
        pipeline,
        config.timings.clone(),
    );
    if args.restart {
        chain.reset(0)?;
        if args.image_id.is_some() {
            store.put(keys::CONTAINER_IMAGE_BUILT, "true")?;
        }
    }

    let events = report_steps(chain.subscribe());
    chain.start().await?;
    events.abort();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Step", "State"]);
    for (index, state) in chain.states().into_iter().enumerate() {
        table.add_row(vec![
            chain.name(index).unwrap_or_default().to_string(),
            state.to_string(),
        ]);
    }
    println!("{table}");

    if let Some(index) = chain.setup() {
        bail!(
            "'{}' did not complete; fix the problem and run the command again to resume",
            chain.name(index).unwrap_or_default()
        );
    }
    if let Some(fleet_id) = store.get(keys::CONTAINER_FLEET_ID)? {
        println!("Container fleet {fleet_id} is active");
    }
    Ok(())
}

/// Drive `operation`, turning Ctrl+C into a cancellation request.
///
/// The first Ctrl+C rolls back a cancellable deployment; otherwise it stops
/// watching and leaves the deployment resumable.
async fn interruptible<T>(settings: &Settings, operation: impl Future<Output = T>) -> T {
    tokio::pin!(operation);
    loop {
        tokio::select! {
            output = &mut operation => return output,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::warn!(error = %err, "Cannot listen for Ctrl+C");
                    return operation.await;
                }
                interrupt(settings).await;
            }
        }
    }
}

async fn interrupt(settings: &Settings) {
    if settings.can_cancel() {
        match settings.cancel_deployment().await {
            Ok(()) => tracing::info!("Rollback requested, waiting for the stack to settle"),
            Err(err) => tracing::warn!(error = %err, "Failed to cancel the deployment"),
        }
        return;
    }

    match settings.cancel_waiting_for_deployment() {
        Ok(()) => tracing::info!("Stopped waiting for the deployment"),
        Err(_) => tracing::warn!("Nothing to interrupt yet"),
    }
}

fn report(response: DeploymentResponse, store: &dyn KeyValueStore) -> Result<()> {
    match response {
        Ok(id) => {
            println!("Deployment of {id} finished");
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            if store.get(keys::CURRENT_DEPLOYMENT)?.is_some() {
                println!("Stopped watching, run `stackpilot wait` to resume");
            } else {
                println!("Deployment cancelled and rolled back");
            }
            Ok(())
        }
        // A resumed `delete` ends on the deleted stack.
        Err(DeployError::StackStatusInvalid { stack, status }) if status == "DELETE_COMPLETE" => {
            println!("Stack {stack} deleted");
            Ok(())
        }
        Err(err) => Err(err).context("Deployment failed"),
    }
}

async fn auto_accept(diff: ChangeSetDiff, stack_exists: bool) -> bool {
    tracing::info!(changes = diff.changes.len(), stack_exists, "Applying change set");
    true
}

async fn ask_confirmation(diff: ChangeSetDiff, stack_exists: bool) -> bool {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Action", "Resource", "Type", "Replacement"]);
    for change in &diff.changes {
        table.add_row(vec![
            change.action.as_str(),
            change.logical_id.as_str(),
            change.resource_type.as_str(),
            change.replacement.as_deref().unwrap_or("-"),
        ]);
    }

    let verb = if stack_exists { "Update" } else { "Create" };
    println!("{table}");
    confirm(&format!("{verb} the stack in {} with these changes?", diff.region)).await
}

async fn confirm(question: &str) -> bool {
    print!("{question} [y/N] ");
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    match stdin.read_line(&mut answer).await {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to read the answer");
            false
        }
    }
}

fn report_events(mut events: broadcast::Receiver<DeploymentEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeploymentEvent::StackInfoChanged(info)) => {
                    tracing::info!(status = %info.status, details = info.details.as_deref().unwrap_or("-"), "Stack")
                }
                Ok(DeploymentEvent::Status {
                    level: StatusLevel::Error,
                    message,
                }) => tracing::error!("{message}"),
                Ok(DeploymentEvent::Status {
                    level: StatusLevel::Info,
                    message,
                }) => tracing::info!("{message}"),
                Ok(DeploymentEvent::RunningChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Missed events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn report_steps(mut events: broadcast::Receiver<StepEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StepEvent::StateChanged { name, state, .. }) => {
                    tracing::info!(step = %name, %state, "Step")
                }
                Ok(StepEvent::Message {
                    severity, message, ..
                }) => tracing::warn!(%severity, "{message}"),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Missed events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn override_with<T: Clone>(field: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        field.clone_from(value);
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
