//! Container group definition and container fleet steps.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::DeployTimings;
use crate::error::{DeployError, DeployResult};
use crate::poller::Poller;
use crate::remote::RemoteResult;
use crate::steps::{ProgressState, Step, StepOutcome};
use crate::store::{KeyValueStore, keys};

#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupDefinitionStatus {
    Copying,
    Ready,
    Failed,
    #[strum(default)]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FleetStatus {
    Pending,
    Creating,
    Created,
    Activating,
    Active,
    Updating,
    Deleting,
    Error,
    #[strum(default)]
    Other(String),
}

/// Account and region the container resources live in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FleetTarget {
    pub profile: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinitionSpec {
    pub name: String,
    pub image_uri: String,
    pub total_memory_limit_mib: u32,
    pub total_vcpu_limit: f64,
    pub from_port: u16,
    pub to_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub description: String,
    pub instance_type: Option<String>,
}

/// Remote container fleet service.
pub trait ContainerFleetClient: Send + Sync + 'static {
    /// Returns the name the definition was registered under.
    fn create_group_definition(
        &self,
        target: &FleetTarget,
        spec: &GroupDefinitionSpec,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    fn describe_group_definition(
        &self,
        target: &FleetTarget,
        name: &str,
    ) -> impl Future<Output = RemoteResult<GroupDefinitionStatus>> + Send;

    /// Returns the new fleet id.
    fn create_fleet(
        &self,
        target: &FleetTarget,
        spec: &FleetSpec,
        group_definition: &str,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    fn describe_fleet(
        &self,
        target: &FleetTarget,
        fleet_id: &str,
    ) -> impl Future<Output = RemoteResult<FleetStatus>> + Send;
}

/// Registers the container group definition and waits until it is ready.
pub struct GroupDefinitionStep<F> {
    client: Arc<F>,
    store: Arc<dyn KeyValueStore>,
    target: FleetTarget,
    spec: GroupDefinitionSpec,
    timings: DeployTimings,
}

impl<F: ContainerFleetClient> GroupDefinitionStep<F> {
    pub fn new(
        client: Arc<F>,
        store: Arc<dyn KeyValueStore>,
        target: FleetTarget,
        spec: GroupDefinitionSpec,
        timings: DeployTimings,
    ) -> Self {
        Self {
            client,
            store,
            target,
            spec,
            timings,
        }
    }

    async fn run(&self) -> DeployResult<String> {
        tracing::info!(definition = %self.spec.name, image = %self.spec.image_uri, "Creating container group definition");
        let name = self
            .client
            .create_group_definition(&self.target, &self.spec)
            .await?;

        let status = Poller::new(self.timings.stack_poll())
            .poll_within(
                self.timings.resource_timeout(),
                "container group definition",
                || self.client.describe_group_definition(&self.target, &name),
                |status| {
                    matches!(
                        status,
                        GroupDefinitionStatus::Ready | GroupDefinitionStatus::Failed
                    )
                },
            )
            .await?;

        if status != GroupDefinitionStatus::Ready {
            return Err(DeployError::OperationInvalid(format!(
                "container group definition {name} is {status}"
            )));
        }
        Ok(name)
    }
}

impl<F: ContainerFleetClient> Step for GroupDefinitionStep<F> {
    fn name(&self) -> &str {
        "Configure container group"
    }

    fn resume(&mut self) -> BoxFuture<'_, StepOutcome> {
        async move {
            if persisted(self.store.as_ref(), keys::CONTAINER_GROUP_DEFINITION).is_some() {
                return StepOutcome::Completed;
            }

            match self.run().await {
                // The fleet step reads the name back, so an unsaved name is a failure.
                Ok(name) => match self.store.put(keys::CONTAINER_GROUP_DEFINITION, &name) {
                    Ok(()) => StepOutcome::Completed,
                    Err(err) => {
                        tracing::error!(definition = %name, error = %err, "Failed to save container group definition");
                        StepOutcome::Failed(format!(
                            "group definition {name} is ready but could not be saved: {err}"
                        ))
                    }
                },
                Err(err) => {
                    tracing::error!(definition = %self.spec.name, error = %err, "Container group definition failed");
                    StepOutcome::Failed(err.to_string())
                }
            }
        }
        .boxed()
    }

    fn reset(&mut self) -> DeployResult<()> {
        self.store.clear(keys::CONTAINER_GROUP_DEFINITION)
    }

    fn restored_state(&self) -> ProgressState {
        restored(self.store.as_ref(), keys::CONTAINER_GROUP_DEFINITION)
    }
}

/// Creates the container fleet and waits until it is active.
pub struct FleetStep<F> {
    client: Arc<F>,
    store: Arc<dyn KeyValueStore>,
    target: FleetTarget,
    spec: FleetSpec,
    timings: DeployTimings,
}

impl<F: ContainerFleetClient> FleetStep<F> {
    pub fn new(
        client: Arc<F>,
        store: Arc<dyn KeyValueStore>,
        target: FleetTarget,
        spec: FleetSpec,
        timings: DeployTimings,
    ) -> Self {
        Self {
            client,
            store,
            target,
            spec,
            timings,
        }
    }

    async fn run(&self) -> DeployResult<String> {
        let definition = persisted(self.store.as_ref(), keys::CONTAINER_GROUP_DEFINITION)
            .ok_or_else(|| {
                DeployError::OperationInvalid("no container group definition is ready".to_string())
            })?;

        tracing::info!(%definition, "Creating container fleet");
        let fleet_id = self
            .client
            .create_fleet(&self.target, &self.spec, &definition)
            .await?;
        // Keep the id before waiting so a restart does not create a second fleet.
        self.store.put(keys::CONTAINER_FLEET_ID, &fleet_id)?;

        self.wait_until_active(&fleet_id).await?;
        Ok(fleet_id)
    }

    async fn wait_until_active(&self, fleet_id: &str) -> DeployResult<()> {
        let status = Poller::new(self.timings.stack_poll())
            .poll_within(
                self.timings.resource_timeout(),
                "container fleet",
                || self.client.describe_fleet(&self.target, fleet_id),
                |status| matches!(status, FleetStatus::Active | FleetStatus::Error),
            )
            .await?;

        if status != FleetStatus::Active {
            return Err(DeployError::OperationInvalid(format!(
                "container fleet {fleet_id} is {status}"
            )));
        }
        tracing::info!(fleet = fleet_id, "Container fleet is active");
        Ok(())
    }
}

impl<F: ContainerFleetClient> Step for FleetStep<F> {
    fn name(&self) -> &str {
        "Create container fleet"
    }

    fn resume(&mut self) -> BoxFuture<'_, StepOutcome> {
        async move {
            // A fleet created before a restart is only waited for.
            let result = match persisted(self.store.as_ref(), keys::CONTAINER_FLEET_ID) {
                Some(fleet_id) => self.wait_until_active(&fleet_id).await,
                None => self.run().await.map(|_| ()),
            };

            match result {
                Ok(()) => StepOutcome::Completed,
                Err(err) => {
                    tracing::error!(error = %err, "Container fleet failed");
                    StepOutcome::Failed(err.to_string())
                }
            }
        }
        .boxed()
    }

    fn reset(&mut self) -> DeployResult<()> {
        self.store.clear(keys::CONTAINER_FLEET_ID)
    }
}

fn persisted(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    store.get(key).ok().flatten().filter(|value| !value.is_empty())
}

fn restored(store: &dyn KeyValueStore, key: &str) -> ProgressState {
    match persisted(store, key) {
        Some(_) => ProgressState::Completed,
        None => ProgressState::NotStarted,
    }
}
