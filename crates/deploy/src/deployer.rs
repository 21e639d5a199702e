//! A single deployment attempt: change set pipeline behind a confirmation gate.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DeployTimings;
use crate::error::{DeployError, DeployResult};
use crate::poller::Poller;
use crate::remote::{
    ChangeSetDescription, ChangeSetExecutionStatus, ResourceChange, StackClient, StackStatus,
};
use crate::request::{self, DeploymentId, DeploymentRequest, RequestFactory};

/// Outcome of one deployment attempt.
pub type DeploymentResponse = Result<DeploymentId, DeployError>;

/// The proposed diff the user is asked to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetDiff {
    pub region: String,
    pub stack_id: String,
    pub change_set_id: String,
    pub changes: Vec<ResourceChange>,
}

impl ChangeSetDiff {
    fn new(region: &str, description: ChangeSetDescription) -> Self {
        Self {
            region: region.to_string(),
            stack_id: description.stack_id,
            change_set_id: description.change_set_id,
            changes: description.changes,
        }
    }
}

/// Asks the user whether a change set may be applied.
///
/// Consumed by value, so it can be invoked at most once per attempt.
pub trait ConfirmationGate: Send {
    fn confirm(self, diff: ChangeSetDiff, stack_exists: bool) -> impl Future<Output = bool> + Send;
}

impl<F, Fut> ConfirmationGate for F
where
    F: FnOnce(ChangeSetDiff, bool) -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    fn confirm(self, diff: ChangeSetDiff, stack_exists: bool) -> impl Future<Output = bool> + Send {
        self(diff, stack_exists)
    }
}

/// Runs deployment attempts for one scenario.
///
/// Each attempt walks a fixed pipeline of remote calls and short-circuits on
/// the first failure. Nothing is retried here: a fresh attempt is the retry
/// unit, and waiting for the stack to settle belongs to the waiter.
pub struct StackDeployer<C> {
    client: Arc<C>,
    factory: RequestFactory,
    display_name: String,
    development_build: bool,
    timings: DeployTimings,
}

impl<C: StackClient> StackDeployer<C> {
    pub fn new(client: Arc<C>, factory: RequestFactory, display_name: impl Into<String>) -> Self {
        Self {
            client,
            factory,
            display_name: display_name.into(),
            development_build: false,
            timings: DeployTimings::default(),
        }
    }

    pub fn development_build(mut self, development_build: bool) -> Self {
        self.development_build = development_build;
        self
    }

    pub fn timings(mut self, timings: DeployTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Run one attempt.
    ///
    /// The gate is the only suspension point the caller controls; declining
    /// it fails the attempt with [`DeployError::OperationCancelled`] before
    /// anything is executed.
    pub async fn start_deployment<G: ConfirmationGate>(
        &self,
        scenario_path: &Path,
        build_folder: Option<&Path>,
        game_name: &str,
        has_server_build: bool,
        gate: G,
    ) -> DeploymentResponse {
        if scenario_path.as_os_str().is_empty() {
            return Err(DeployError::invalid_argument("scenario path is empty"));
        }
        if game_name.trim().is_empty() {
            return Err(DeployError::invalid_argument("game name is empty"));
        }

        let mut request =
            self.factory
                .create_request(scenario_path, game_name, self.development_build)?;
        if has_server_build {
            request = self.factory.with_server_build(request, build_folder)?;
        }

        tracing::info!(
            stack = %request.stack_name,
            region = %request.region,
            scenario = %self.display_name,
            "Validating template..."
        );
        self.client
            .validate_template(&request.profile, &request.region, &request.template_path)
            .await?;

        let (change_set_name, description) = self.create_change_set(&request).await?;

        let stack_exists = self.stack_exists(&request).await?;
        let diff = ChangeSetDiff::new(&request.region, description);
        tracing::info!(
            stack = %request.stack_name,
            changes = diff.changes.len(),
            stack_exists,
            "Awaiting confirmation of change set"
        );

        if !gate.confirm(diff, stack_exists).await {
            tracing::info!(stack = %request.stack_name, "Change set declined");
            self.discard_change_set(&request, &change_set_name).await;
            return Err(DeployError::OperationCancelled);
        }

        if request.build_artifact_key.is_some() {
            tracing::info!(
                stack = %request.stack_name,
                key = request.build_artifact_key.as_deref().unwrap_or_default(),
                "Uploading server build..."
            );
            self.client.upload_build(&request).await?;
        }

        tracing::info!(stack = %request.stack_name, change_set = %change_set_name, "Executing change set");
        self.client
            .execute_change_set(&request.target(), &change_set_name)
            .await?;

        Ok(DeploymentId::new(&request, &self.display_name))
    }

    /// Create a change set and wait until the provider has computed it.
    async fn create_change_set(
        &self,
        request: &DeploymentRequest,
    ) -> DeployResult<(String, ChangeSetDescription)> {
        let requested_name = request::change_set_name();
        let change_set_name = self
            .client
            .create_change_set(request, &requested_name)
            .await?;
        tracing::debug!(stack = %request.stack_name, change_set = %change_set_name, "Change set created");

        let target = request.target();
        let description = Poller::new(self.timings.change_set_poll())
            .poll(
                || self.client.describe_change_set(&target, &change_set_name),
                |description| {
                    description.execution_status != ChangeSetExecutionStatus::Unavailable
                },
            )
            .await?;

        if description.execution_status != ChangeSetExecutionStatus::Available {
            tracing::warn!(
                stack = %request.stack_name,
                status = %description.execution_status,
                "Change set cannot be executed"
            );
            return Err(DeployError::ChangeSetNotUsable {
                status: description.execution_status.to_string(),
            });
        }

        Ok((change_set_name, description))
    }

    /// A stack in review only exists to hold the pending change set.
    async fn stack_exists(&self, request: &DeploymentRequest) -> DeployResult<bool> {
        let stack = self.client.describe_stack(&request.target()).await?;
        Ok(stack.status != StackStatus::ReviewInProgress)
    }

    async fn discard_change_set(&self, request: &DeploymentRequest, change_set_name: &str) {
        if let Err(err) = self
            .client
            .delete_change_set(&request.target(), change_set_name)
            .await
        {
            tracing::warn!(
                stack = %request.stack_name,
                change_set = %change_set_name,
                error = %err,
                "Failed to delete declined change set"
            );
        }
    }
}
