//! Deployment orchestration for the scenario form.
//!
//! [`DeploymentSettings`] owns the form, the bootstrap settings and the
//! latest [`DeploymentStackInfo`]. It drives one [`StackDeployer`] attempt at
//! a time, persists the resulting [`DeploymentId`] and watches it with a
//! [`DeploymentWaiter`]. Every state change is published as a
//! [`DeploymentEvent`]; callers that render state subscribe to the channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::DeployTimings;
use crate::deployer::{ConfirmationGate, DeploymentResponse, StackDeployer};
use crate::error::{DeployError, DeployResult};
use crate::parameters::{self, exe_path_in_build, server_launch_path, update_parameters_file};
use crate::remote::{StackClient, StackStatus, StackTarget};
use crate::request::{self, DeploymentId, PARAMETERS_FILE_NAME, RequestFactory};
use crate::scenario::{Scenario, ScenarioCatalog};
use crate::stack_info::{DeploymentStackInfo, STATUS_DEPLOYMENT_STARTING};
use crate::store::{DeploymentIdSlot, KeyValueStore, keys};
use crate::waiter::{DeploymentInfo, DeploymentWaiter};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Watch {
    Deployment,
    Deletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum StatusLevel {
    Info,
    Error,
}

/// Notification emitted by [`DeploymentSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    StackInfoChanged(DeploymentStackInfo),
    RunningChanged(bool),
    Status { level: StatusLevel, message: String },
}

/// The fields a user fills in before deploying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioForm {
    pub scenario: Option<Scenario>,
    pub game_name: String,
    pub build_folder: Option<PathBuf>,
    pub build_file: Option<PathBuf>,
    pub build_operating_system: Option<String>,
    pub fleet_name: Option<String>,
    pub build_name: Option<String>,
    pub launch_parameters: Option<String>,
}

impl ScenarioForm {
    fn has_game_server(&self) -> bool {
        self.scenario.is_some_and(|scenario| scenario.has_game_server())
    }

    fn is_filled(&self) -> bool {
        if self.game_name.trim().is_empty() || self.scenario.is_none() {
            return false;
        }
        if !self.has_game_server() {
            return true;
        }
        self.build_folder.as_deref().is_some_and(|path| path.is_dir())
            && self.build_file.as_deref().is_some_and(|path| path.is_file())
    }
}

/// Profile, region and bucket as last read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bootstrap {
    pub profile: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
}

impl Bootstrap {
    fn read(store: &dyn KeyValueStore) -> DeployResult<Self> {
        Ok(Self {
            profile: store.get(keys::CURRENT_PROFILE)?,
            region: store.get(keys::CURRENT_REGION)?,
            bucket: store.get(keys::CURRENT_BUCKET)?,
        })
    }

    pub fn has_valid_region(&self) -> bool {
        self.region.as_deref().is_some_and(request::is_valid_region)
    }

    pub fn is_complete(&self) -> bool {
        let filled = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        filled(&self.profile) && filled(&self.bucket) && self.has_valid_region()
    }
}

pub struct DeploymentSettings<C> {
    client: Arc<C>,
    store: Arc<dyn KeyValueStore>,
    catalog: ScenarioCatalog,
    timings: DeployTimings,
    development_build: bool,
    waiter: DeploymentWaiter<C>,
    current_deployment: DeploymentIdSlot,
    form: Mutex<ScenarioForm>,
    bootstrap: Mutex<Bootstrap>,
    stack_info: Arc<Mutex<DeploymentStackInfo>>,
    running: AtomicBool,
    events: broadcast::Sender<DeploymentEvent>,
}

impl<C: StackClient> DeploymentSettings<C> {
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn KeyValueStore>,
        catalog: ScenarioCatalog,
        timings: DeployTimings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            waiter: DeploymentWaiter::new(client.clone(), timings.clone()),
            current_deployment: DeploymentIdSlot::new(store.clone()),
            client,
            store,
            catalog,
            timings,
            development_build: false,
            form: Mutex::new(ScenarioForm::default()),
            bootstrap: Mutex::new(Bootstrap::default()),
            stack_info: Arc::new(Mutex::new(DeploymentStackInfo::nothing_deployed())),
            running: AtomicBool::new(false),
            events,
        }
    }

    pub fn development_build(mut self, development_build: bool) -> Self {
        self.development_build = development_build;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    /// Re-read bootstrap settings and the current stack.
    pub async fn refresh(&self) -> DeployResult<()> {
        let bootstrap = Bootstrap::read(self.store.as_ref())?;
        *lock(&self.bootstrap) = bootstrap;
        self.refresh_current_stack_info().await;
        Ok(())
    }

    pub fn bootstrap(&self) -> Bootstrap {
        lock(&self.bootstrap).clone()
    }

    pub fn is_bootstrapped(&self) -> bool {
        lock(&self.bootstrap).is_complete()
    }

    pub fn form(&self) -> ScenarioForm {
        lock(&self.form).clone()
    }

    /// Edit the form in place.
    ///
    /// Switching to a scenario without a game server drops the build paths,
    /// and renaming the game forgets the stack info of the old name.
    pub fn edit_form(&self, edit: impl FnOnce(&mut ScenarioForm)) {
        let renamed = {
            let mut form = lock(&self.form);
            let previous_name = form.game_name.clone();
            edit(&mut form);
            if !form.has_game_server() {
                form.build_folder = None;
                form.build_file = None;
            }
            form.game_name != previous_name
        };

        if renamed {
            self.set_stack_info(DeploymentStackInfo::nothing_deployed());
        }
    }

    pub fn is_form_filled(&self) -> bool {
        lock(&self.form).is_filled()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_stack_info(&self) -> DeploymentStackInfo {
        lock(&self.stack_info).clone()
    }

    pub fn has_current_stack(&self) -> bool {
        lock(&self.stack_info).has_stack()
    }

    pub fn is_current_stack_modifiable(&self) -> bool {
        lock(&self.stack_info).is_modifiable()
    }

    pub fn can_edit(&self) -> bool {
        !self.is_running() && self.is_bootstrapped() && self.is_current_stack_modifiable()
    }

    pub fn can_deploy(&self) -> bool {
        self.can_edit() && self.is_form_filled()
    }

    pub fn can_cancel(&self) -> bool {
        self.is_running() && self.waiter.can_cancel()
    }

    /// Run one deployment attempt for the current form, then watch it.
    ///
    /// Returns `None` without doing anything when the form is not ready or
    /// an attempt is already running.
    pub async fn start_deployment<G: ConfirmationGate>(
        &self,
        gate: G,
    ) -> Option<DeploymentResponse> {
        if !self.can_deploy() {
            return None;
        }
        let form = self.form();
        let scenario = form.scenario?;

        let values = match self.parameter_values(&form) {
            Some(values) => values,
            None => {
                self.status(
                    StatusLevel::Error,
                    "The server executable must be inside the build folder",
                );
                return None;
            }
        };

        let running = self.begin_running()?;
        let scenario_path = self.catalog.path_of(scenario);

        let response = match update_parameters_file(&scenario_path.join(PARAMETERS_FILE_NAME), &values) {
            Ok(()) => {
                self.set_stack_info(DeploymentStackInfo::message(STATUS_DEPLOYMENT_STARTING));
                let deployer = StackDeployer::new(
                    self.client.clone(),
                    RequestFactory::new(self.store.clone()),
                    scenario.display_name(),
                )
                .development_build(self.development_build)
                .timings(self.timings.clone());

                match deployer
                    .start_deployment(
                        &scenario_path,
                        form.build_folder.as_deref(),
                        &form.game_name,
                        scenario.has_game_server(),
                        gate,
                    )
                    .await
                {
                    Ok(id) => {
                        if let Err(err) = self.current_deployment.set(&id) {
                            tracing::warn!(deployment = %id, error = %err, "Failed to persist deployment id");
                        }
                        self.watch(&id, Watch::Deployment).await
                    }
                    Err(err) => {
                        if !err.is_cancelled() {
                            tracing::error!(code = err.code(), error = %err, "Deployment failed");
                            self.status(StatusLevel::Error, format!("Deployment failed: {err}"));
                        }
                        Err(err)
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to update scenario parameters");
                self.status(StatusLevel::Error, err.to_string());
                Err(err)
            }
        };

        drop(running);
        self.refresh_current_stack_info().await;
        Some(response)
    }

    /// Resume watching a persisted deployment, typically after a restart.
    ///
    /// Returns `None` when an attempt is already running or nothing is persisted.
    pub async fn wait_for_current_deployment(&self) -> Option<DeploymentResponse> {
        self.resume(Watch::Deployment).await
    }

    async fn resume(&self, watch: Watch) -> Option<DeploymentResponse> {
        if self.is_running() {
            return None;
        }
        let id = match self.current_deployment.get() {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read persisted deployment id");
                return None;
            }
        };

        let _running = self.begin_running()?;
        tracing::info!(deployment = %id, "Resuming deployment");
        Some(self.watch(&id, watch).await)
    }

    /// Ask the provider to roll back the running attempt.
    pub async fn cancel_deployment(&self) -> DeployResult<()> {
        if !self.can_cancel() {
            tracing::warn!("No cancellable deployment is running");
            return Err(DeployError::OperationInvalid(
                "no cancellable deployment is running".to_string(),
            ));
        }
        self.waiter.cancel_deployment().await?;
        self.status(StatusLevel::Info, "Cancellation requested");
        Ok(())
    }

    /// Stop watching; the deployment keeps running remotely and stays resumable.
    pub fn cancel_waiting_for_deployment(&self) -> DeployResult<()> {
        self.waiter.cancel_waiting()
    }

    /// Delete the stack of the current game and watch the deletion.
    pub async fn delete_deployment(&self) -> DeployResult<Option<DeploymentResponse>> {
        if self.is_running() {
            return Err(DeployError::OperationInvalid(
                "a deployment is running".to_string(),
            ));
        }

        let form = self.form();
        let target = self.current_target(&form)?;
        let id = DeploymentId {
            profile: target.profile.clone(),
            region: target.region.clone(),
            stack_name: target.stack_name.clone(),
            scenario_name: scenario_name(&form),
        };

        tracing::info!(stack = %target.stack_name, region = %target.region, "Deleting stack");
        self.client.delete_stack(&target).await?;
        self.current_deployment.set(&id)?;
        self.refresh_current_stack_info().await;
        Ok(self.resume(Watch::Deletion).await)
    }

    /// Describe the current game's stack; any failure means nothing is deployed.
    pub async fn refresh_current_stack_info(&self) {
        if self.is_running() {
            return;
        }

        let form = self.form();
        if form.game_name.trim().is_empty() {
            self.set_stack_info(DeploymentStackInfo::nothing_deployed());
            return;
        }

        let target = match self.current_target(&form) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to describe stack");
                self.set_stack_info(DeploymentStackInfo::nothing_deployed());
                return;
            }
        };

        match self.client.describe_stack(&target).await {
            Ok(description) => self.set_stack_info(DeploymentStackInfo::from_description(
                &description,
                &target.region,
                &scenario_name(&form),
            )),
            Err(err) => {
                tracing::debug!(stack = %target.stack_name, error = %err, "No current stack");
                self.set_stack_info(DeploymentStackInfo::nothing_deployed());
            }
        }
    }

    /// Persist the form fields.
    pub fn save(&self) -> DeployResult<()> {
        let form = self.form();
        let store = self.store.as_ref();
        let scenario = form.scenario.map(|scenario| scenario.to_string());

        store.put_optional(keys::SCENARIO, scenario.as_deref())?;
        store.put(keys::GAME_NAME, &form.game_name)?;
        store.put_optional(keys::BUILD_FOLDER, path_str(&form.build_folder).as_deref())?;
        store.put_optional(keys::BUILD_FILE, path_str(&form.build_file).as_deref())?;
        store.put_optional(keys::BUILD_OPERATING_SYSTEM, form.build_operating_system.as_deref())?;
        store.put_optional(keys::FLEET_NAME, form.fleet_name.as_deref())?;
        store.put_optional(keys::BUILD_NAME, form.build_name.as_deref())?;
        store.put_optional(keys::LAUNCH_PARAMETERS, form.launch_parameters.as_deref())?;
        Ok(())
    }

    /// Load the form fields saved by [`DeploymentSettings::save`].
    ///
    /// An unknown saved scenario falls back to the single-region fleet.
    pub fn restore(&self) -> DeployResult<()> {
        let store = self.store.as_ref();
        let scenario = match store.get(keys::SCENARIO)? {
            Some(saved) => saved.parse().unwrap_or(Scenario::SingleRegionFleet),
            None => Scenario::SingleRegionFleet,
        };

        let form = ScenarioForm {
            scenario: Some(scenario),
            game_name: store.get(keys::GAME_NAME)?.unwrap_or_default(),
            build_folder: store.get(keys::BUILD_FOLDER)?.map(PathBuf::from),
            build_file: store.get(keys::BUILD_FILE)?.map(PathBuf::from),
            build_operating_system: store.get(keys::BUILD_OPERATING_SYSTEM)?,
            fleet_name: store.get(keys::FLEET_NAME)?,
            build_name: store.get(keys::BUILD_NAME)?,
            launch_parameters: store.get(keys::LAUNCH_PARAMETERS)?,
        };
        self.edit_form(|current| *current = form);
        Ok(())
    }

    async fn watch(&self, id: &DeploymentId, watch: Watch) -> DeploymentResponse {
        let _observer = self.waiter.observe(self.stack_info_observer());
        let response = match watch {
            Watch::Deployment => self.waiter.wait_until_done(id).await,
            Watch::Deletion => self.waiter.wait_until_deleted(id).await,
        };

        match &response {
            Ok(_) => match watch {
                Watch::Deployment => self.status(StatusLevel::Info, format!("Deployment of {id} finished")),
                Watch::Deletion => self.status(StatusLevel::Info, format!("Stack {} deleted", id.stack_name)),
            },
            Err(err) if err.is_cancelled() => {}
            Err(err @ DeployError::StackStatusInvalid { .. }) => {
                tracing::info!(deployment = %id, error = %err, "Deployment ended");
            }
            Err(err) => tracing::error!(deployment = %id, code = err.code(), error = %err, "Waiting for deployment failed"),
        }

        // An abandoned wait stays resumable; a finished rollback does not.
        let settled = lock(&self.stack_info)
            .stack_status
            .as_ref()
            .is_some_and(StackStatus::is_operation_done);
        let abandoned = response.as_ref().is_err_and(DeployError::is_cancelled) && !settled;
        if !abandoned {
            if let Err(err) = self.current_deployment.clear() {
                tracing::warn!(error = %err, "Failed to clear persisted deployment id");
            }
        }
        response
    }

    fn stack_info_observer(&self) -> impl Fn(&DeploymentInfo) + Send + Sync + 'static {
        let stack_info = self.stack_info.clone();
        let events = self.events.clone();
        move |info: &DeploymentInfo| {
            let info = DeploymentStackInfo::from_info(info);
            *lock(&stack_info) = info.clone();
            let _ = events.send(DeploymentEvent::StackInfoChanged(info));
        }
    }

    /// Template parameters for the form, or `None` when the build file lies
    /// outside the build folder.
    fn parameter_values(&self, form: &ScenarioForm) -> Option<Vec<(&'static str, String)>> {
        let mut values = vec![(parameters::keys::GAME_NAME, form.game_name.clone())];
        if !form.has_game_server() {
            return Some(values);
        }

        let exe_path = exe_path_in_build(form.build_folder.as_deref()?, form.build_file.as_deref()?)?;
        values.push((parameters::keys::LAUNCH_PATH, server_launch_path(&exe_path)));

        let optional = [
            (parameters::keys::BUILD_OPERATING_SYSTEM, &form.build_operating_system),
            (parameters::keys::FLEET_NAME, &form.fleet_name),
            (parameters::keys::BUILD_NAME, &form.build_name),
            (parameters::keys::LAUNCH_PARAMETERS, &form.launch_parameters),
        ];
        for (key, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                values.push((key, value.to_string()));
            }
        }
        Some(values)
    }

    fn current_target(&self, form: &ScenarioForm) -> DeployResult<StackTarget> {
        let bootstrap = self.bootstrap();
        let profile = bootstrap
            .profile
            .filter(|profile| !profile.is_empty())
            .ok_or_else(|| DeployError::SettingNotFound(keys::CURRENT_PROFILE.to_string()))?;
        let region = bootstrap
            .region
            .ok_or_else(|| DeployError::SettingNotFound(keys::CURRENT_REGION.to_string()))?;
        if !request::is_valid_region(&region) {
            return Err(DeployError::InvalidRegion(region));
        }
        if form.game_name.trim().is_empty() {
            return Err(DeployError::invalid_argument("game name is empty"));
        }

        Ok(StackTarget {
            profile,
            region,
            stack_name: request::stack_name(&form.game_name),
        })
    }

    fn begin_running(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        let _ = self.events.send(DeploymentEvent::RunningChanged(true));
        Some(RunningGuard {
            running: &self.running,
            events: &self.events,
        })
    }

    fn set_stack_info(&self, info: DeploymentStackInfo) {
        *lock(&self.stack_info) = info.clone();
        let _ = self.events.send(DeploymentEvent::StackInfoChanged(info));
    }

    fn status(&self, level: StatusLevel, message: impl Into<String>) {
        let _ = self.events.send(DeploymentEvent::Status {
            level,
            message: message.into(),
        });
    }
}

/// Marks an attempt as running until dropped.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
    events: &'a broadcast::Sender<DeploymentEvent>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(DeploymentEvent::RunningChanged(false));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn scenario_name(form: &ScenarioForm) -> String {
    form.scenario
        .map(|scenario| scenario.display_name().to_string())
        .unwrap_or_default()
}

fn path_str(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|path| path.to_string_lossy().into_owned())
}
