//! stackpilot-deploy - Deployment orchestration for game backend stacks.
//!
//! This crate drives change-set based stack deployments: it builds a request
//! from persisted settings, walks the change set pipeline behind a user
//! confirmation gate, watches the stack until it settles and keeps enough
//! state on disk to resume after a restart. It also provides a generic
//! [`StepChain`] engine, used to sequence the container image and fleet
//! pipeline.
//!
//! Remote services are reached only through the [`StackClient`] and
//! [`ContainerFleetClient`] traits.

mod config;
pub use config::DeployTimings;

mod deployer;
pub use deployer::{ChangeSetDiff, ConfirmationGate, DeploymentResponse, StackDeployer};

mod error;
pub use error::{DeployError, DeployResult};

mod fs;
pub use fs::FsHandler;

pub mod parameters;
pub use parameters::{ScenarioParameter, ScenarioParameters, update_parameters_file};

pub mod pipeline;
pub use pipeline::{
    ContainerContext, ContainerFleetClient, ContainerPipelineConfig, ProcessRunner,
    ShellProcessRunner, container_pipeline,
};

mod poller;
pub use poller::Poller;

mod remote;
pub use remote::{
    ChangeSetDescription, ChangeSetExecutionStatus, RemoteError, RemoteResult, ResourceChange,
    StackClient, StackDescription, StackStatus, StackTarget,
};

pub mod request;
pub use request::{DeploymentId, DeploymentRequest, RequestFactory};

mod scenario;
pub use scenario::{Scenario, ScenarioCatalog};

mod settings;
pub use settings::{Bootstrap, DeploymentEvent, DeploymentSettings, ScenarioForm, StatusLevel};

mod stack_info;
pub use stack_info::{
    API_GATEWAY_ENDPOINT_KEY, DeploymentStackInfo, STATUS_DEPLOYMENT_STARTING,
    STATUS_NOTHING_DEPLOYED, USER_POOL_CLIENT_ID_KEY,
};

pub mod steps;
pub use steps::{ProgressState, Severity, Step, StepChain, StepError, StepEvent, StepOutcome};

pub mod store;
pub use store::{DeploymentIdSlot, FileStore, KeyValueStore, MemoryStore};

mod waiter;
pub use waiter::{DeploymentInfo, DeploymentWaiter, ObserverGuard};
