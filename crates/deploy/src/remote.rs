//! Contract of the remote infrastructure-as-code service.
//!
//! The orchestrator never speaks a wire protocol itself. Everything it needs
//! from the provider goes through [`StackClient`], which callers implement
//! (the CLI shells out to the provider's command line tool, tests script the
//! responses in memory).

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::DeploymentRequest;

/// Error reported by the provider for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The provider no longer knows the stack, which is how a finished
    /// deletion looks when the stack is described by name.
    pub fn is_stack_missing(&self) -> bool {
        self.code == "ValidationError" && self.message.contains("does not exist")
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Status of a stack as reported by the provider.
///
/// Unknown strings are preserved verbatim so that a newer provider status
/// never breaks polling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateComplete,
    CreateFailed,
    CreateInProgress,
    DeleteComplete,
    DeleteFailed,
    DeleteInProgress,
    ReviewInProgress,
    RollbackComplete,
    RollbackFailed,
    RollbackInProgress,
    UpdateComplete,
    UpdateCompleteCleanupInProgress,
    UpdateFailed,
    UpdateInProgress,
    UpdateRollbackComplete,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackFailed,
    UpdateRollbackInProgress,
    #[strum(default)]
    Other(String),
}

impl StackStatus {
    /// Parse a raw provider status code.
    pub fn from_code(code: &str) -> Self {
        code.parse().unwrap_or_else(|_| Self::Other(code.to_string()))
    }

    /// The operation that produced this status has finished, one way or another.
    pub fn is_operation_done(&self) -> bool {
        let code = self.to_string();
        code.contains("_COMPLETE") || code.contains("_FAILED")
    }

    /// The stack is in a stable state that allows another deployment or a delete.
    pub fn is_modifiable(&self) -> bool {
        matches!(
            self,
            Self::CreateComplete
                | Self::UpdateComplete
                | Self::UpdateRollbackComplete
                | Self::UpdateCompleteCleanupInProgress
        )
    }

    /// The status a waiter should report as a successful deployment.
    pub fn is_deployment_success(&self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::UpdateComplete | Self::UpdateCompleteCleanupInProgress
        )
    }
}

impl Serialize for StackStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StackStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from_code(&code))
    }
}

/// Execution status of a change set.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetExecutionStatus {
    Unavailable,
    Available,
    ExecuteInProgress,
    ExecuteComplete,
    ExecuteFailed,
    Obsolete,
}

/// Identifies the stack a call is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackTarget {
    pub profile: String,
    pub region: String,
    pub stack_name: String,
}

/// One resource change inside a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub action: String,
    pub logical_id: String,
    pub resource_type: String,
    pub replacement: Option<String>,
}

/// Result of describing a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetDescription {
    pub stack_id: String,
    pub change_set_id: String,
    pub execution_status: ChangeSetExecutionStatus,
    pub changes: Vec<ResourceChange>,
}

/// Result of describing a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDescription {
    pub status: StackStatus,
    pub game_name: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub outputs: BTreeMap<String, String>,
}

impl StackDescription {
    /// A stack whose deletion has completed.
    pub fn deleted() -> Self {
        Self {
            status: StackStatus::DeleteComplete,
            game_name: None,
            last_updated: None,
            outputs: BTreeMap::new(),
        }
    }
}

/// Remote stack provisioning service.
pub trait StackClient: Send + Sync + 'static {
    fn validate_template(
        &self,
        profile: &str,
        region: &str,
        template_path: &Path,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Create a change set for the request, returning the name it was created under.
    fn create_change_set(
        &self,
        request: &DeploymentRequest,
        change_set_name: &str,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    fn describe_change_set(
        &self,
        target: &StackTarget,
        change_set_name: &str,
    ) -> impl Future<Output = RemoteResult<ChangeSetDescription>> + Send;

    fn delete_change_set(
        &self,
        target: &StackTarget,
        change_set_name: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    fn describe_stack(
        &self,
        target: &StackTarget,
    ) -> impl Future<Output = RemoteResult<StackDescription>> + Send;

    /// Upload the request's server build under its artifact key.
    fn upload_build(
        &self,
        request: &DeploymentRequest,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    fn execute_change_set(
        &self,
        target: &StackTarget,
        change_set_name: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    fn cancel_update_stack(
        &self,
        target: &StackTarget,
        client_token: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    fn delete_stack(&self, target: &StackTarget) -> impl Future<Output = RemoteResult<()>> + Send;
}
