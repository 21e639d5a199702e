//! Scripted in-memory stack provider shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use stackpilot_deploy::{
    ChangeSetDescription, ChangeSetExecutionStatus, DeploymentRequest, KeyValueStore, MemoryStore,
    RemoteError, RemoteResult, ResourceChange, StackClient, StackDescription, StackStatus,
    StackTarget, store::keys,
};

/// Calls that change remote state.
pub const MUTATING_CALLS: &[&str] = &[
    "create_change_set",
    "delete_change_set",
    "upload_build",
    "execute_change_set",
    "cancel_update_stack",
    "delete_stack",
];

/// Replays scripted statuses and records every call it receives.
///
/// `describe_stack` pops the next scripted status and keeps repeating the
/// last one once the script runs out. With no status at all, the stack does
/// not exist. Like the real provider, a deleted stack is no longer found by
/// name once the statuses scripted with [`ScriptedStackClient::on_delete`]
/// have been reported.
#[derive(Default)]
pub struct ScriptedStackClient {
    calls: Mutex<Vec<String>>,
    change_set_statuses: Mutex<VecDeque<ChangeSetExecutionStatus>>,
    stack_statuses: Mutex<VecDeque<StackStatus>>,
    last_stack_status: Mutex<Option<StackStatus>>,
    execute_error: Mutex<Option<RemoteError>>,
    after_delete: Mutex<Vec<StackStatus>>,
    after_cancel_update: Mutex<Vec<StackStatus>>,
    deleted: Mutex<bool>,
    created_by_change_set: bool,
    outputs: BTreeMap<String, String>,
}

impl ScriptedStackClient {
    pub fn new() -> Self {
        Self {
            outputs: BTreeMap::from([(
                "ApiGatewayEndpoint".to_string(),
                "https://api.example".to_string(),
            )]),
            ..Self::default()
        }
    }

    pub fn with_change_set_statuses(self, statuses: &[ChangeSetExecutionStatus]) -> Self {
        self.change_set_statuses.lock().unwrap().extend(statuses.iter().cloned());
        self
    }

    pub fn with_stack_statuses(self, statuses: &[StackStatus]) -> Self {
        self.stack_statuses.lock().unwrap().extend(statuses.iter().cloned());
        self
    }

    /// The stack does not exist until a change set has been created.
    pub fn created_by_change_set(mut self) -> Self {
        self.created_by_change_set = true;
        self
    }

    pub fn failing_execute(self, code: &str) -> Self {
        *self.execute_error.lock().unwrap() = Some(RemoteError::new(code, "execution rejected"));
        self
    }

    /// Statuses reported once `delete_stack` has been called, before the
    /// stack disappears.
    pub fn on_delete(self, statuses: &[StackStatus]) -> Self {
        *self.after_delete.lock().unwrap() = statuses.to_vec();
        self
    }

    /// Statuses reported once `cancel_update_stack` has been called.
    pub fn on_cancel_update(self, statuses: &[StackStatus]) -> Self {
        *self.after_cancel_update.lock().unwrap() = statuses.to_vec();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| MUTATING_CALLS.contains(&call.as_str()))
            .collect()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn replace_statuses(&self, statuses: &Mutex<Vec<StackStatus>>) {
        let statuses = statuses.lock().unwrap().clone();
        if !statuses.is_empty() {
            *self.stack_statuses.lock().unwrap() = statuses.into();
        }
    }
}

impl StackClient for ScriptedStackClient {
    async fn validate_template(
        &self,
        _profile: &str,
        _region: &str,
        _template_path: &Path,
    ) -> RemoteResult<()> {
        self.record("validate_template");
        Ok(())
    }

    async fn create_change_set(
        &self,
        _request: &DeploymentRequest,
        change_set_name: &str,
    ) -> RemoteResult<String> {
        self.record("create_change_set");
        Ok(change_set_name.to_string())
    }

    async fn describe_change_set(
        &self,
        target: &StackTarget,
        change_set_name: &str,
    ) -> RemoteResult<ChangeSetDescription> {
        self.record("describe_change_set");
        let status = self
            .change_set_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ChangeSetExecutionStatus::Available);

        Ok(ChangeSetDescription {
            stack_id: format!("arn:stack/{}", target.stack_name),
            change_set_id: format!("arn:changeset/{change_set_name}"),
            execution_status: status,
            changes: vec![ResourceChange {
                action: "Add".to_string(),
                logical_id: "Fleet".to_string(),
                resource_type: "AWS::GameLift::Fleet".to_string(),
                replacement: None,
            }],
        })
    }

    async fn delete_change_set(
        &self,
        _target: &StackTarget,
        _change_set_name: &str,
    ) -> RemoteResult<()> {
        self.record("delete_change_set");
        Ok(())
    }

    async fn describe_stack(&self, target: &StackTarget) -> RemoteResult<StackDescription> {
        self.record("describe_stack");
        if self.created_by_change_set && self.count("create_change_set") == 0 {
            return Err(does_not_exist(target));
        }
        let next = self.stack_statuses.lock().unwrap().pop_front();
        if next.is_none() && *self.deleted.lock().unwrap() {
            return Err(does_not_exist(target));
        }
        let mut last = self.last_stack_status.lock().unwrap();
        if let Some(status) = next {
            *last = Some(status);
        }

        match last.clone() {
            Some(status) => Ok(StackDescription {
                status,
                game_name: target
                    .stack_name
                    .strip_prefix("GameLiftPluginForUnity-")
                    .map(str::to_string),
                last_updated: None,
                outputs: self.outputs.clone(),
            }),
            None => Err(does_not_exist(target)),
        }
    }

    async fn upload_build(&self, _request: &DeploymentRequest) -> RemoteResult<()> {
        self.record("upload_build");
        Ok(())
    }

    async fn execute_change_set(
        &self,
        _target: &StackTarget,
        _change_set_name: &str,
    ) -> RemoteResult<()> {
        self.record("execute_change_set");
        match self.execute_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn cancel_update_stack(
        &self,
        _target: &StackTarget,
        _client_token: &str,
    ) -> RemoteResult<()> {
        self.record("cancel_update_stack");
        self.replace_statuses(&self.after_cancel_update);
        Ok(())
    }

    async fn delete_stack(&self, _target: &StackTarget) -> RemoteResult<()> {
        self.record("delete_stack");
        *self.deleted.lock().unwrap() = true;
        let statuses = self.after_delete.lock().unwrap().clone();
        *self.stack_statuses.lock().unwrap() = statuses.into();
        Ok(())
    }
}

fn does_not_exist(target: &StackTarget) -> RemoteError {
    RemoteError::new(
        "ValidationError",
        format!("Stack with id {} does not exist", target.stack_name),
    )
}

/// A store holding a complete bootstrap configuration.
pub fn bootstrapped_store() -> Arc<dyn KeyValueStore> {
    let store = MemoryStore::new();
    store.put(keys::CURRENT_PROFILE, "p").unwrap();
    store.put(keys::CURRENT_REGION, "us-west-2").unwrap();
    store.put(keys::CURRENT_BUCKET, "b").unwrap();
    Arc::new(store)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
