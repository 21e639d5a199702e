//! Watches a stack until its current operation settles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::DeployTimings;
use crate::deployer::DeploymentResponse;
use crate::error::{DeployError, DeployResult};
use crate::poller::Poller;
use crate::remote::{StackClient, StackDescription, StackStatus};
use crate::request::DeploymentId;

/// Snapshot of a watched stack, published on every successful poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub region: String,
    pub game_name: Option<String>,
    pub scenario_name: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub stack_status: StackStatus,
    pub outputs: BTreeMap<String, String>,
}

impl DeploymentInfo {
    pub fn new(id: &DeploymentId, stack: &StackDescription) -> Self {
        Self {
            region: id.region.clone(),
            game_name: stack.game_name.clone(),
            scenario_name: id.scenario_name.clone(),
            last_updated: stack.last_updated,
            stack_status: stack.status.clone(),
            outputs: stack.outputs.clone(),
        }
    }
}

type Observer = Arc<dyn Fn(&DeploymentInfo) + Send + Sync>;

/// Handle returned by [`DeploymentWaiter::observe`]. Dropping it unregisters
/// the observer.
#[must_use = "the observer is removed as soon as the guard is dropped"]
pub struct ObserverGuard<'a> {
    observers: &'a Mutex<Vec<(u64, Observer)>>,
    id: u64,
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// What a cancel request has to do, learned from the first in-progress status.
#[derive(Debug, Clone)]
struct CancelTicket {
    client_token: String,
    is_creating: bool,
}

/// What a wait is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Deployment,
    Deletion,
}

#[derive(Debug)]
struct ActiveWait {
    id: DeploymentId,
    token: CancellationToken,
    ticket: Option<CancelTicket>,
    can_cancel: bool,
    /// A rollback was requested through [`DeploymentWaiter::cancel_deployment`].
    rolled_back: bool,
    /// The stack is going away, so a missing stack means it is deleted.
    deleting: bool,
}

/// Polls a stack on a fixed period until it reaches a terminal status.
///
/// Cancellation is cooperative. [`DeploymentWaiter::cancel_deployment`]
/// asks the provider to roll the operation back and lets the running poll
/// loop observe the outcome on a later tick; a remote mutation already in
/// flight is never aborted.
pub struct DeploymentWaiter<C> {
    client: Arc<C>,
    timings: DeployTimings,
    active: Mutex<Option<ActiveWait>>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
}

impl<C: StackClient> DeploymentWaiter<C> {
    pub fn new(client: Arc<C>, timings: DeployTimings) -> Self {
        Self {
            client,
            timings,
            active: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Register an observer called synchronously with every poll result.
    pub fn observe(
        &self,
        observer: impl Fn(&DeploymentInfo) + Send + Sync + 'static,
    ) -> ObserverGuard<'_> {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, Arc::new(observer)));
        }
        ObserverGuard {
            observers: &self.observers,
            id,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.lock_active().map(|a| a.is_some()).unwrap_or(false)
    }

    /// True while an operation that can be rolled back is being watched.
    pub fn can_cancel(&self) -> bool {
        self.lock_active()
            .map(|a| a.as_ref().is_some_and(|wait| wait.can_cancel))
            .unwrap_or(false)
    }

    /// Poll `id` until its stack reaches a terminal status.
    ///
    /// Resolves to the id on a successful create or update, to
    /// [`DeployError::OperationCancelled`] when the wait was abandoned or a
    /// requested rollback finished, and to [`DeployError::StackStatusInvalid`]
    /// for any other terminal status.
    pub async fn wait_until_done(&self, id: &DeploymentId) -> DeploymentResponse {
        self.wait(id, Purpose::Deployment).await
    }

    /// Poll `id` after its stack was asked to go away.
    ///
    /// Resolves to the id once the stack is deleted, including when the
    /// provider no longer reports it at all.
    pub async fn wait_until_deleted(&self, id: &DeploymentId) -> DeploymentResponse {
        self.wait(id, Purpose::Deletion).await
    }

    async fn wait(&self, id: &DeploymentId, purpose: Purpose) -> DeploymentResponse {
        let token = self.begin(id, purpose)?;
        let _finish = FinishWait { active: &self.active };

        tracing::info!(deployment = %id, ?purpose, "Waiting for stack operation to finish");

        let target = id.target();
        let target = &target;
        let this = self;
        let poll_token = token.clone();

        let stack = Poller::new(self.timings.stack_poll())
            .with_cancellation(token.clone())
            .poll(
                move || async move {
                    let stack = match this.client.describe_stack(target).await {
                        Ok(stack) => stack,
                        Err(err) if err.is_stack_missing() && this.is_deleting() => {
                            tracing::debug!(stack = %target.stack_name, "Stack is gone");
                            StackDescription::deleted()
                        }
                        Err(err) => return Err(DeployError::from(err)),
                    };
                    this.note_status(&stack.status);
                    this.notify(&DeploymentInfo::new(id, &stack));
                    Ok::<_, DeployError>(stack)
                },
                move |stack| {
                    poll_token.is_cancelled()
                        || match purpose {
                            Purpose::Deployment => stack.status.is_operation_done(),
                            Purpose::Deletion => matches!(
                                stack.status,
                                StackStatus::DeleteComplete | StackStatus::DeleteFailed
                            ),
                        }
                },
            )
            .await?;

        if token.is_cancelled() {
            tracing::info!(deployment = %id, "Stopped waiting for deployment");
            return Err(DeployError::OperationCancelled);
        }

        let settled = match purpose {
            Purpose::Deployment => stack.status.is_deployment_success(),
            Purpose::Deletion => stack.status == StackStatus::DeleteComplete,
        };
        let rollback_finished = self.rolled_back() && stack.status.to_string().ends_with("_COMPLETE");
        if !settled && purpose == Purpose::Deployment && rollback_finished {
            tracing::info!(deployment = %id, status = %stack.status, "Stack operation rolled back");
            return Err(DeployError::OperationCancelled);
        }

        if !settled {
            tracing::warn!(deployment = %id, status = %stack.status, "Stack operation did not succeed");
            return Err(DeployError::StackStatusInvalid {
                stack: id.stack_name.clone(),
                status: stack.status.to_string(),
            });
        }

        tracing::info!(deployment = %id, status = %stack.status, "Stack operation finished");
        Ok(id.clone())
    }

    /// Ask the provider to roll back the watched operation.
    ///
    /// A stack still being created is deleted; an update is cancelled.
    pub async fn cancel_deployment(&self) -> DeployResult<()> {
        let (id, ticket) = {
            let active = self.lock_active()?;
            match active.as_ref() {
                Some(ActiveWait {
                    id,
                    ticket: Some(ticket),
                    can_cancel: true,
                    ..
                }) => (id.clone(), ticket.clone()),
                _ => {
                    return Err(DeployError::OperationInvalid(
                        "no cancellable deployment is running".to_string(),
                    ));
                }
            }
        };

        if let Some(wait) = self.lock_active()?.as_mut() {
            wait.rolled_back = true;
            wait.deleting |= ticket.is_creating;
        }

        let target = id.target();
        let requested = if ticket.is_creating {
            tracing::info!(deployment = %id, "Cancelling stack creation by deleting the stack");
            self.client.delete_stack(&target).await
        } else {
            tracing::info!(deployment = %id, "Cancelling stack update");
            self.client
                .cancel_update_stack(&target, &ticket.client_token)
                .await
        };

        if let Some(wait) = self.lock_active()?.as_mut() {
            match requested {
                Ok(()) => wait.can_cancel = false,
                Err(_) => wait.rolled_back = false,
            }
        }
        Ok(requested?)
    }

    /// Stop watching without touching the remote operation.
    pub fn cancel_waiting(&self) -> DeployResult<()> {
        let active = self.lock_active()?;
        match active.as_ref() {
            Some(wait) => {
                wait.token.cancel();
                Ok(())
            }
            None => Err(DeployError::OperationInvalid(
                "not waiting for a deployment".to_string(),
            )),
        }
    }

    fn begin(&self, id: &DeploymentId, purpose: Purpose) -> DeployResult<CancellationToken> {
        let mut active = self.lock_active()?;
        if active.is_some() {
            return Err(DeployError::OperationInvalid(
                "already waiting for a deployment".to_string(),
            ));
        }

        let token = CancellationToken::new();
        *active = Some(ActiveWait {
            id: id.clone(),
            token: token.clone(),
            ticket: None,
            can_cancel: false,
            rolled_back: false,
            deleting: purpose == Purpose::Deletion,
        });
        Ok(token)
    }

    fn is_deleting(&self) -> bool {
        self.lock_active()
            .map(|a| a.as_ref().is_some_and(|wait| wait.deleting))
            .unwrap_or(false)
    }

    fn rolled_back(&self) -> bool {
        self.lock_active()
            .map(|a| a.as_ref().is_some_and(|wait| wait.rolled_back))
            .unwrap_or(false)
    }

    fn note_status(&self, status: &StackStatus) {
        let Ok(mut active) = self.lock_active() else {
            return;
        };
        let Some(wait) = active.as_mut() else {
            return;
        };

        if *status == StackStatus::DeleteInProgress {
            wait.deleting = true;
        }

        if wait.ticket.is_none()
            && matches!(
                status,
                StackStatus::CreateInProgress | StackStatus::UpdateInProgress
            )
        {
            let token: u64 = rand::random();
            wait.ticket = Some(CancelTicket {
                client_token: format!("{token:016x}"),
                is_creating: *status == StackStatus::CreateInProgress,
            });
            wait.can_cancel = true;
        }
    }

    fn notify(&self, info: &DeploymentInfo) {
        tracing::debug!(status = %info.stack_status, scenario = %info.scenario_name, "Deployment info updated");

        // Snapshot first so an observer may register or drop guards freely.
        let observers: Vec<Observer> = match self.observers.lock() {
            Ok(observers) => observers.iter().map(|(_, o)| o.clone()).collect(),
            Err(_) => return,
        };
        for observer in observers {
            observer(info);
        }
    }

    fn lock_active(&self) -> DeployResult<MutexGuard<'_, Option<ActiveWait>>> {
        self.active
            .lock()
            .map_err(|_| DeployError::OperationInvalid("waiter state poisoned".to_string()))
    }
}

/// Clears the active wait however the wait future ends, including when it is dropped.
struct FinishWait<'a> {
    active: &'a Mutex<Option<ActiveWait>>,
}

impl Drop for FinishWait<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            *active = None;
        }
    }
}
