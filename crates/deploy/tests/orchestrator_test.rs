//! Integration tests for deployment attempts and the stack waiter.
//!
//! Every test drives the orchestrator against [`ScriptedStackClient`], which
//! replays canned provider statuses and records each call it receives.

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use common::{ScriptedStackClient, bootstrapped_store, init_tracing};
use stackpilot_deploy::{
    ChangeSetDiff, ChangeSetExecutionStatus, DeployError, DeployTimings, DeploymentId,
    DeploymentInfo, DeploymentStackInfo, DeploymentWaiter, KeyValueStore, MemoryStore,
    ObserverGuard, RequestFactory, StackClient, StackDeployer, StackStatus, store::keys,
};

const SCENARIO_PATH: &str = "/scenarios/scenario1_auth_only";
const DISPLAY_NAME: &str = "Auth Only";
const GAME_NAME: &str = "game";

fn deployer(client: &Arc<ScriptedStackClient>, store: Arc<dyn KeyValueStore>) -> StackDeployer<ScriptedStackClient> {
    StackDeployer::new(client.clone(), RequestFactory::new(store), DISPLAY_NAME)
        .timings(DeployTimings::fast())
}

fn deployment_id() -> DeploymentId {
    DeploymentId {
        profile: "p".to_string(),
        region: "us-west-2".to_string(),
        stack_name: "GameLiftPluginForUnity-game".to_string(),
        scenario_name: DISPLAY_NAME.to_string(),
    }
}

async fn accept(_diff: ChangeSetDiff, _stack_exists: bool) -> bool {
    true
}

type LatestInfo = Arc<Mutex<Option<DeploymentStackInfo>>>;

fn record_last_info(waiter: &DeploymentWaiter<ScriptedStackClient>) -> (LatestInfo, ObserverGuard<'_>) {
    let latest = Arc::new(Mutex::new(None));
    let record = latest.clone();
    let guard = waiter.observe(move |info: &DeploymentInfo| {
        *record.lock().unwrap() = Some(DeploymentStackInfo::from_info(info));
    });
    (latest, guard)
}

/// Spin until `condition` holds, giving up after a second.
async fn until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_missing_setting_makes_no_remote_calls() {
    init_tracing();

    for missing in [keys::CURRENT_PROFILE, keys::CURRENT_REGION, keys::CURRENT_BUCKET] {
        let store = MemoryStore::new();
        for key in [keys::CURRENT_PROFILE, keys::CURRENT_REGION, keys::CURRENT_BUCKET] {
            if key != missing {
                let value = if key == keys::CURRENT_REGION { "us-west-2" } else { "x" };
                store.put(key, value).unwrap();
            }
        }

        let client = Arc::new(ScriptedStackClient::new());
        let response = deployer(&client, Arc::new(store))
            .start_deployment(Path::new(SCENARIO_PATH), None, GAME_NAME, false, accept)
            .await;

        match response {
            Err(DeployError::SettingNotFound(key)) => assert_eq!(key, missing),
            other => panic!("expected a missing {missing}, got {other:?}"),
        }
        assert!(client.calls().is_empty(), "calls made without {missing}: {:?}", client.calls());
    }
}

#[tokio::test]
async fn test_unknown_region_is_rejected_before_any_call() {
    let store = MemoryStore::new();
    store.put(keys::CURRENT_PROFILE, "p").unwrap();
    store.put(keys::CURRENT_REGION, "moon-1").unwrap();
    store.put(keys::CURRENT_BUCKET, "b").unwrap();

    let client = Arc::new(ScriptedStackClient::new());
    let response = deployer(&client, Arc::new(store))
        .start_deployment(Path::new(SCENARIO_PATH), None, GAME_NAME, false, accept)
        .await;

    assert!(matches!(response, Err(DeployError::InvalidRegion(region)) if region == "moon-1"));
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_obsolete_change_set_is_never_executed() {
    init_tracing();
    let client = Arc::new(
        ScriptedStackClient::new()
            .with_change_set_statuses(&[
                ChangeSetExecutionStatus::Unavailable,
                ChangeSetExecutionStatus::Unavailable,
                ChangeSetExecutionStatus::Obsolete,
            ])
            .with_stack_statuses(&[StackStatus::ReviewInProgress]),
    );

    let gate_called = Arc::new(Mutex::new(false));
    let seen = gate_called.clone();
    let response = deployer(&client, bootstrapped_store())
        .start_deployment(
            Path::new(SCENARIO_PATH),
            None,
            GAME_NAME,
            false,
            move |_diff: ChangeSetDiff, _exists: bool| async move {
                *seen.lock().unwrap() = true;
                true
            },
        )
        .await;

    let err = response.unwrap_err();
    assert_eq!(err.code(), "ChangeSetStatusInvalid");
    assert_eq!(client.count("describe_change_set"), 3);
    assert_eq!(client.count("execute_change_set"), 0);
    assert!(!*gate_called.lock().unwrap());
}

#[tokio::test]
async fn test_declined_change_set_is_discarded() {
    let client = Arc::new(
        ScriptedStackClient::new().with_stack_statuses(&[StackStatus::ReviewInProgress]),
    );

    let offered = Arc::new(Mutex::new(None));
    let record = offered.clone();
    let response = deployer(&client, bootstrapped_store())
        .start_deployment(
            Path::new(SCENARIO_PATH),
            None,
            GAME_NAME,
            false,
            move |diff: ChangeSetDiff, exists: bool| async move {
                *record.lock().unwrap() = Some((diff, exists));
                false
            },
        )
        .await;

    assert!(matches!(response, Err(DeployError::OperationCancelled)));
    assert_eq!(client.count("execute_change_set"), 0);
    assert_eq!(client.count("delete_change_set"), 1);

    let (diff, exists) = offered.lock().unwrap().clone().expect("gate was not called");
    assert!(!exists, "a stack in review does not exist yet");
    assert_eq!(diff.region, "us-west-2");
    assert_eq!(diff.changes.len(), 1);
}

#[tokio::test]
async fn test_existing_stack_is_reported_to_gate() {
    let client = Arc::new(
        ScriptedStackClient::new().with_stack_statuses(&[StackStatus::UpdateComplete]),
    );

    let exists = Arc::new(Mutex::new(None));
    let record = exists.clone();
    deployer(&client, bootstrapped_store())
        .start_deployment(
            Path::new(SCENARIO_PATH),
            None,
            GAME_NAME,
            false,
            move |_diff: ChangeSetDiff, stack_exists: bool| async move {
                *record.lock().unwrap() = Some(stack_exists);
                true
            },
        )
        .await
        .unwrap();

    assert_eq!(*exists.lock().unwrap(), Some(true));
}

#[tokio::test]
async fn test_successful_attempt_returns_its_identity() -> Result<()> {
    let client = Arc::new(
        ScriptedStackClient::new().with_stack_statuses(&[StackStatus::ReviewInProgress]),
    );

    let id = deployer(&client, bootstrapped_store())
        .start_deployment(Path::new(SCENARIO_PATH), None, GAME_NAME, false, accept)
        .await?;

    assert_eq!(id, deployment_id());
    assert_eq!(
        client.mutating_calls(),
        vec!["create_change_set", "execute_change_set"]
    );
    assert_eq!(client.calls().first().map(String::as_str), Some("validate_template"));
    Ok(())
}

#[tokio::test]
async fn test_failed_execution_fails_attempt() {
    let client = Arc::new(
        ScriptedStackClient::new()
            .with_stack_statuses(&[StackStatus::ReviewInProgress])
            .failing_execute("InsufficientCapabilitiesException"),
    );

    let err = deployer(&client, bootstrapped_store())
        .start_deployment(Path::new(SCENARIO_PATH), None, GAME_NAME, false, accept)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "InsufficientCapabilitiesException");
    assert_eq!(client.count("execute_change_set"), 1);
}

#[tokio::test]
async fn test_server_build_is_uploaded_after_confirmation() -> Result<()> {
    let client = Arc::new(
        ScriptedStackClient::new().with_stack_statuses(&[StackStatus::ReviewInProgress]),
    );

    deployer(&client, bootstrapped_store())
        .start_deployment(
            Path::new("/scenarios/scenario2_single_fleet"),
            Some(Path::new("/builds/server")),
            GAME_NAME,
            true,
            accept,
        )
        .await?;

    assert_eq!(
        client.mutating_calls(),
        vec!["create_change_set", "upload_build", "execute_change_set"]
    );
    Ok(())
}

#[tokio::test]
async fn test_server_scenario_without_build_folder_is_rejected() {
    let client = Arc::new(ScriptedStackClient::new());

    let err = deployer(&client, bootstrapped_store())
        .start_deployment(Path::new(SCENARIO_PATH), None, GAME_NAME, true, accept)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "InvalidArgument");
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_waiter_reports_every_poll_and_succeeds() -> Result<()> {
    init_tracing();
    let client = Arc::new(ScriptedStackClient::new().with_stack_statuses(&[
        StackStatus::CreateInProgress,
        StackStatus::CreateInProgress,
        StackStatus::CreateComplete,
    ]));
    let waiter = DeploymentWaiter::new(client.clone(), DeployTimings::fast());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let guard = waiter.observe(move |info: &DeploymentInfo| {
        record.lock().unwrap().push(info.stack_status.clone());
    });

    let id = waiter.wait_until_done(&deployment_id()).await?;
    drop(guard);

    assert_eq!(id, deployment_id());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            StackStatus::CreateInProgress,
            StackStatus::CreateInProgress,
            StackStatus::CreateComplete,
        ]
    );
    assert!(!waiter.is_waiting());
    Ok(())
}

#[tokio::test]
async fn test_waiter_rejects_rolled_back_update() {
    let client = Arc::new(ScriptedStackClient::new().with_stack_statuses(&[
        StackStatus::UpdateInProgress,
        StackStatus::UpdateRollbackInProgress,
        StackStatus::UpdateRollbackComplete,
    ]));
    let waiter = DeploymentWaiter::new(client, DeployTimings::fast());

    match waiter.wait_until_done(&deployment_id()).await {
        Err(DeployError::StackStatusInvalid { stack, status }) => {
            assert_eq!(stack, "GameLiftPluginForUnity-game");
            assert_eq!(status, "UPDATE_ROLLBACK_COMPLETE");
        }
        other => panic!("expected an invalid status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelling_creation_deletes_stack() {
    init_tracing();
    let client = Arc::new(
        ScriptedStackClient::new()
            .with_stack_statuses(&[StackStatus::CreateInProgress])
            .on_delete(&[StackStatus::DeleteInProgress]),
    );
    let waiter = DeploymentWaiter::new(client.clone(), DeployTimings::fast());
    let (latest, _guard) = record_last_info(&waiter);

    let id = deployment_id();
    let (response, cancelled) = tokio::join!(waiter.wait_until_done(&id), async {
        until(|| waiter.can_cancel()).await;
        waiter.cancel_deployment().await
    });

    cancelled.unwrap();
    assert!(matches!(response, Err(DeployError::OperationCancelled)));
    assert_eq!(
        latest.lock().unwrap().as_ref().and_then(|info| info.stack_status.clone()),
        Some(StackStatus::DeleteComplete)
    );
    assert_eq!(client.count("delete_stack"), 1);
    assert_eq!(client.count("cancel_update_stack"), 0);
}

#[tokio::test]
async fn test_cancelling_update_rolls_it_back() {
    let client = Arc::new(
        ScriptedStackClient::new()
            .with_stack_statuses(&[StackStatus::UpdateInProgress])
            .on_cancel_update(&[
                StackStatus::UpdateRollbackInProgress,
                StackStatus::UpdateRollbackComplete,
            ]),
    );
    let waiter = DeploymentWaiter::new(client.clone(), DeployTimings::fast());

    let id = deployment_id();
    let (response, cancelled) = tokio::join!(waiter.wait_until_done(&id), async {
        until(|| waiter.can_cancel()).await;
        let first = waiter.cancel_deployment().await;
        let second = waiter.cancel_deployment().await;
        (first, second)
    });

    let (first, second) = cancelled;
    first.unwrap();
    assert_eq!(second.unwrap_err().code(), "OperationInvalid");
    assert!(matches!(response, Err(DeployError::OperationCancelled)));
    assert_eq!(client.count("cancel_update_stack"), 1);
    assert_eq!(client.count("delete_stack"), 0);
}

#[tokio::test]
async fn test_deletion_ends_when_stack_is_gone() -> Result<()> {
    let client = Arc::new(
        ScriptedStackClient::new()
            .with_stack_statuses(&[StackStatus::CreateComplete])
            .on_delete(&[StackStatus::DeleteInProgress]),
    );
    let waiter = DeploymentWaiter::new(client.clone(), DeployTimings::fast());
    let id = deployment_id();

    client.delete_stack(&id.target()).await?;
    assert_eq!(waiter.wait_until_deleted(&id).await?, id);
    assert_eq!(client.count("describe_stack"), 2);
    Ok(())
}

#[tokio::test]
async fn test_quick_deletion_is_not_an_error() -> Result<()> {
    let client = Arc::new(ScriptedStackClient::new().with_stack_statuses(&[StackStatus::CreateComplete]));
    let waiter = DeploymentWaiter::new(client.clone(), DeployTimings::fast());
    let id = deployment_id();

    client.delete_stack(&id.target()).await?;
    assert_eq!(waiter.wait_until_deleted(&id).await?, id);
    Ok(())
}

#[tokio::test]
async fn test_missing_stack_fails_a_deployment_wait() {
    let waiter = DeploymentWaiter::new(Arc::new(ScriptedStackClient::new()), DeployTimings::fast());

    match waiter.wait_until_done(&deployment_id()).await {
        Err(DeployError::RemoteCallFailed { code, .. }) => assert_eq!(code, "ValidationError"),
        other => panic!("expected the describe failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_without_wait_is_invalid() {
    let waiter = DeploymentWaiter::new(Arc::new(ScriptedStackClient::new()), DeployTimings::fast());

    assert_eq!(waiter.cancel_deployment().await.unwrap_err().code(), "OperationInvalid");
    assert_eq!(waiter.cancel_waiting().unwrap_err().code(), "OperationInvalid");
}

#[tokio::test]
async fn test_second_wait_is_rejected_and_waiting_can_be_abandoned() {
    let client = Arc::new(
        ScriptedStackClient::new().with_stack_statuses(&[StackStatus::CreateInProgress]),
    );
    let waiter = DeploymentWaiter::new(client.clone(), DeployTimings::fast());

    let id = deployment_id();
    let (response, second) = tokio::join!(waiter.wait_until_done(&id), async {
        until(|| waiter.is_waiting()).await;
        let second = waiter.wait_until_done(&id).await;
        waiter.cancel_waiting().unwrap();
        second
    });

    assert_eq!(second.unwrap_err().code(), "OperationInvalid");
    assert!(matches!(response, Err(DeployError::OperationCancelled)));
    assert!(!waiter.is_waiting());
    assert!(client.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_resumed_wait_ends_with_same_info() -> Result<()> {
    let statuses = [StackStatus::CreateInProgress, StackStatus::CreateComplete];

    let uninterrupted = DeploymentWaiter::new(
        Arc::new(ScriptedStackClient::new().with_stack_statuses(&statuses)),
        DeployTimings::fast(),
    );
    let (expected, guard) = record_last_info(&uninterrupted);
    uninterrupted.wait_until_done(&deployment_id()).await?;
    drop(guard);

    let interrupted = DeploymentWaiter::new(
        Arc::new(ScriptedStackClient::new().with_stack_statuses(&statuses[..1])),
        DeployTimings::fast(),
    );
    let id = deployment_id();
    let (response, ()) = tokio::join!(interrupted.wait_until_done(&id), async {
        until(|| interrupted.can_cancel()).await;
        interrupted.cancel_waiting().unwrap();
    });
    assert!(matches!(response, Err(DeployError::OperationCancelled)));

    let resumed = DeploymentWaiter::new(
        Arc::new(ScriptedStackClient::new().with_stack_statuses(&statuses)),
        DeployTimings::fast(),
    );
    let (actual, guard) = record_last_info(&resumed);
    resumed.wait_until_done(&deployment_id()).await?;
    drop(guard);

    let expected = expected.lock().unwrap().clone();
    assert!(expected.is_some());
    assert_eq!(*actual.lock().unwrap(), expected);
    Ok(())
}
