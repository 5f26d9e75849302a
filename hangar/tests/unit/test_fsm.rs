//! FSM unit tests

use std::sync::Arc;

use hangar::deploy::fsm::{allowed_next, can_transition, StateMachine, TransitionOptions};
use hangar::errors::HangarError;
use hangar::models::deployment::DeploymentStatus::{self, *};
use hangar::store::local::LocalStore;
use hangar::store::DeploymentStore;

use crate::common::insert_with;

fn fsm() -> StateMachine {
    StateMachine::new(Arc::new(LocalStore::in_memory()))
}

#[test]
fn test_transition_table() {
    assert!(can_transition(Idle, Configuring));
    assert!(can_transition(Configuring, Provisioning));
    assert!(can_transition(Provisioning, Starting));
    assert!(can_transition(Starting, Healthy));
    assert!(can_transition(Healthy, Restarting));
    assert!(can_transition(Restarting, Healthy));
    assert!(can_transition(Error, Configuring));

    assert!(!can_transition(Idle, Healthy));
    assert!(!can_transition(Healthy, Configuring));
    assert!(!can_transition(Starting, Stopped));
    assert!(!can_transition(Stopped, Healthy));
}

#[test]
fn test_self_transition_always_legal() {
    for status in [
        Idle,
        Configuring,
        Provisioning,
        Starting,
        Healthy,
        Stopped,
        Restarting,
        Error,
    ] {
        assert!(can_transition(status, status));
        assert!(!allowed_next(status).contains(&status));
    }
}

#[test]
fn test_every_status_can_fail_or_recover() {
    for status in [Idle, Configuring, Provisioning, Starting, Healthy, Stopped, Restarting] {
        assert!(can_transition(status, Error), "{status} cannot fail");
    }
    assert!(can_transition(Error, Idle));
}

#[tokio::test]
async fn test_happy_path_persists_each_step() {
    let fsm = fsm();
    let d = insert_with(fsm.store(), "happy", Idle, None, None).await;

    let configuring = fsm
        .transition_to(&d.id, Configuring, TransitionOptions::step("Allocating port"))
        .await
        .unwrap();
    assert_eq!(configuring.status, Configuring);
    assert_eq!(configuring.provisioning_step.as_deref(), Some("Allocating port"));

    fsm.transition_to(&d.id, Provisioning, TransitionOptions::default())
        .await
        .unwrap();
    fsm.transition_to(&d.id, Starting, TransitionOptions::default())
        .await
        .unwrap();
    let healthy = fsm
        .transition_to(&d.id, Healthy, TransitionOptions::default())
        .await
        .unwrap();

    assert_eq!(healthy.status, Healthy);
    assert!(healthy.provisioning_step.is_none());
    assert!(healthy.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_illegal_transition_leaves_record_unchanged() {
    let fsm = fsm();
    let d = insert_with(fsm.store(), "illegal", Idle, None, None).await;

    let err = fsm
        .transition_to(&d.id, Healthy, TransitionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HangarError::InvalidTransition { from: Idle, to: Healthy }
    ));

    let stored = fsm.load(&d.id).await.unwrap();
    assert_eq!(stored.status, Idle);
    assert_eq!(stored.updated_at, d.updated_at);
}

#[tokio::test]
async fn test_error_records_message_and_leaving_clears_it() {
    let fsm = fsm();
    let d = insert_with(fsm.store(), "failing", Starting, Some(23000), Some("c1")).await;

    let failed = fsm
        .transition_to(
            &d.id,
            Error,
            TransitionOptions::error("image pull failed").releasing_container(),
        )
        .await
        .unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("image pull failed"));
    assert!(failed.container_ref.is_none());
    assert!(failed.internal_port.is_none());

    let recovered = fsm
        .transition_to(&d.id, Configuring, TransitionOptions::default())
        .await
        .unwrap();
    assert!(recovered.error_message.is_none());
}

#[tokio::test]
async fn test_error_without_message_gets_default() {
    let fsm = fsm();
    let d = insert_with(fsm.store(), "unknown", Provisioning, None, None).await;

    let failed = fsm
        .transition_to(&d.id, Error, TransitionOptions::default())
        .await
        .unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("Unknown error"));
}

#[tokio::test]
async fn test_expected_container_ref_guards_the_write() {
    let fsm = fsm();
    let d = insert_with(fsm.store(), "guarded", Healthy, Some(23000), Some("c2")).await;

    let mut options = TransitionOptions::error("Container died unexpectedly").releasing_container();
    options.expected_container_ref = Some("c1".to_string());

    let err = fsm.transition_to(&d.id, Error, options).await.unwrap_err();
    assert!(matches!(err, HangarError::Conflict(_)));

    let stored = fsm.load(&d.id).await.unwrap();
    assert_eq!(stored.status, Healthy);
    assert_eq!(stored.container_ref.as_deref(), Some("c2"));
}

#[tokio::test]
async fn test_transition_via_error_detours_when_needed() {
    let fsm = fsm();
    let d = insert_with(fsm.store(), "detour", Starting, None, None).await;

    let stopped = fsm
        .transition_via_error(&d.id, Stopped, "Stopped early", TransitionOptions::default())
        .await
        .unwrap();
    assert_eq!(stopped.status, Stopped);
    assert!(stopped.error_message.is_none());

    // direct edge, no detour
    let restarted = fsm
        .transition_via_error(&d.id, Starting, "unused", TransitionOptions::default())
        .await
        .unwrap();
    assert_eq!(restarted.status, Starting);
}

#[tokio::test]
async fn test_missing_deployment_is_not_found() {
    let fsm = fsm();
    let err = fsm
        .transition_to("missing", Configuring, TransitionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HangarError::NotFound(_)));
}

#[tokio::test]
async fn test_concurrent_transitions_from_same_status() {
    let store: Arc<dyn DeploymentStore> = Arc::new(LocalStore::in_memory());
    let fsm = Arc::new(StateMachine::new(store.clone()));
    let d = insert_with(&store, "racy", Healthy, Some(23000), Some("c1")).await;

    let tasks: Vec<_> = [Stopped, Restarting, Error]
        .into_iter()
        .map(|target: DeploymentStatus| {
            let fsm = fsm.clone();
            let id = d.id.clone();
            tokio::spawn(async move { fsm.transition_to(&id, target, TransitionOptions::default()).await })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert!(succeeded >= 1);

    let stored = fsm.load(&d.id).await.unwrap();
    assert_ne!(stored.status, Healthy);
}
