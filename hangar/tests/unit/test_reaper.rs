//! Reaper unit tests

use std::time::Duration;

use hangar::models::deployment::DeploymentStatus;
use hangar::workers::reaper::{self, SweepOutcome, ZOMBIE_MESSAGE};
use tokio::sync::oneshot;

use crate::common::{draft, harness, harness_with, insert_with};

fn completed(outcome: SweepOutcome) -> hangar::workers::reaper::SweepReport {
    match outcome {
        SweepOutcome::Completed(report) => report,
        SweepOutcome::Skipped => panic!("sweep was skipped"),
    }
}

#[tokio::test]
async fn test_zombie_is_demoted() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("zombie")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.state.health.deregister(&created.id);
    h.state
        .fsm
        .transition_to(&created.id, DeploymentStatus::Healthy, Default::default())
        .await
        .unwrap();
    h.state.proxy.lookup("zombie").await.unwrap();
    h.runtime.vanish(&container_id).await;

    let report = completed(h.state.reaper.sweep().await.unwrap());
    assert_eq!(report.checked, 1);
    assert_eq!(report.reaped, vec![created.id.clone()]);

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some(ZOMBIE_MESSAGE));
    assert!(stored.container_ref.is_none());
    assert!(stored.internal_port.is_none());
    assert!(h.state.routes.get("zombie").is_none());
}

#[tokio::test]
async fn test_live_and_inactive_deployments_are_untouched() {
    let h = harness();
    let live = h.state.orchestrator.create(draft("live")).await.unwrap();
    h.state.orchestrator.spawn(&live.id, None).await.unwrap();
    let stopped = insert_with(&h.state.store, "stopped", DeploymentStatus::Stopped, None, Some("gone-1")).await;

    let report = completed(h.state.reaper.sweep().await.unwrap());
    assert_eq!(report.checked, 1);
    assert!(report.reaped.is_empty());

    let stored = h.state.store.find_by_id(&live.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    let stored = h.state.store.find_by_id(&stopped.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Stopped);
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_container_referenced_by_name_is_live() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("named")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    let name = h.runtime.container(&container_id).await.unwrap().spec.name;
    h.state
        .store
        .update_one(
            &created.id,
            &hangar::store::UpdateGuard::none(),
            &hangar::store::DeploymentUpdate {
                container_ref: Some(Some(name)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = completed(h.state.reaper.sweep().await.unwrap());
    assert!(report.reaped.is_empty());
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_zombies_are_corrected_independently() {
    let h = harness_with(|options| options.reaper.batch_size = 2);
    let mut ids = Vec::new();
    for (i, subdomain) in ["z1", "z2", "z3"].iter().enumerate() {
        let d = insert_with(
            &h.state.store,
            subdomain,
            DeploymentStatus::Healthy,
            Some(47200 + i as u16),
            Some(&format!("missing-{i}")),
        )
        .await;
        ids.push(d.id);
    }

    let report = completed(h.state.reaper.sweep().await.unwrap());
    assert_eq!(report.reaped.len(), 3);
    assert_eq!(report.failed, 0);
    for id in &ids {
        let stored = h.state.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Error);
    }
}

#[tokio::test]
async fn test_list_failure_aborts_sweep() {
    let h = harness();
    let d = insert_with(&h.state.store, "kept", DeploymentStatus::Healthy, Some(47300), Some("c1")).await;
    h.runtime.set_list_failing(true);

    assert!(h.state.reaper.sweep().await.is_err());
    assert!(!h.state.reaper.is_running());

    let stored = h.state.store.find_by_id(&d.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Healthy);
    assert_eq!(stored.container_ref.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_overlapping_sweep_is_skipped() {
    let h = harness_with(|options| {
        options.reaper.batch_size = 1;
        options.reaper.batch_pause = Duration::from_millis(50);
    });
    insert_with(&h.state.store, "slow1", DeploymentStatus::Healthy, Some(47400), Some("x1")).await;
    insert_with(&h.state.store, "slow2", DeploymentStatus::Healthy, Some(47401), Some("x2")).await;

    let (first, second) = tokio::join!(h.state.reaper.sweep(), h.state.reaper.sweep());
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(
        outcomes.iter().filter(|o| **o == SweepOutcome::Skipped).count(),
        1
    );
    assert!(!h.state.reaper.is_running());
}

#[tokio::test]
async fn test_worker_sweeps_until_shutdown() {
    let h = harness_with(|options| options.reaper.interval = Duration::from_millis(20));
    let d = insert_with(&h.state.store, "ticked", DeploymentStatus::Starting, Some(47500), Some("x1")).await;

    let (tx, rx) = oneshot::channel::<()>();
    let worker = tokio::spawn(reaper::run(
        h.state.reaper.clone(),
        Box::pin(async move {
            let _ = rx.await;
        }),
    ));

    let mut demoted = false;
    for _ in 0..50 {
        let stored = h.state.store.find_by_id(&d.id).await.unwrap().unwrap();
        if stored.status == DeploymentStatus::Error {
            demoted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(demoted);

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
}
