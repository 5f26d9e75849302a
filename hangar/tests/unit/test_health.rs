//! Health checker unit tests

use std::sync::Arc;
use std::time::Duration;

use hangar::cache::route::{RouteCache, RouteEntry};
use hangar::deploy::fsm::StateMachine;
use hangar::deploy::health::{probe, HealthChecker, Options};
use hangar::models::deployment::DeploymentStatus;
use hangar::store::local::LocalStore;
use hangar::store::DeploymentStore;
use tokio::net::TcpListener;

use crate::common::insert_with;

fn fast_options() -> Options {
    Options {
        interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

fn checker(options: Options) -> (Arc<dyn DeploymentStore>, Arc<StateMachine>, HealthChecker) {
    let (store, fsm, health, _) = checker_with_routes(options);
    (store, fsm, health)
}

fn checker_with_routes(
    options: Options,
) -> (Arc<dyn DeploymentStore>, Arc<StateMachine>, HealthChecker, Arc<RouteCache>) {
    let store: Arc<dyn DeploymentStore> = Arc::new(LocalStore::in_memory());
    let fsm = Arc::new(StateMachine::new(store.clone()));
    let routes = Arc::new(RouteCache::new(Duration::from_secs(60), 16));
    let health = HealthChecker::new(fsm.clone(), routes.clone(), options);
    (store, fsm, health, routes)
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_status(fsm: &StateMachine, id: &str, status: DeploymentStatus) -> bool {
    for _ in 0..100 {
        if fsm.load(id).await.unwrap().status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    assert!(probe("127.0.0.1", open, Duration::from_millis(200)).await);

    drop(listener);
    let closed = closed_port().await;
    assert!(!probe("127.0.0.1", closed, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_reachable_container_becomes_healthy() {
    let (store, fsm, health) = checker(fast_options());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let d = insert_with(&store, "reachable", DeploymentStatus::Starting, Some(port), Some("c1")).await;

    health.register(&d.id, port);

    assert!(wait_for_status(&fsm, &d.id, DeploymentStatus::Healthy).await);
    // the poller removes itself on success
    for _ in 0..50 {
        if !health.is_registered(&d.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!health.is_registered(&d.id));
    drop(listener);
}

#[tokio::test]
async fn test_promotion_drops_cached_route() {
    let (store, fsm, health, routes) = checker_with_routes(fast_options());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let d = insert_with(&store, "promoted", DeploymentStatus::Starting, Some(port), Some("c1")).await;
    routes.insert("promoted", RouteEntry::from(&d));
    assert_eq!(routes.get("promoted").unwrap().status, DeploymentStatus::Starting);

    health.register(&d.id, port);

    assert!(wait_for_status(&fsm, &d.id, DeploymentStatus::Healthy).await);
    for _ in 0..50 {
        if routes.get("promoted").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(routes.get("promoted").is_none());
    drop(listener);
}

#[tokio::test]
async fn test_unreachable_container_stays_starting() {
    let (store, fsm, health) = checker(fast_options());
    let port = closed_port().await;
    let d = insert_with(&store, "unreachable", DeploymentStatus::Starting, Some(port), Some("c1")).await;

    health.register(&d.id, port);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fsm.load(&d.id).await.unwrap().status, DeploymentStatus::Starting);
    assert!(health.is_registered(&d.id));

    assert!(health.deregister(&d.id));
    assert!(!health.deregister(&d.id));
    assert_eq!(health.registered_count(), 0);
}

#[tokio::test]
async fn test_startup_timeout_moves_to_error() {
    let (store, fsm, health) = checker(Options {
        startup_timeout: Some(Duration::from_millis(100)),
        ..fast_options()
    });
    let port = closed_port().await;
    let d = insert_with(&store, "slow", DeploymentStatus::Starting, Some(port), Some("c1")).await;

    health.register(&d.id, port);

    assert!(wait_for_status(&fsm, &d.id, DeploymentStatus::Error).await);
    let failed = fsm.load(&d.id).await.unwrap();
    assert!(failed
        .error_message
        .unwrap_or_default()
        .contains("did not become reachable"));
}

#[tokio::test]
async fn test_register_replaces_existing_poller() {
    let (store, fsm, health) = checker(fast_options());
    let closed = closed_port().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let d = insert_with(&store, "replaced", DeploymentStatus::Starting, Some(open), Some("c1")).await;

    health.register(&d.id, closed);
    health.register(&d.id, open);
    assert_eq!(health.registered_count(), 1);

    assert!(wait_for_status(&fsm, &d.id, DeploymentStatus::Healthy).await);
    drop(listener);
}

#[tokio::test]
async fn test_shutdown_aborts_every_poller() {
    let (store, _fsm, health) = checker(fast_options());
    let port = closed_port().await;
    for subdomain in ["one", "two", "three"] {
        let d = insert_with(&store, subdomain, DeploymentStatus::Starting, None, None).await;
        health.register(&d.id, port);
    }
    assert_eq!(health.registered_count(), 3);

    health.shutdown();
    assert_eq!(health.registered_count(), 0);
}
