//! Contract tests for ContainerEngine.
//!
//! These tests verify the behavioral contract of the engine trait using the
//! in-memory fake. Any conforming implementation must pass these.

use fleet_engine::fakes::MemoryEngine;
use fleet_engine::{ContainerEngine, ContainerSpec, ContainerStatus, EngineError, NetworkClass};

async fn running_container(engine: &MemoryEngine, name: &str) -> String {
    engine.pull_image("agent:1").await.unwrap();
    let internal = engine.create_internal_network("fleet-internal").await.unwrap();
    engine
        .start_container(&ContainerSpec::new(name, "agent:1").with_network(internal.id))
        .await
        .unwrap()
        .id
}

// ===========================================================================
// Images
// ===========================================================================

#[tokio::test]
async fn has_local_image_never_pulls() {
    let engine = MemoryEngine::new();
    assert!(!engine.has_local_image("agent:1").await);
    assert!(!engine.has_local_image("agent:1").await);
    assert_eq!(engine.journal().count_prefix("pull:"), 0);
}

#[tokio::test]
async fn pull_always_attempts_even_when_cached() {
    let engine = MemoryEngine::new();
    engine.add_local_image("agent:1");
    engine.pull_image("agent:1").await.unwrap();
    assert_eq!(engine.journal().count_prefix("pull:"), 1);
}

#[tokio::test]
async fn pull_failure_is_image_pull_error() {
    let engine = MemoryEngine::new();
    engine.fail_pull("missing:latest");
    let err = engine.pull_image("missing:latest").await.unwrap_err();
    assert!(matches!(err, EngineError::ImagePull { .. }));
    assert!(!engine.has_local_image("missing:latest").await);
}

// ===========================================================================
// Networks
// ===========================================================================

#[tokio::test]
async fn create_public_network_is_idempotent() {
    let engine = MemoryEngine::new();
    let first = engine.create_public_network("fleet-public").await.unwrap();
    let second = engine.create_public_network("fleet-public").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.class, NetworkClass::Public);
    assert_eq!(engine.journal().count_prefix("create_network:"), 1);
}

#[tokio::test]
async fn internal_and_public_networks_are_distinct() {
    let engine = MemoryEngine::new();
    let public = engine.create_public_network("fleet-public").await.unwrap();
    let internal = engine.create_internal_network("fleet-internal").await.unwrap();
    assert_ne!(public.id, internal.id);
    assert_eq!(internal.class, NetworkClass::Internal);
}

#[tokio::test]
async fn attach_is_noop_when_already_attached() {
    let engine = MemoryEngine::new();
    let id = running_container(&engine, "agent-a").await;
    let public = engine.create_public_network("fleet-public").await.unwrap();

    engine.attach_network(&id, &public.id).await.unwrap();
    engine.attach_network(&id, &public.id).await.unwrap();

    assert!(engine.networks_of(&id).contains(&public.id));
    assert_eq!(engine.journal().count_prefix("attach:"), 1);
}

#[tokio::test]
async fn attach_fails_for_unknown_network() {
    let engine = MemoryEngine::new();
    let id = running_container(&engine, "agent-a").await;
    let err = engine.attach_network(&id, "net-nope").await.unwrap_err();
    assert!(matches!(err, EngineError::Attach { .. }));
}

#[tokio::test]
async fn attach_fails_when_container_not_running() {
    let engine = MemoryEngine::new();
    let id = running_container(&engine, "agent-a").await;
    let public = engine.create_public_network("fleet-public").await.unwrap();
    engine.crash_container(&id);

    let err = engine.attach_network(&id, &public.id).await.unwrap_err();
    assert!(err.to_string().contains("not running"));
}

// ===========================================================================
// Containers
// ===========================================================================

#[tokio::test]
async fn start_applies_spec_networks() {
    let engine = MemoryEngine::new();
    engine.add_local_image("agent:1");
    let internal = engine.create_internal_network("fleet-internal").await.unwrap();
    let public = engine.create_public_network("fleet-public").await.unwrap();

    let handle = engine
        .start_container(
            &ContainerSpec::new("agent-a", "agent:1")
                .with_network(internal.id.clone())
                .with_network(public.id.clone()),
        )
        .await
        .unwrap();

    let nets = engine.networks_of(&handle.id);
    assert!(nets.contains(&internal.id));
    assert!(nets.contains(&public.id));
}

#[tokio::test]
async fn start_name_conflict_is_start_error() {
    let engine = MemoryEngine::new();
    running_container(&engine, "agent-a").await;
    let err = engine
        .start_container(&ContainerSpec::new("agent-a", "agent:1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Start { .. }));
}

#[tokio::test]
async fn stop_unknown_container_is_ok() {
    let engine = MemoryEngine::new();
    engine.stop_container("does-not-exist").await.unwrap();
}

#[tokio::test]
async fn stop_twice_is_ok() {
    let engine = MemoryEngine::new();
    let id = running_container(&engine, "agent-a").await;
    engine.stop_container(&id).await.unwrap();
    engine.stop_container(&id).await.unwrap();
    assert!(engine.running_names().is_empty());
}

#[tokio::test]
async fn list_is_a_snapshot() {
    let engine = MemoryEngine::new();
    running_container(&engine, "agent-a").await;
    let snapshot = engine.list_containers().await.unwrap();
    running_container(&engine, "agent-b").await;

    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, ContainerStatus::Running);
    assert_eq!(engine.list_containers().await.unwrap().len(), 2);
}

#[tokio::test]
async fn prune_drops_exited_containers_and_unused_images() {
    let engine = MemoryEngine::new();
    let a = running_container(&engine, "agent-a").await;
    engine.add_local_image("stale:0");
    engine.crash_container(&a);

    engine.prune().await.unwrap();

    assert!(engine.list_containers().await.unwrap().is_empty());
    assert!(!engine.has_local_image("stale:0").await);
}
