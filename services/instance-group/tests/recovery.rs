//! Integration tests for startup, persistence and stale-state repair.


use std::time::Duration;

use harness::{seed_state, start, start_in, start_with, state_path, test_config, try_start};
use vmfleet_instance_group::backend::InstanceStatus;
use vmfleet_instance_group::version::VERSION;
use vmfleet_instance_group::{GroupError, InstanceState, MockBackend};

#[tokio::test]
async fn test_initialize_reports_provider_info() {
    let t = start(MockBackend::new()).await;

    assert_eq!(t.provider.id, "mock");
    assert_eq!(t.provider.version, VERSION);
    assert_eq!(t.provider.max_size, 20);
    assert!(!t.provider.build_info.is_empty());
    assert!(t.group.snapshot().is_empty());
}

#[tokio::test]
async fn test_initialize_creates_state_directory() {
    let t = start(MockBackend::new()).await;

    assert!(t.state_path().parent().unwrap().is_dir());
}

#[tokio::test]
async fn test_initialize_rejects_missing_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.instance_key_path = Some(dir.path().join("id_ed25519"));

    let err = try_start(config, MockBackend::new()).await.err().unwrap();
    assert!(matches!(err, GroupError::Configuration(_)));
}

#[tokio::test]
async fn test_initialize_rejects_naming_scheme_without_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.naming_scheme = "worker".to_string();

    let err = try_start(config, MockBackend::new()).await.err().unwrap();
    assert_eq!(err.reason_code(), "configuration_error");
}

#[tokio::test]
async fn test_initialize_fails_when_backend_unreachable() {
    let dir = tempfile::tempdir().unwrap();

    let err = try_start(test_config(dir.path()), MockBackend::new().unreachable())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GroupError::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_corrupt_state_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path(dir.path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ not json").unwrap();

    let t = start_in(dir, MockBackend::new()).await;
    assert!(t.group.snapshot().is_empty());

    t.group.increase(1).await.unwrap();
    assert_eq!(t.stored_state().count(InstanceState::Running), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let t = start(MockBackend::new()).await;
    t.group.increase(2).await.unwrap();
    let before = t.group.snapshot();

    let config = test_config(t.dir.path());
    let (group, _) = try_start(config, MockBackend::new()).await.unwrap();

    assert_eq!(group.snapshot(), before);
}

#[tokio::test]
async fn test_stale_creating_records_are_repaired() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(
        dir.path(),
        &[
            ("w-orphan0001", InstanceState::Creating),
            ("w-orphan0002", InstanceState::Creating),
            ("w-healthy001", InstanceState::Running),
        ],
    );
    let backend =
        MockBackend::new().with_instance("w-healthy001", InstanceStatus::running_at("10.0.0.9"));
    let t = start_in(dir, backend).await;

    let created = t.group.increase(2).await.unwrap();
    assert_eq!(created, 2);
    assert_eq!(t.backend.create_calls(), 2);

    let state = t.group.snapshot();
    assert!(!state.contains("w-orphan0001"));
    assert!(!state.contains("w-orphan0002"));
    assert_eq!(state.count(InstanceState::Running), 3);
    assert_eq!(state.count(InstanceState::Creating), 0);
    assert_eq!(t.stored_state(), state);
}

#[tokio::test]
async fn test_stale_cleanup_keeps_creating_records_the_backend_knows() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(
        dir.path(),
        &[
            ("w-booting01", InstanceState::Creating),
            ("w-orphan01", InstanceState::Creating),
        ],
    );
    let backend =
        MockBackend::new().with_instance("w-booting01", InstanceStatus::running_at("10.0.0.4"));
    let t = start_in(dir, backend).await;

    assert_eq!(t.group.cleanup_stale_creating().await, 1);

    let state = t.group.snapshot();
    assert_eq!(state.get("w-booting01"), Some(InstanceState::Creating));
    assert!(!state.contains("w-orphan01"));
}

#[tokio::test]
async fn test_cancelled_increase_leaves_creating_record() {
    let t = start(MockBackend::new().with_create_delay(Duration::from_secs(30))).await;

    let outcome = tokio::time::timeout(Duration::from_millis(50), t.group.increase(1)).await;
    assert!(outcome.is_err());

    let state = t.group.snapshot();
    assert_eq!(state.count(InstanceState::Creating), 1);
    assert_eq!(t.stored_state(), state);

    // The abandoned record is stale: the backend never registered it.
    assert_eq!(t.group.cleanup_stale_creating().await, 1);
    assert!(t.group.snapshot().is_empty());
}

#[tokio::test]
async fn test_update_reports_every_record_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(
        dir.path(),
        &[
            ("w-a", InstanceState::Running),
            ("w-b", InstanceState::Creating),
            ("w-c", InstanceState::Deleted),
        ],
    );
    let t = start_in(dir, MockBackend::new()).await;
    std::fs::remove_file(t.state_path()).unwrap();

    let mut reported = Vec::new();
    t.group
        .update(|name, state| reported.push((name.to_string(), state)));

    assert_eq!(
        reported,
        vec![
            ("w-a".to_string(), InstanceState::Running),
            ("w-b".to_string(), InstanceState::Creating),
            ("w-c".to_string(), InstanceState::Deleted),
        ]
    );
    assert_eq!(t.stored_state(), t.group.snapshot());
    assert_eq!(t.backend.get_calls(), 0);
}

#[tokio::test]
async fn test_shutdown_purges_only_deleted_records() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(
        dir.path(),
        &[
            ("w-a", InstanceState::Running),
            ("w-b", InstanceState::Creating),
            ("w-c", InstanceState::Deleted),
            ("w-d", InstanceState::Deleted),
        ],
    );
    let t = start_in(dir, MockBackend::new()).await;

    assert_eq!(t.group.shutdown(), 2);

    let state = t.group.snapshot();
    assert_eq!(state.len(), 2);
    assert_eq!(state.get("w-a"), Some(InstanceState::Running));
    assert_eq!(state.get("w-b"), Some(InstanceState::Creating));
    assert_eq!(t.stored_state(), state);
    assert_eq!(t.backend.delete_calls(), 0);
}

#[tokio::test]
async fn test_operation_timeout_and_max_size_come_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_instances = 3;
    config.operation_timeout_secs = 5;

    let t = start_with(dir, config, MockBackend::new()).await;

    assert_eq!(t.provider.max_size, 3);
    assert_eq!(t.group.config().operation_timeout(), Duration::from_secs(5));
    assert_eq!(t.group.config().startup_timeout(), Duration::from_secs(120));
}
