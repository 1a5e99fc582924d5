//! Integration tests for scaling the group up and down.


use std::time::Duration;

use harness::{is_generated_name, seed_state, start, start_in};
use vmfleet_instance_group::backend::InstanceStatus;
use vmfleet_instance_group::{BackendError, GroupError, InstanceState, MockBackend};

#[tokio::test]
async fn test_increase_creates_running_instances() {
    let t = start(MockBackend::new()).await;

    let created = t.group.increase(2).await.unwrap();
    assert_eq!(created, 2);

    let state = t.group.snapshot();
    assert_eq!(state.len(), 2);
    for (name, instance_state) in state.iter() {
        assert!(is_generated_name(name), "unexpected name {name}");
        assert_eq!(instance_state, InstanceState::Running);
        assert!(t.backend.contains(name));
    }

    assert_eq!(t.stored_state(), state);
}

#[tokio::test]
async fn test_increase_partial_failure_keeps_successes_only() {
    let t = start(MockBackend::new().failing_create_on(2)).await;

    let created = t.group.increase(2).await.unwrap();
    assert_eq!(created, 1);

    let state = t.group.snapshot();
    assert_eq!(state.len(), 1);
    assert_eq!(state.count(InstanceState::Running), 1);
    assert_eq!(t.stored_state(), state);
}

#[tokio::test]
async fn test_increase_all_failures_is_an_error() {
    let t = start(MockBackend::new().failing_creates()).await;

    let err = t.group.increase(3).await.unwrap_err();
    assert_eq!(err.reason_code(), "creation_failed");
    match err {
        GroupError::CreationFailed {
            attempted,
            last_error,
        } => {
            assert_eq!(attempted, 3);
            assert!(matches!(last_error, BackendError::Creation { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(t.group.snapshot().is_empty());
    assert!(t.stored_state().is_empty());
}

#[tokio::test]
async fn test_increase_zero_is_a_no_op() {
    let t = start(MockBackend::new()).await;

    assert_eq!(t.group.increase(0).await.unwrap(), 0);
    assert_eq!(t.backend.create_calls(), 0);
}

#[tokio::test]
async fn test_increase_counts_live_creating_records() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(
        dir.path(),
        &[
            ("w-pending0001", InstanceState::Creating),
            ("w-pending0002", InstanceState::Creating),
        ],
    );
    let backend = MockBackend::new()
        .with_instance("w-pending0001", InstanceStatus::running_at("10.0.0.2"))
        .with_instance("w-pending0002", InstanceStatus::running_at("10.0.0.3"));
    let t = start_in(dir, backend).await;

    assert_eq!(t.group.increase(3).await.unwrap(), 1);
    assert_eq!(t.backend.create_calls(), 1);

    let state = t.group.snapshot();
    assert_eq!(state.count(InstanceState::Creating), 2);
    assert_eq!(state.count(InstanceState::Running), 1);
}

#[tokio::test]
async fn test_increase_already_satisfied_by_creating_records() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(dir.path(), &[("w-pending0001", InstanceState::Creating)]);
    let backend =
        MockBackend::new().with_instance("w-pending0001", InstanceStatus::running_at("10.0.0.2"));
    let t = start_in(dir, backend).await;

    assert_eq!(t.group.increase(1).await.unwrap(), 0);
    assert_eq!(t.backend.create_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_increase_does_not_double_create() {
    let t = start(MockBackend::new().with_create_delay(Duration::from_millis(50))).await;

    let (first, second) = tokio::join!(t.group.increase(1), t.group.increase(1));

    assert_eq!(first.unwrap(), 1);
    assert_eq!(second.unwrap(), 0);
    assert_eq!(t.backend.create_calls(), 1);
    assert_eq!(t.group.snapshot().count(InstanceState::Running), 1);
}

#[tokio::test]
async fn test_decrease_deletes_and_marks_deleted() {
    let t = start(MockBackend::new()).await;
    t.group.increase(2).await.unwrap();
    let names: Vec<String> = t.group.snapshot().iter().map(|(n, _)| n.to_string()).collect();

    let removed = t.group.decrease(names.as_slice()).await;
    assert_eq!(removed, names);

    let state = t.group.snapshot();
    assert_eq!(state.count(InstanceState::Deleted), 2);
    assert!(t.backend.instance_names().is_empty());
    assert_eq!(t.backend.delete_calls(), 2);
    assert_eq!(t.stored_state(), state);
}

#[tokio::test]
async fn test_decrease_unknown_instance_counts_as_deleted() {
    let t = start(MockBackend::new()).await;

    let removed = t.group.decrease(&["x"]).await;

    assert_eq!(removed, vec!["x".to_string()]);
    assert_eq!(t.group.snapshot().get("x"), Some(InstanceState::Deleted));
    assert_eq!(t.backend.delete_calls(), 0);
}

#[tokio::test]
async fn test_decrease_twice_is_safe() {
    let t = start(MockBackend::new().with_instance("w-a", InstanceStatus::running_at("10.0.0.2")))
        .await;

    assert_eq!(t.group.decrease(&["w-a"]).await, vec!["w-a".to_string()]);
    assert_eq!(t.group.decrease(&["w-a"]).await, vec!["w-a".to_string()]);

    assert_eq!(t.backend.delete_calls(), 1);
    assert_eq!(t.group.snapshot().get("w-a"), Some(InstanceState::Deleted));
}

#[tokio::test]
async fn test_decrease_failure_keeps_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(
        dir.path(),
        &[
            ("w-stuck", InstanceState::Running),
            ("w-gone", InstanceState::Running),
        ],
    );
    let backend = MockBackend::new()
        .with_instance("w-stuck", InstanceStatus::running_at("10.0.0.2"))
        .with_instance("w-gone", InstanceStatus::running_at("10.0.0.3"))
        .failing_delete("w-stuck");
    let t = start_in(dir, backend).await;

    let removed = t.group.decrease(&["w-stuck", "w-gone"]).await;

    assert_eq!(removed, vec!["w-gone".to_string()]);
    let state = t.group.snapshot();
    assert_eq!(state.get("w-stuck"), Some(InstanceState::Running));
    assert_eq!(state.get("w-gone"), Some(InstanceState::Deleted));
}

#[tokio::test]
async fn test_decrease_skips_names_whose_lookup_fails() {
    let dir = tempfile::tempdir().unwrap();
    seed_state(dir.path(), &[("w-flaky", InstanceState::Running)]);
    let backend = MockBackend::new()
        .with_instance("w-flaky", InstanceStatus::running_at("10.0.0.2"))
        .failing_lookup("w-flaky");
    let t = start_in(dir, backend).await;

    assert!(t.group.decrease(&["w-flaky"]).await.is_empty());
    assert_eq!(t.backend.delete_calls(), 0);
    assert_eq!(t.group.snapshot().get("w-flaky"), Some(InstanceState::Running));
}

#[tokio::test]
async fn test_decrease_empty_request() {
    let t = start(MockBackend::new()).await;
    let none: [&str; 0] = [];

    assert!(t.group.decrease(&none).await.is_empty());
    assert_eq!(t.backend.get_calls(), 0);
}

#[tokio::test]
async fn test_decrease_leaves_instance_being_created_alone() {
    let t = start(MockBackend::new().with_create_delay(Duration::from_millis(200))).await;

    let scale_down = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let names: Vec<String> = t.group.snapshot().iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names.len(), 1);
        t.group.decrease(names.as_slice()).await
    };
    let (created, removed) = tokio::join!(t.group.increase(1), scale_down);

    assert_eq!(created.unwrap(), 1);
    assert!(removed.is_empty());
    assert_eq!(t.backend.delete_calls(), 0);

    // Every live instance is still tracked, even after a shutdown purge.
    t.group.shutdown();
    let state = t.group.snapshot();
    assert_eq!(state.count(InstanceState::Running), 1);
    let name = state.iter().next().unwrap().0.to_string();
    assert_eq!(t.backend.instance_names(), vec![name.clone()]);

    // Once creation has finished the instance can be removed normally.
    let removed = t.group.decrease(&[name.as_str()]).await;
    assert_eq!(removed, vec![name]);
    assert!(t.backend.instance_names().is_empty());
}
