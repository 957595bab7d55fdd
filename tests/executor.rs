mod common;

use bucketsync::core::{ActionOutcome, Executor, ExecutorConfig, SyncAction};
use common::FakeStore;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn config(limit: usize) -> ExecutorConfig {
    ExecutorConfig {
        concurrency_limit: limit,
        retry_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn transient_failure_is_retried_before_next_action_starts() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["1.txt", "2.txt", "3.txt"] {
        fs::write(dir.path().join(name), name).unwrap();
    }

    let store = Arc::new(FakeStore::new(100));
    store.fail_put("site/2.txt", 1);

    let executor = Executor::new(store.clone(), "bucket", "site", dir.path()).with_config(config(1));
    let report = executor
        .execute(vec![
            SyncAction::Upload("1.txt".into()),
            SyncAction::Upload("2.txt".into()),
            SyncAction::Upload("3.txt".into()),
        ])
        .await;

    assert_eq!(report.succeeded, vec!["1.txt", "2.txt", "3.txt"]);
    assert!(report.failed.is_empty());
    assert_eq!(
        store.events(),
        vec!["put:site/1.txt", "put:site/2.txt", "put:site/2.txt", "put:site/3.txt"]
    );
    assert_eq!(store.body("site/2.txt").unwrap().as_ref(), b"2.txt");
}

#[tokio::test]
async fn persistent_failure_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"a").unwrap();
    fs::write(dir.path().join("b.txt"), b"b").unwrap();

    let store = Arc::new(FakeStore::new(100));
    store.fail_put("a.txt", 2);

    let executor = Executor::new(store.clone(), "bucket", "", dir.path()).with_config(config(2));
    let report = executor
        .execute(vec![
            SyncAction::Upload("a.txt".into()),
            SyncAction::Upload("b.txt".into()),
            SyncAction::Skip("c.txt".into()),
        ])
        .await;

    assert_eq!(report.succeeded, vec!["b.txt"]);
    assert_eq!(report.skipped, vec!["c.txt"]);
    assert!(matches!(report.outcomes[0].1, ActionOutcome::Failed(_)));
    assert_eq!(report.outcomes[1].1, ActionOutcome::Succeeded);
    assert_eq!(report.outcomes[2].1, ActionOutcome::Skipped);
    assert_eq!(store.keys(), vec!["b.txt"]);

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a.txt");
    assert!(report.failed[0].1.contains("put"), "{}", report.failed[0].1);
}

#[tokio::test]
async fn missing_local_file_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::new(100));

    let executor = Executor::new(store.clone(), "bucket", "", dir.path()).with_config(config(1));
    let report = executor
        .execute(vec![SyncAction::Upload("gone.txt".into())])
        .await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "gone.txt");
    assert!(store.events().is_empty());
}
