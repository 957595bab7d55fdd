mod common;

use bucketsync::core::{ObjectLister, SyncStatus};
use bucketsync::storage::{ByteStream, ObjectStore, OpendalStore};
use bucketsync::{AppConfig, Direction, SyncAction, SyncEngine, SyncPlan};
use bytes::Bytes;
use common::FakeStore;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn test_config(trash_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.sync.list_page_delay_ms = 0;
    config.sync.retry_delay_ms = 0;
    config.sync.concurrency_limit = 4;
    config.sync.local_trash_dir = Some(trash_dir.to_path_buf());
    config
}

fn body(data: &'static [u8]) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
}

fn only_skips(actions: &[SyncAction]) -> bool {
    actions.iter().all(|a| matches!(a, SyncAction::Skip(_)))
}

#[tokio::test]
async fn mirror_to_remote_converges() {
    let local = tempfile::tempdir().unwrap();
    let trash = tempfile::tempdir().unwrap();
    fs::write(local.path().join("a.txt"), b"0123456789").unwrap();
    fs::create_dir_all(local.path().join("nested/deep")).unwrap();
    fs::write(local.path().join("nested/deep/b.bin"), b"bb").unwrap();

    let store = Arc::new(OpendalStore::memory().with_page_size(1));
    store.put_object("bucket", "site/a.txt", body(b"old")).await.unwrap();
    store.put_object("bucket", "site/stale.txt", body(b"x")).await.unwrap();

    let engine = SyncEngine::new(&test_config(trash.path()), Vec::new());
    engine.register_store("mem", store.clone());
    let plan = SyncPlan::new("bucket", "mem", local.path(), "site");

    let report = engine.run(&plan).await.unwrap();
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.summary.upload_count, 2);
    assert_eq!(report.summary.delete_remote_count, 1);

    let actions = engine.plan(&plan).await.unwrap();
    assert!(only_skips(&actions), "{:?}", actions);
    assert_eq!(actions.len(), 2);

    // 远程删除的对象仍在回收前缀下
    let page = store.list_objects("bucket", ".sync-trash/", None).await.unwrap();
    assert_eq!(page.objects.len(), 1);
    assert!(page.objects[0].key.ends_with("site/stale.txt"));
}

#[tokio::test]
async fn mirror_to_local_converges() {
    let local = tempfile::tempdir().unwrap();
    let trash = tempfile::tempdir().unwrap();
    fs::write(local.path().join("extra.txt"), b"local only").unwrap();
    fs::write(local.path().join("same.txt"), b"same").unwrap();

    let store = Arc::new(OpendalStore::memory());
    store.put_object("bucket", "same.txt", body(b"same")).await.unwrap();
    store.put_object("bucket", "dir/new.txt", body(b"remote")).await.unwrap();

    let engine = SyncEngine::new(&test_config(trash.path()), Vec::new());
    engine.register_store("mem", store.clone());
    let plan =
        SyncPlan::new("bucket", "mem", local.path(), "").with_direction(Direction::MirrorToLocal);

    let report = engine.run(&plan).await.unwrap();
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.summary.download_count, 1);
    assert_eq!(report.summary.delete_local_count, 1);
    assert_eq!(report.summary.skip_count, 1);

    assert_eq!(fs::read(local.path().join("dir/new.txt")).unwrap(), b"remote");
    assert!(!local.path().join("extra.txt").exists());
    let stamped: Vec<_> = fs::read_dir(trash.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(stamped.len(), 1);
    assert!(stamped[0].join("extra.txt").exists());

    let actions = engine.plan(&plan).await.unwrap();
    assert!(only_skips(&actions), "{:?}", actions);
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_upload_as_link_text_and_converge() {
    let local = tempfile::tempdir().unwrap();
    let trash = tempfile::tempdir().unwrap();
    fs::write(local.path().join("real.txt"), vec![b'r'; 100]).unwrap();
    fs::create_dir(local.path().join("d")).unwrap();
    fs::write(local.path().join("d/f"), b"inside").unwrap();
    std::os::unix::fs::symlink("real.txt", local.path().join("link")).unwrap();
    std::os::unix::fs::symlink("d", local.path().join("dlink")).unwrap();

    let store = Arc::new(FakeStore::new(100));
    let engine = SyncEngine::new(&test_config(trash.path()), Vec::new());
    engine.register_store("fake", store.clone());
    let plan = SyncPlan::new("bucket", "fake", local.path(), "site");

    let report = engine.run(&plan).await.unwrap();
    assert_eq!(report.status, SyncStatus::Completed, "{:?}", report.execution.failed);
    assert_eq!(report.summary.upload_count, 4);
    assert_eq!(
        store.keys(),
        vec!["site/d/f", "site/dlink", "site/link", "site/real.txt"]
    );
    // 链接上传的是目标路径文本，不是目标内容
    assert_eq!(store.body("site/link").unwrap().as_ref(), b"real.txt");
    assert_eq!(store.body("site/dlink").unwrap().as_ref(), b"d");
    assert_eq!(store.body("site/real.txt").unwrap().len(), 100);

    let actions = engine.plan(&plan).await.unwrap();
    assert!(only_skips(&actions), "{:?}", actions);
    assert_eq!(actions.len(), 4);
}

#[tokio::test]
async fn page_size_does_not_change_listing() {
    let small = FakeStore::new(1);
    let large = FakeStore::new(1000);
    for key in ["p/a", "p/b/c", "p/d", "q/other", "p/e/f/g"] {
        small.insert(key, key.as_bytes());
        large.insert(key, key.as_bytes());
    }

    let lister = ObjectLister::new().with_page_delay(Duration::ZERO);
    let from_small = lister.list(&small, "bucket", "p").await.unwrap();
    let from_large = lister.list(&large, "bucket", "p").await.unwrap();

    assert_eq!(from_small, from_large);
    assert_eq!(from_small.len(), 4);
    assert!(from_small.contains_key("e/f/g"));
}

#[tokio::test]
async fn transient_listing_failure_resumes_from_token() {
    let local = tempfile::tempdir().unwrap();
    let trash = tempfile::tempdir().unwrap();

    let store = Arc::new(FakeStore::new(1));
    for key in ["a", "b", "c"] {
        store.insert(key, b"1");
    }
    store.fail_list_call(2);

    let engine = SyncEngine::new(&test_config(trash.path()), Vec::new());
    engine.register_store("fake", store.clone());
    let plan = SyncPlan::new("bucket", "fake", local.path(), "")
        .with_direction(Direction::MirrorToLocal);

    let actions = engine.plan(&plan).await.unwrap();
    assert_eq!(actions.len(), 3);

    let lists: Vec<_> = store
        .events()
        .into_iter()
        .filter(|e| e.starts_with("list:"))
        .collect();
    // 第三次调用失败后从令牌 "b" 续传，而不是从头开始
    assert_eq!(lists, vec!["list:", "list:a", "list:b", "list:b"]);
}

#[tokio::test]
async fn listing_is_cached_between_plans() {
    let local = tempfile::tempdir().unwrap();
    let trash = tempfile::tempdir().unwrap();

    let store = Arc::new(FakeStore::new(10));
    store.insert("k", b"v");

    let engine = SyncEngine::new(&test_config(trash.path()), Vec::new());
    engine.register_store("fake", store.clone());
    let plan = SyncPlan::new("bucket", "fake", local.path(), "");

    engine.plan(&plan).await.unwrap();
    engine.plan(&plan).await.unwrap();

    let lists = store.events().iter().filter(|e| e.starts_with("list:")).count();
    assert_eq!(lists, 1);
    assert!(engine.cached_listing(&plan).is_some());
}
