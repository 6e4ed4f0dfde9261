//! Release and version store tests

use chrono::Utc;
use tokio_test::assert_ok;

use shipd::deploy::strategy::DeployStrategy;
use shipd::models::app::AppMetadata;
use shipd::models::release::{Release, ReleaseStatus};
use shipd::storage::layout::StorageLayout;
use shipd::storage::versions::{select_expired_versions, VersionStore};

async fn store() -> (tempfile::TempDir, VersionStore) {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::rooted_at(tmp.path());
    layout.setup().await.unwrap();
    (tmp, VersionStore::new(layout))
}

/// Walk a release to `active` the way the pipeline does
async fn go_live(store: &VersionStore, app: &str, id: u64) {
    assert_ok!(store.update_version_status(app, id, ReleaseStatus::Building, None).await);
    assert_ok!(store.update_version_status(app, id, ReleaseStatus::Deploying, None).await);
    assert!(assert_ok!(store.set_current_version(app, id).await));
}

fn release(id: u64, status: ReleaseStatus) -> Release {
    Release {
        id,
        commit: format!("c{}", id),
        branch: "main".to_string(),
        timestamp: Utc::now(),
        status,
        message: None,
    }
}

#[tokio::test]
async fn test_create_version_registers_app() {
    let (_tmp, store) = store().await;
    let created = assert_ok!(store.create_version("blog", "abc123", "main").await);
    assert_eq!(created.id, 1);
    assert!(created.release_dir.is_dir());
    assert!(created.release_dir.ends_with("apps/blog/releases/v1"));

    let metadata = store.load("blog").await.unwrap();
    assert_eq!(metadata.last_version_id, 1);
    let release = metadata.version(1).unwrap();
    assert_eq!(release.status, ReleaseStatus::Pending);
    assert_eq!(release.commit, "abc123");
    assert_eq!(release.branch, "main");

    let apps = store.list_apps().await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name, "blog");
}

#[tokio::test]
async fn test_ids_are_never_reused() {
    let (_tmp, store) = store().await;
    let first = store.create_version("blog", "a", "main").await.unwrap();
    let second = store.create_version("blog", "b", "main").await.unwrap();
    assert_eq!((first.id, second.id), (1, 2));

    assert_ok!(store.remove_version("blog", 2).await);
    assert_ok!(store.remove_version("blog", 1).await);
    assert!(!second.release_dir.exists());

    let third = store.create_version("blog", "c", "main").await.unwrap();
    assert_eq!(third.id, 3);
}

#[tokio::test]
async fn test_invalid_app_names() {
    let (_tmp, store) = store().await;
    for name in ["", "../etc", "Blog", "a/b", ".hidden"] {
        assert!(store.create_version(name, "a", "main").await.is_err(), "{}", name);
    }
    assert!(store.load("nope").await.is_err());
}

#[tokio::test]
async fn test_status_transitions_are_enforced() {
    let (_tmp, store) = store().await;
    store.create_version("blog", "a", "main").await.unwrap();

    // Cannot go live without deploying first
    assert!(store.set_current_version("blog", 1).await.is_err());

    assert_ok!(
        store
            .update_version_status("blog", 1, ReleaseStatus::Failed, Some("build failed".to_string()))
            .await
    );
    assert!(store
        .update_version_status("blog", 1, ReleaseStatus::Building, None)
        .await
        .is_err());

    let metadata = store.load("blog").await.unwrap();
    let release = metadata.version(1).unwrap();
    assert_eq!(release.status, ReleaseStatus::Failed);
    assert_eq!(release.message.as_deref(), Some("build failed"));

    assert!(store
        .update_version_status("blog", 9, ReleaseStatus::Building, None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_set_current_switches_link_and_statuses() {
    let (_tmp, store) = store().await;
    let v1 = store.create_version("blog", "a", "main").await.unwrap();
    let v2 = store.create_version("blog", "b", "main").await.unwrap();

    go_live(&store, "blog", 1).await;
    let link = store.app_layout("blog").current_link();
    assert_eq!(link.target().await, Some(v1.release_dir.clone()));

    go_live(&store, "blog", 2).await;
    assert_eq!(link.target().await, Some(v2.release_dir.clone()));

    let metadata = store.load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(2));
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Success);
    assert_eq!(metadata.version(2).unwrap().status, ReleaseStatus::Active);

    // Rollback path: success goes straight back to active
    assert!(assert_ok!(store.set_current_version("blog", 1).await));
    let metadata = store.load("blog").await.unwrap();
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Active);
    assert_eq!(metadata.version(2).unwrap().status, ReleaseStatus::Success);
}

#[tokio::test]
async fn test_set_current_with_missing_directory() {
    let (_tmp, store) = store().await;
    let created = store.create_version("blog", "a", "main").await.unwrap();
    tokio::fs::remove_dir_all(&created.release_dir).await.unwrap();

    assert!(!assert_ok!(store.set_current_version("blog", 1).await));
    assert!(!assert_ok!(store.set_current_version("blog", 42).await));
    let metadata = store.load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, None);
    assert!(store.app_layout("blog").current_link().target().await.is_none());
}

#[tokio::test]
async fn test_current_release_cannot_be_removed() {
    let (_tmp, store) = store().await;
    store.create_version("blog", "a", "main").await.unwrap();
    go_live(&store, "blog", 1).await;

    let err = store.remove_version("blog", 1).await.unwrap_err();
    assert!(err.to_string().contains("current"));
    assert!(store.app_layout("blog").release_dir(1).exists().await);
}

#[tokio::test]
async fn test_clean_old_versions_keeps_current_and_newest() {
    let (_tmp, store) = store().await;
    for _ in 0..4 {
        let created = store.create_version("blog", "a", "main").await.unwrap();
        go_live(&store, "blog", created.id).await;
    }
    // An in-flight release is never touched
    store.create_version("blog", "b", "main").await.unwrap();

    let removed = assert_ok!(store.clean_old_versions("blog", 2).await);
    assert_eq!(removed, vec![1]);

    let metadata = store.load("blog").await.unwrap();
    let ids: Vec<u64> = metadata.versions.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![2, 3, 4, 5]);
    assert!(!store.app_layout("blog").release_dir(1).exists().await);
}

#[test]
fn test_retention_drops_failures_older_than_kept_successes() {
    let mut metadata = AppMetadata::new("blog");
    metadata.versions = vec![
        release(1, ReleaseStatus::Failed),
        release(2, ReleaseStatus::Success),
        release(3, ReleaseStatus::Failed),
        release(4, ReleaseStatus::Success),
        release(5, ReleaseStatus::Active),
        release(6, ReleaseStatus::Failed),
    ];
    metadata.current_version_id = Some(5);

    let mut expired = select_expired_versions(&metadata, 1);
    expired.sort_unstable();
    assert_eq!(expired, vec![1, 2, 3]);
}

#[test]
fn test_retention_without_successes_keeps_newest_failures() {
    let mut metadata = AppMetadata::new("blog");
    metadata.versions = (1..=4).map(|id| release(id, ReleaseStatus::Failed)).collect();

    let mut expired = select_expired_versions(&metadata, 2);
    expired.sort_unstable();
    assert_eq!(expired, vec![1, 2]);
}

#[tokio::test]
async fn test_list_versions_newest_first() {
    let (_tmp, store) = store().await;
    for _ in 0..3 {
        store.create_version("blog", "a", "main").await.unwrap();
    }
    go_live(&store, "blog", 2).await;

    let view = store.list_versions("blog").await.unwrap();
    assert_eq!(view.strategy, DeployStrategy::Git);
    assert_eq!(view.current_version_id, Some(2));
    let ids: Vec<u64> = view.versions.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_delete_app_removes_everything() {
    let (_tmp, store) = store().await;
    store.create_version("blog", "a", "main").await.unwrap();
    go_live(&store, "blog", 1).await;

    assert_ok!(store.delete_app("blog").await);
    assert!(!store.app_layout("blog").dir().exists().await);
    assert!(store.list_apps().await.unwrap().is_empty());
}
