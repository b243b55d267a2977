//! Integration tests for the SQLite item store.

use chrono::{TimeZone, Utc};

use odmirror_core::domain::item::{Item, ItemKind, RemotePointer};
use odmirror_core::domain::errors::StoreError;
use odmirror_core::ports::store::ItemStore;
use odmirror_store::{DatabasePool, SqliteItemStore};

const DRIVE: &str = "abcdef0123456789";

async fn store() -> SqliteItemStore {
    let db = DatabasePool::in_memory().await.unwrap();
    SqliteItemStore::new(&db)
}

fn item(id: &str, parent: Option<&str>, name: &str, kind: ItemKind) -> Item {
    Item {
        drive_id: DRIVE.to_string(),
        id: id.to_string(),
        parent_id: parent.map(|p| p.to_string()),
        name: name.to_string(),
        remote_name: None,
        kind,
        etag: Some(format!("etag-{id}")),
        ctag: None,
        mtime: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        size: 100,
        quick_xor_hash: Some("H1".to_string()),
        sha256_hash: None,
        reloc_drive_id: None,
        reloc_parent_id: None,
        in_sync: true,
    }
}

/// Seeds root -> A -> b.txt.
async fn seed_tree(s: &SqliteItemStore) {
    s.upsert(&item("root", None, "root", ItemKind::Root)).await.unwrap();
    s.upsert(&item("A", Some("root"), "A", ItemKind::Dir)).await.unwrap();
    s.upsert(&item("b", Some("A"), "b.txt", ItemKind::File)).await.unwrap();
}

#[tokio::test]
async fn test_upsert_and_get_round_trip() {
    let s = store().await;
    seed_tree(&s).await;

    let fetched = s.get(DRIVE, "b").await.unwrap().unwrap();
    assert_eq!(fetched.name, "b.txt");
    assert_eq!(fetched.parent_id.as_deref(), Some("A"));
    assert_eq!(fetched.quick_xor_hash.as_deref(), Some("H1"));
    assert!(fetched.kind.is_file());
    assert!(fetched.in_sync);
}

#[tokio::test]
async fn test_upsert_is_idempotent_and_updates() {
    let s = store().await;
    seed_tree(&s).await;

    let mut updated = item("b", Some("A"), "c.txt", ItemKind::File);
    updated.etag = Some("etag-2".to_string());
    s.upsert(&updated).await.unwrap();
    s.upsert(&updated).await.unwrap();

    let fetched = s.get(DRIVE, "b").await.unwrap().unwrap();
    assert_eq!(fetched.name, "c.txt");
    assert_eq!(fetched.etag.as_deref(), Some("etag-2"));
    assert_eq!(s.items_in_drive(DRIVE).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_remote_pointer_round_trip() {
    let s = store().await;
    let tie = Item {
        kind: ItemKind::Remote(RemotePointer {
            drive_id: "0123456789abcdef".to_string(),
            id: "T1".to_string(),
            parent_id: Some("TP".to_string()),
            is_directory: true,
        }),
        ..item("S1", Some("root"), "Shared", ItemKind::Unknown)
    };
    s.upsert(&item("root", None, "root", ItemKind::Root)).await.unwrap();
    s.upsert(&tie).await.unwrap();

    let fetched = s.get(DRIVE, "S1").await.unwrap().unwrap();
    match fetched.kind {
        ItemKind::Remote(ptr) => {
            assert_eq!(ptr.drive_id, "0123456789abcdef");
            assert_eq!(ptr.id, "T1");
            assert!(ptr.is_directory);
        }
        other => panic!("expected remote pointer, got {other:?}"),
    }

    let ties = s.find_ties("0123456789abcdef", "T1").await.unwrap();
    assert_eq!(ties.len(), 1);
    assert_eq!(ties[0].id, "S1");
}

#[tokio::test]
async fn test_delete_is_silent_when_absent() {
    let s = store().await;
    s.delete_by_id(DRIVE, "nothing").await.unwrap();

    seed_tree(&s).await;
    s.delete_by_id(DRIVE, "b").await.unwrap();
    assert!(s.get(DRIVE, "b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_by_path_walks_segments() {
    let s = store().await;
    seed_tree(&s).await;

    let found = s.get_by_path(DRIVE, "/A/b.txt").await.unwrap().unwrap();
    assert_eq!(found.id, "b");

    let root = s.get_by_path(DRIVE, "/").await.unwrap().unwrap();
    assert_eq!(root.id, "root");

    assert!(s.get_by_path(DRIVE, "/A/missing.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_compute_path() {
    let s = store().await;
    seed_tree(&s).await;

    assert_eq!(s.compute_path(DRIVE, "b").await.unwrap(), "/A/b.txt");
    assert_eq!(s.compute_path(DRIVE, "A").await.unwrap(), "/A");
    assert_eq!(s.compute_path(DRIVE, "root").await.unwrap(), "/");
}

#[tokio::test]
async fn test_compute_path_detects_cycle() {
    let s = store().await;
    // X and Y point at each other.
    s.upsert(&item("X", Some("Y"), "X", ItemKind::Dir)).await.unwrap();
    s.upsert(&item("Y", Some("X"), "Y", ItemKind::Dir)).await.unwrap();

    let err = s.compute_path(DRIVE, "X").await.unwrap_err();
    assert!(matches!(err, StoreError::Consistency(_)));
    assert!(err.to_string().contains("--resync"));
}

#[tokio::test]
async fn test_compute_path_detects_dangling_parent() {
    let s = store().await;
    s.upsert(&item("orphan", Some("ghost"), "o.txt", ItemKind::File))
        .await
        .unwrap();

    let err = s.compute_path(DRIVE, "orphan").await.unwrap_err();
    assert!(matches!(err, StoreError::Consistency(_)));
}

#[tokio::test]
async fn test_children_ordering() {
    let s = store().await;
    seed_tree(&s).await;
    s.upsert(&item("z", Some("A"), "z.txt", ItemKind::File)).await.unwrap();
    s.upsert(&item("a2", Some("A"), "a.txt", ItemKind::File)).await.unwrap();

    let children = s.children(DRIVE, "A").await.unwrap();
    let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "z.txt"]);
}

#[tokio::test]
async fn test_subtree_includes_all_descendants() {
    let s = store().await;
    seed_tree(&s).await;
    s.upsert(&item("A2", Some("A"), "nested", ItemKind::Dir)).await.unwrap();
    s.upsert(&item("deep", Some("A2"), "deep.txt", ItemKind::File))
        .await
        .unwrap();

    let subtree = s.subtree(DRIVE, "A").await.unwrap();
    let ids: Vec<_> = subtree.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(subtree.len(), 4);
    assert!(ids.contains(&"A") && ids.contains(&"b") && ids.contains(&"A2") && ids.contains(&"deep"));
}

#[tokio::test]
async fn test_downgrade_and_out_of_sync() {
    let s = store().await;
    seed_tree(&s).await;

    let touched = s.downgrade_sync_status(DRIVE, "A").await.unwrap();
    assert_eq!(touched, 2); // A and b

    let stale = s.out_of_sync_items(DRIVE).await.unwrap();
    assert_eq!(stale.len(), 2);

    s.mark_in_sync(DRIVE, "b").await.unwrap();
    let stale = s.out_of_sync_items(DRIVE).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, "A");
}

#[tokio::test]
async fn test_delta_token_lifecycle() {
    let s = store().await;
    assert!(s.get_delta_link(DRIVE, "root").await.unwrap().is_none());

    s.set_delta_link(DRIVE, "root", "token-1").await.unwrap();
    assert_eq!(
        s.get_delta_link(DRIVE, "root").await.unwrap().as_deref(),
        Some("token-1")
    );

    s.set_delta_link(DRIVE, "root", "token-2").await.unwrap();
    assert_eq!(
        s.get_delta_link(DRIVE, "root").await.unwrap().as_deref(),
        Some("token-2")
    );

    s.clear_delta_link(DRIVE, "root").await.unwrap();
    assert!(s.get_delta_link(DRIVE, "root").await.unwrap().is_none());
}

#[tokio::test]
async fn test_distinct_drive_ids() {
    let s = store().await;
    seed_tree(&s).await;
    let mut other = item("r2", None, "root", ItemKind::Root);
    other.drive_id = "0123456789abcdef".to_string();
    s.upsert(&other).await.unwrap();

    let drives = s.distinct_drive_ids().await.unwrap();
    assert_eq!(drives, vec!["0123456789abcdef".to_string(), DRIVE.to_string()]);
}

#[tokio::test]
async fn test_wipe_drops_everything() {
    let s = store().await;
    seed_tree(&s).await;
    s.set_delta_link(DRIVE, "root", "token").await.unwrap();

    s.wipe().await.unwrap();
    assert!(s.items_in_drive(DRIVE).await.unwrap().is_empty());
    assert!(s.get_delta_link(DRIVE, "root").await.unwrap().is_none());
}

#[tokio::test]
async fn test_checkpoint_is_callable() {
    let s = store().await;
    seed_tree(&s).await;
    s.checkpoint().await.unwrap();
}
