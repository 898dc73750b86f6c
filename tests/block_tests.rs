//! Block staging and commit tests.

mod common;

use common::{
    chunk, create_block_blob, create_container, ctx, ctx_at, no_lease, test_store, ACCOUNT,
};
use sqlblob::models::{BlobModel, BlobType, BlockListEntry, BlockListType, BlockModel};
use sqlblob::{BlobMetadataStore, ErrorCode, ExtentRefIterator};

fn staged(container: &str, blob: &str, name: &str, size: u64) -> BlockModel {
    BlockModel::new(
        ACCOUNT,
        container,
        blob,
        name,
        size,
        chunk(&format!("extent-{name}")),
    )
}

fn draft(container: &str, name: &str, at: i64) -> BlobModel {
    BlobModel::new(ACCOUNT, container, name, BlobType::BlockBlob, ctx_at(at).start_time)
}

#[tokio::test]
async fn stage_block_requires_container() {
    let store = test_store().await;
    let err = store
        .stage_block(&ctx(), staged("absent", "b", "A", 5), &no_lease())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ContainerNotFound);
}

#[tokio::test]
async fn staged_blocks_list_in_insertion_order() {
    let store = test_store().await;
    create_container(&store, "c").await;
    for (name, size) in [("B", 7), ("A", 5), ("C", 9)] {
        store
            .stage_block(&ctx(), staged("c", "b", name, size), &no_lease())
            .await
            .unwrap();
    }

    let list = store
        .get_block_list(&ctx_at(1), ACCOUNT, "c", "b", BlockListType::All, &no_lease())
        .await
        .unwrap();
    assert!(list.committed.is_empty());
    assert_eq!(
        list.uncommitted
            .iter()
            .map(|b| b.block_name.as_str())
            .collect::<Vec<_>>(),
        vec!["B", "A", "C"]
    );

    // Restaging an existing name replaces the payload in place.
    store
        .stage_block(&ctx_at(2), staged("c", "b", "A", 11), &no_lease())
        .await
        .unwrap();
    let list = store
        .get_block_list(&ctx_at(3), ACCOUNT, "c", "b", BlockListType::Uncommitted, &no_lease())
        .await
        .unwrap();
    let a = list
        .uncommitted
        .iter()
        .find(|b| b.block_name == "A")
        .unwrap();
    assert_eq!(a.size, 11);
}

#[tokio::test]
async fn commit_block_list_with_mixed_sources() {
    let store = test_store().await;
    create_container(&store, "c").await;

    store
        .stage_block(&ctx_at(0), staged("c", "b", "A", 5), &no_lease())
        .await
        .unwrap();
    store
        .stage_block(&ctx_at(1), staged("c", "b", "B", 7), &no_lease())
        .await
        .unwrap();

    // First commit takes only A from the staged set.
    let committed = store
        .commit_block_list(
            &ctx_at(2),
            draft("c", "b", 2),
            vec![BlockListEntry::new("A", "Uncommitted")],
            &no_lease(),
        )
        .await
        .unwrap();
    assert!(committed.is_committed);
    assert_eq!(committed.content.content_length, 5);
    assert_eq!(
        committed
            .committed_blocks
            .iter()
            .map(|b| b.name.as_str())
            .collect::<Vec<_>>(),
        vec!["A"]
    );

    // The commit tombstoned every staged block, including B.
    let list = store
        .get_block_list(&ctx_at(3), ACCOUNT, "c", "b", BlockListType::All, &no_lease())
        .await
        .unwrap();
    assert!(list.uncommitted.is_empty());

    // Stage B again and commit A (committed) + B (latest).
    store
        .stage_block(&ctx_at(4), staged("c", "b", "B", 7), &no_lease())
        .await
        .unwrap();
    let committed = store
        .commit_block_list(
            &ctx_at(5),
            draft("c", "b", 5),
            vec![
                BlockListEntry::new("A", "Committed"),
                BlockListEntry::new("B", "Latest"),
            ],
            &no_lease(),
        )
        .await
        .unwrap();
    assert_eq!(committed.content.content_length, 12);
    assert_eq!(
        committed
            .committed_blocks
            .iter()
            .map(|b| b.name.as_str())
            .collect::<Vec<_>>(),
        vec!["A", "B"]
    );

    let list = store
        .get_block_list(&ctx_at(6), ACCOUNT, "c", "b", BlockListType::All, &no_lease())
        .await
        .unwrap();
    assert!(list.uncommitted.is_empty());
    assert_eq!(list.committed.len(), 2);
}

#[tokio::test]
async fn commit_rejects_unknown_blocks_and_commit_types() {
    let store = test_store().await;
    create_container(&store, "c").await;
    store
        .stage_block(&ctx_at(0), staged("c", "b", "A", 5), &no_lease())
        .await
        .unwrap();

    let err = store
        .commit_block_list(
            &ctx_at(1),
            draft("c", "b", 1),
            vec![BlockListEntry::new("missing", "Latest")],
            &no_lease(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);

    // A staged-only block cannot be committed from the committed set.
    let err = store
        .commit_block_list(
            &ctx_at(2),
            draft("c", "b", 2),
            vec![BlockListEntry::new("A", "Committed")],
            &no_lease(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);

    let err = store
        .commit_block_list(
            &ctx_at(3),
            draft("c", "b", 3),
            vec![BlockListEntry::new("A", "Freshest")],
            &no_lease(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);

    // Failed commits leave the staged set untouched.
    let list = store
        .get_block_list(&ctx_at(4), ACCOUNT, "c", "b", BlockListType::All, &no_lease())
        .await
        .unwrap();
    assert_eq!(list.uncommitted.len(), 1);
}

#[tokio::test]
async fn block_list_for_unknown_blob_is_not_found() {
    let store = test_store().await;
    create_container(&store, "c").await;
    let err = store
        .get_block_list(&ctx(), ACCOUNT, "c", "ghost", BlockListType::All, &no_lease())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BlobNotFound);
}

#[tokio::test]
async fn extent_iterator_covers_blobs_and_staged_blocks() {
    let store = test_store().await;
    create_container(&store, "c").await;

    // Single-shot blob contributes its own chunk.
    create_block_blob(&store, "c", "single").await;

    // Block-committed blob contributes its committed block chunks.
    store
        .stage_block(&ctx_at(0), staged("c", "built", "A", 5), &no_lease())
        .await
        .unwrap();
    store
        .commit_block_list(
            &ctx_at(1),
            draft("c", "built", 1),
            vec![BlockListEntry::new("A", "Latest")],
            &no_lease(),
        )
        .await
        .unwrap();

    // A staged-but-uncommitted block is still referenced.
    store
        .stage_block(&ctx_at(2), staged("c", "pending", "P", 9), &no_lease())
        .await
        .unwrap();

    let mut iter = ExtentRefIterator::new(&store, Some(1));
    let mut ids = Vec::new();
    while let Some(batch) = iter.next_batch().await.unwrap() {
        ids.extend(batch.into_iter().map(|c| c.store_id));
    }
    ids.sort();
    assert_eq!(ids, vec!["extent-A", "extent-P", "extent-single"]);

    // Tombstoned rows drop out of the scan.
    store
        .delete_blob(&ctx_at(3), ACCOUNT, "c", "single", "", None, &no_lease())
        .await
        .unwrap();
    let mut iter = ExtentRefIterator::new(&store, None);
    let mut ids = Vec::new();
    while let Some(batch) = iter.next_batch().await.unwrap() {
        ids.extend(batch.into_iter().map(|c| c.store_id));
    }
    ids.sort();
    assert_eq!(ids, vec!["extent-A", "extent-P"]);
}

#[tokio::test]
async fn closed_store_rejects_operations() {
    let store = test_store().await;
    create_container(&store, "c").await;
    store.close().await.unwrap();

    let err = store
        .check_container_exists(&ctx(), ACCOUNT, "c")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StoreClosed);

    let err = store.close().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::StoreClosed);
}
