//! Common test utilities.
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use sqlblob::models::{BlobModel, BlobType, ContainerModel, PersistedChunk};
use sqlblob::{AccessConditions, BlobMetadataStore, OperationContext, SqlMetadataStore};

/// Default development account.
pub const ACCOUNT: &str = "devstoreaccount1";

/// Opens a fresh in-memory store with the schema applied.
pub async fn test_store() -> SqlMetadataStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqlMetadataStore::new(pool);
    store.init().await.unwrap();
    store
}

/// Fixed epoch all test clocks are offset from.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Context whose logical clock is `seconds` past the test epoch.
pub fn ctx_at(seconds: i64) -> OperationContext {
    OperationContext::at(base_time() + Duration::seconds(seconds))
}

pub fn ctx() -> OperationContext {
    ctx_at(0)
}

pub fn no_lease() -> AccessConditions {
    AccessConditions::none()
}

pub fn chunk(id: &str) -> PersistedChunk {
    PersistedChunk::new(id, 0, 3)
}

/// Creates a container named `name` under the default account.
pub async fn create_container(store: &SqlMetadataStore, name: &str) -> ContainerModel {
    let ctx = ctx();
    store
        .create_container(&ctx, ContainerModel::new(ACCOUNT, name, ctx.start_time))
        .await
        .unwrap()
}

/// Builds a committed single-shot block blob model.
pub fn block_blob(container: &str, name: &str, now: DateTime<Utc>) -> BlobModel {
    let mut blob = BlobModel::new(ACCOUNT, container, name, BlobType::BlockBlob, now);
    blob.is_committed = true;
    blob.content.content_length = 3;
    blob.content.content_type = Some("application/octet-stream".to_string());
    blob.persistency = Some(chunk(&format!("extent-{name}")));
    blob
}

/// Creates a committed single-shot block blob in the store.
pub async fn create_block_blob(store: &SqlMetadataStore, container: &str, name: &str) -> BlobModel {
    let ctx = ctx();
    store
        .create_blob(&ctx, block_blob(container, name, ctx.start_time), &no_lease())
        .await
        .unwrap()
}
