//! SQL implementation of the metadata store.
//!
//! Four tables back the store: `services`, `containers`, `blobs`, and
//! `blocks`. Nested values (lease, metadata, ACL, content properties,
//! committed block list, persistence chunks) are serialized as JSON text.
//! Every mutating operation runs inside one transaction; logical deletes
//! bump the `deleting` tombstone generation and leave physical removal to
//! an external sweep.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{Sqlite, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool, Transaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::DbConfig;
use crate::context::{snapshot_timestamp, OperationContext};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::Lease;
use crate::models::{
    AccessTier, BlobModel, BlobType, BlockCommitType, BlockListEntry, BlockListType, BlockModel,
    CommittedBlock, ContainerModel, ContentProperties, PublicAccessLevel, ServiceProperties,
    SignedIdentifier, MAX_CONTAINER_NAME_LENGTH,
};

use super::store::{
    AccessConditions, BlobMetadataStore, BlockList, DeleteSnapshotsOption, SetTierOutcome,
};

type Tx<'a> = Transaction<'a, Sqlite>;

/// Schema statements, executed in order on `init`. Idempotent.
const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS services (
        account_name            TEXT PRIMARY KEY,
        default_service_version TEXT,
        cors                    TEXT,
        logging                 TEXT,
        minute_metrics          TEXT,
        hour_metrics            TEXT,
        static_website          TEXT,
        delete_retention_policy TEXT
    )",
    "CREATE TABLE IF NOT EXISTS containers (
        container_id            INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name            TEXT NOT NULL,
        container_name          TEXT NOT NULL,
        last_modified           TEXT NOT NULL,
        etag                    TEXT NOT NULL,
        metadata                TEXT,
        container_acl           TEXT,
        public_access           TEXT,
        has_immutability_policy INTEGER NOT NULL DEFAULT 0,
        has_legal_hold          INTEGER NOT NULL DEFAULT 0,
        lease                   TEXT NOT NULL,
        UNIQUE (account_name, container_name)
    )",
    "CREATE TABLE IF NOT EXISTS blobs (
        blob_id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name            TEXT NOT NULL,
        container_name          TEXT NOT NULL,
        blob_name               TEXT NOT NULL,
        snapshot                TEXT NOT NULL DEFAULT '',
        deleting                INTEGER NOT NULL DEFAULT 0,
        blob_type               TEXT NOT NULL,
        is_committed            INTEGER NOT NULL,
        creation_time           TEXT NOT NULL,
        last_modified           TEXT NOT NULL,
        etag                    TEXT NOT NULL,
        content_properties      TEXT NOT NULL,
        access_tier             TEXT,
        access_tier_inferred    INTEGER NOT NULL DEFAULT 0,
        access_tier_change_time TEXT,
        blob_sequence_number    INTEGER,
        lease                   TEXT NOT NULL,
        persistency             TEXT,
        committed_blocks        TEXT,
        metadata                TEXT,
        UNIQUE (account_name, container_name, blob_name, snapshot, deleting)
    )",
    "CREATE TABLE IF NOT EXISTS blocks (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name   TEXT NOT NULL,
        container_name TEXT NOT NULL,
        blob_name      TEXT NOT NULL,
        block_name     TEXT NOT NULL,
        deleting       INTEGER NOT NULL DEFAULT 0,
        size           INTEGER NOT NULL,
        persistency    TEXT NOT NULL,
        UNIQUE (account_name, container_name, blob_name, block_name, deleting)
    )",
    "CREATE INDEX IF NOT EXISTS idx_blocks_blob
        ON blocks (account_name, container_name, blob_name, block_name)",
];

const CONTAINER_COLUMNS: &str = "container_id, account_name, container_name, last_modified, \
     etag, metadata, container_acl, public_access, has_immutability_policy, has_legal_hold, lease";

const BLOB_COLUMNS: &str = "blob_id, account_name, container_name, blob_name, snapshot, \
     deleting, blob_type, is_committed, creation_time, last_modified, etag, content_properties, \
     access_tier, access_tier_inferred, access_tier_change_time, blob_sequence_number, lease, \
     persistency, committed_blocks, metadata";

const BLOCK_COLUMNS: &str =
    "id, account_name, container_name, blob_name, block_name, deleting, size, persistency";

/// Metadata store backed by a SQLite connection pool.
pub struct SqlMetadataStore {
    pool: SqlitePool,
    closed: AtomicBool,
}

impl SqlMetadataStore {
    /// Wraps an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    /// Opens a pool for the given configuration.
    ///
    /// In-memory databases are clamped to a single connection so every
    /// operation observes the same database.
    pub async fn connect(config: &DbConfig) -> StorageResult<Self> {
        let max_connections = if config.is_in_memory() {
            1
        } else {
            config.max_connections
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&config.connection_uri())
            .await?;
        info!(uri = %config.connection_uri(), "connected metadata store");
        Ok(Self::new(pool))
    }

    /// Returns the underlying pool; used by the referenced-extent iterator.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::new(ErrorCode::StoreClosed));
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<Tx<'_>> {
        self.ensure_open()?;
        Ok(self.pool.begin().await?)
    }
}

// Row decoding ---------------------------------------------------------------

fn to_json<T: Serialize>(value: &T) -> StorageResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> StorageResult<T> {
    Ok(serde_json::from_str(raw)?)
}

fn json_opt<T: DeserializeOwned>(raw: Option<String>) -> StorageResult<Option<T>> {
    raw.as_deref().map(from_json).transpose()
}

fn json_or_default<T: DeserializeOwned + Default>(raw: Option<String>) -> StorageResult<T> {
    Ok(json_opt(raw)?.unwrap_or_default())
}

fn container_from_row(row: &SqliteRow) -> StorageResult<ContainerModel> {
    Ok(ContainerModel {
        container_id: Some(row.try_get("container_id")?),
        account: row.try_get("account_name")?,
        name: row.try_get("container_name")?,
        last_modified: row.try_get("last_modified")?,
        etag: row.try_get("etag")?,
        metadata: json_or_default(row.try_get("metadata")?)?,
        acl: json_or_default(row.try_get("container_acl")?)?,
        public_access: json_opt(row.try_get("public_access")?)?,
        has_immutability_policy: row.try_get("has_immutability_policy")?,
        has_legal_hold: row.try_get("has_legal_hold")?,
        lease: from_json(row.try_get::<String, _>("lease")?.as_str())?,
    })
}

fn blob_from_row(row: &SqliteRow) -> StorageResult<BlobModel> {
    let blob_type: String = row.try_get("blob_type")?;
    let access_tier: Option<String> = row.try_get("access_tier")?;
    Ok(BlobModel {
        blob_id: Some(row.try_get("blob_id")?),
        account: row.try_get("account_name")?,
        container: row.try_get("container_name")?,
        name: row.try_get("blob_name")?,
        snapshot: row.try_get("snapshot")?,
        deleting: row.try_get("deleting")?,
        blob_type: BlobType::parse(&blob_type).ok_or_else(|| {
            StorageError::with_message(
                ErrorCode::InternalError,
                format!("unknown blob type `{blob_type}` in store"),
            )
        })?,
        is_committed: row.try_get("is_committed")?,
        creation_time: row.try_get("creation_time")?,
        last_modified: row.try_get("last_modified")?,
        etag: row.try_get("etag")?,
        content: from_json(row.try_get::<String, _>("content_properties")?.as_str())?,
        access_tier: access_tier.as_deref().and_then(AccessTier::parse),
        access_tier_inferred: row.try_get("access_tier_inferred")?,
        access_tier_change_time: row.try_get("access_tier_change_time")?,
        sequence_number: row.try_get("blob_sequence_number")?,
        lease: from_json(row.try_get::<String, _>("lease")?.as_str())?,
        persistency: json_opt(row.try_get("persistency")?)?,
        committed_blocks: json_or_default(row.try_get("committed_blocks")?)?,
        metadata: json_or_default(row.try_get("metadata")?)?,
    })
}

fn block_from_row(row: &SqliteRow) -> StorageResult<BlockModel> {
    Ok(BlockModel {
        id: Some(row.try_get("id")?),
        account: row.try_get("account_name")?,
        container: row.try_get("container_name")?,
        blob: row.try_get("blob_name")?,
        block_name: row.try_get("block_name")?,
        deleting: row.try_get("deleting")?,
        size: row.try_get::<i64, _>("size")? as u64,
        persistency: from_json(row.try_get::<String, _>("persistency")?.as_str())?,
    })
}

/// Returns true if a SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn tag(ctx: &OperationContext, err: StorageError) -> StorageError {
    if err.request_id.is_none() {
        err.with_request_id(ctx.request_id.clone())
    } else {
        err
    }
}

// Shared statements -----------------------------------------------------------

async fn load_container(
    tx: &mut Tx<'_>,
    account: &str,
    name: &str,
) -> StorageResult<ContainerModel> {
    let sql = format!(
        "SELECT {CONTAINER_COLUMNS} FROM containers \
         WHERE account_name = ? AND container_name = ?"
    );
    let row = sqlx::query(&sql)
        .bind(account)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => container_from_row(&row),
        None => Err(StorageError::new(ErrorCode::ContainerNotFound)),
    }
}

/// Container existence is checked before touching any blob or block row.
async fn ensure_container(tx: &mut Tx<'_>, account: &str, name: &str) -> StorageResult<()> {
    let exists =
        sqlx::query("SELECT 1 FROM containers WHERE account_name = ? AND container_name = ?")
            .bind(account)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
    if exists.is_none() {
        return Err(StorageError::new(ErrorCode::ContainerNotFound));
    }
    Ok(())
}

async fn save_container(tx: &mut Tx<'_>, container: &ContainerModel) -> StorageResult<()> {
    sqlx::query(
        "UPDATE containers SET last_modified = ?, etag = ?, metadata = ?, container_acl = ?, \
         public_access = ?, has_immutability_policy = ?, has_legal_hold = ?, lease = ? \
         WHERE container_id = ?",
    )
    .bind(container.last_modified)
    .bind(&container.etag)
    .bind(to_json(&container.metadata)?)
    .bind(to_json(&container.acl)?)
    .bind(container.public_access.map(|p| to_json(&p)).transpose()?)
    .bind(container.has_immutability_policy)
    .bind(container.has_legal_hold)
    .bind(to_json(&container.lease)?)
    .bind(container.container_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Loads the live (deleting = 0) row for `(name, snapshot)`.
async fn load_live_blob(
    tx: &mut Tx<'_>,
    account: &str,
    container: &str,
    name: &str,
    snapshot: &str,
) -> StorageResult<Option<BlobModel>> {
    let sql = format!(
        "SELECT {BLOB_COLUMNS} FROM blobs \
         WHERE account_name = ? AND container_name = ? AND blob_name = ? \
           AND snapshot = ? AND deleting = 0"
    );
    let row = sqlx::query(&sql)
        .bind(account)
        .bind(container)
        .bind(name)
        .bind(snapshot)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(blob_from_row).transpose()
}

async fn upsert_blob(tx: &mut Tx<'_>, blob: &BlobModel) -> StorageResult<i64> {
    let result = sqlx::query(
        "INSERT INTO blobs (account_name, container_name, blob_name, snapshot, deleting, \
             blob_type, is_committed, creation_time, last_modified, etag, content_properties, \
             access_tier, access_tier_inferred, access_tier_change_time, blob_sequence_number, \
             lease, persistency, committed_blocks, metadata) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (account_name, container_name, blob_name, snapshot, deleting) DO UPDATE SET \
             blob_type = excluded.blob_type, \
             is_committed = excluded.is_committed, \
             creation_time = excluded.creation_time, \
             last_modified = excluded.last_modified, \
             etag = excluded.etag, \
             content_properties = excluded.content_properties, \
             access_tier = excluded.access_tier, \
             access_tier_inferred = excluded.access_tier_inferred, \
             access_tier_change_time = excluded.access_tier_change_time, \
             blob_sequence_number = excluded.blob_sequence_number, \
             lease = excluded.lease, \
             persistency = excluded.persistency, \
             committed_blocks = excluded.committed_blocks, \
             metadata = excluded.metadata",
    )
    .bind(&blob.account)
    .bind(&blob.container)
    .bind(&blob.name)
    .bind(&blob.snapshot)
    .bind(blob.deleting)
    .bind(blob.blob_type.as_str())
    .bind(blob.is_committed)
    .bind(blob.creation_time)
    .bind(blob.last_modified)
    .bind(&blob.etag)
    .bind(to_json(&blob.content)?)
    .bind(blob.access_tier.map(|t| t.as_str()))
    .bind(blob.access_tier_inferred)
    .bind(blob.access_tier_change_time)
    .bind(blob.sequence_number)
    .bind(to_json(&blob.lease)?)
    .bind(blob.persistency.as_ref().map(to_json).transpose()?)
    .bind(to_json(&blob.committed_blocks)?)
    .bind(to_json(&blob.metadata)?)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn save_blob(tx: &mut Tx<'_>, blob: &BlobModel) -> StorageResult<()> {
    sqlx::query(
        "UPDATE blobs SET is_committed = ?, creation_time = ?, last_modified = ?, etag = ?, \
             content_properties = ?, access_tier = ?, access_tier_inferred = ?, \
             access_tier_change_time = ?, blob_sequence_number = ?, lease = ?, persistency = ?, \
             committed_blocks = ?, metadata = ? \
         WHERE blob_id = ?",
    )
    .bind(blob.is_committed)
    .bind(blob.creation_time)
    .bind(blob.last_modified)
    .bind(&blob.etag)
    .bind(to_json(&blob.content)?)
    .bind(blob.access_tier.map(|t| t.as_str()))
    .bind(blob.access_tier_inferred)
    .bind(blob.access_tier_change_time)
    .bind(blob.sequence_number)
    .bind(to_json(&blob.lease)?)
    .bind(blob.persistency.as_ref().map(to_json).transpose()?)
    .bind(to_json(&blob.committed_blocks)?)
    .bind(to_json(&blob.metadata)?)
    .bind(blob.blob_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn save_blob_lease(tx: &mut Tx<'_>, blob_id: Option<i64>, lease: &Lease) -> StorageResult<()> {
    sqlx::query("UPDATE blobs SET lease = ? WHERE blob_id = ?")
        .bind(to_json(lease)?)
        .bind(blob_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Tombstones live blob rows selected by the extra predicate. The new
/// generation is one past the highest existing generation for the row's
/// identity, so repeated logical deletes coexist under the unique index.
async fn tombstone_blobs(
    tx: &mut Tx<'_>,
    account: &str,
    container: &str,
    blob_name: Option<&str>,
    snapshot_predicate: &str,
) -> StorageResult<u64> {
    let mut sql = String::from(
        "UPDATE blobs SET deleting = (
            SELECT IFNULL(MAX(d.deleting), 0) + 1 FROM blobs AS d
            WHERE d.account_name = blobs.account_name
              AND d.container_name = blobs.container_name
              AND d.blob_name = blobs.blob_name
              AND d.snapshot = blobs.snapshot
        ) WHERE account_name = ? AND container_name = ? AND deleting = 0",
    );
    if blob_name.is_some() {
        sql.push_str(" AND blob_name = ?");
    }
    sql.push_str(snapshot_predicate);

    let mut query = sqlx::query(&sql).bind(account).bind(container);
    if let Some(name) = blob_name {
        query = query.bind(name);
    }
    Ok(query.execute(&mut **tx).await?.rows_affected())
}

/// Tombstones live block rows, optionally restricted to one blob.
async fn tombstone_blocks(
    tx: &mut Tx<'_>,
    account: &str,
    container: &str,
    blob_name: Option<&str>,
) -> StorageResult<u64> {
    let mut sql = String::from(
        "UPDATE blocks SET deleting = (
            SELECT IFNULL(MAX(d.deleting), 0) + 1 FROM blocks AS d
            WHERE d.account_name = blocks.account_name
              AND d.container_name = blocks.container_name
              AND d.blob_name = blocks.blob_name
              AND d.block_name = blocks.block_name
        ) WHERE account_name = ? AND container_name = ? AND deleting = 0",
    );
    if blob_name.is_some() {
        sql.push_str(" AND blob_name = ?");
    }

    let mut query = sqlx::query(&sql).bind(account).bind(container);
    if let Some(name) = blob_name {
        query = query.bind(name);
    }
    Ok(query.execute(&mut **tx).await?.rows_affected())
}

async fn load_staged_blocks(
    tx: &mut Tx<'_>,
    account: &str,
    container: &str,
    blob: &str,
) -> StorageResult<Vec<BlockModel>> {
    let sql = format!(
        "SELECT {BLOCK_COLUMNS} FROM blocks \
         WHERE account_name = ? AND container_name = ? AND blob_name = ? AND deleting = 0 \
         ORDER BY id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(account)
        .bind(container)
        .bind(blob)
        .fetch_all(&mut **tx)
        .await?;
    rows.iter().map(block_from_row).collect()
}

impl SqlMetadataStore {
    /// Loads the live committed blob or fails with `BlobNotFound`, then
    /// applies the read gate against the projected lease.
    async fn read_blob(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        let mut tx = self.begin().await?;
        let result: StorageResult<BlobModel> = async {
            ensure_container(&mut tx, account, container).await?;
            let mut blob = load_live_blob(&mut tx, account, container, blob, snapshot)
                .await?
                .filter(|b| b.is_committed)
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
            blob.lease = blob.lease.project(ctx.start_time);
            blob.lease.validate_read(access.lease_id())?;
            Ok(blob)
        }
        .await;
        result.map_err(|e| tag(ctx, e))
    }

    /// Shared skeleton for blob lease operations: load the live committed
    /// base blob, project its lease, apply `op`, persist, commit.
    async fn with_blob_lease<F>(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        op: F,
    ) -> StorageResult<(BlobModel, i64)>
    where
        F: FnOnce(&Lease) -> StorageResult<(Lease, i64)>,
    {
        let mut tx = self.begin().await?;
        let result: StorageResult<(BlobModel, i64)> = async {
            ensure_container(&mut tx, account, container).await?;
            let mut model = load_live_blob(&mut tx, account, container, blob, "")
                .await?
                .filter(|b| b.is_committed)
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
            let projected = model.lease.project(ctx.start_time);
            let (lease, lease_time) = op(&projected)?;
            model.lease = lease;
            save_blob_lease(&mut tx, model.blob_id, &model.lease).await?;
            Ok((model, lease_time))
        }
        .await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    /// Shared skeleton for container lease operations.
    async fn with_container_lease<F>(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        op: F,
    ) -> StorageResult<(ContainerModel, i64)>
    where
        F: FnOnce(&Lease) -> StorageResult<(Lease, i64)>,
    {
        let mut tx = self.begin().await?;
        let result: StorageResult<(ContainerModel, i64)> = async {
            let mut model = load_container(&mut tx, account, container).await?;
            let projected = model.lease.project(ctx.start_time);
            let (lease, lease_time) = op(&projected)?;
            model.lease = lease;
            sqlx::query("UPDATE containers SET lease = ? WHERE container_id = ?")
                .bind(to_json(&model.lease)?)
                .bind(model.container_id)
                .execute(&mut *tx)
                .await?;
            Ok((model, lease_time))
        }
        .await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    /// Shared skeleton for mutating container operations: load, project,
    /// write-gate, apply `mutate`, stamp a fresh etag, persist.
    async fn mutate_container<F>(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
        mutate: F,
    ) -> StorageResult<ContainerModel>
    where
        F: FnOnce(&mut ContainerModel),
    {
        let mut tx = self.begin().await?;
        let result: StorageResult<ContainerModel> = async {
            let mut model = load_container(&mut tx, account, container).await?;
            model.lease = model.lease.project(ctx.start_time);
            model.lease.validate_write(access.lease_id())?;
            mutate(&mut model);
            model.touch(ctx.start_time);
            save_container(&mut tx, &model).await?;
            Ok(model)
        }
        .await;
        match result {
            Ok(model) => {
                tx.commit().await?;
                Ok(model)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    /// Shared skeleton for mutating operations on the live committed base
    /// blob: load, project, write-gate, apply `mutate`, collapse an
    /// expired/broken lease, persist.
    async fn mutate_blob<F>(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        access: &AccessConditions,
        mutate: F,
    ) -> StorageResult<BlobModel>
    where
        F: FnOnce(&mut BlobModel),
    {
        let mut tx = self.begin().await?;
        let result: StorageResult<BlobModel> = async {
            ensure_container(&mut tx, account, container).await?;
            let mut model = load_live_blob(&mut tx, account, container, blob, "")
                .await?
                .filter(|b| b.is_committed)
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
            let projected = model.lease.project(ctx.start_time);
            projected.validate_write(access.lease_id())?;
            model.lease = projected.collapse_after_write();
            mutate(&mut model);
            save_blob(&mut tx, &model).await?;
            Ok(model)
        }
        .await;
        match result {
            Ok(model) => {
                tx.commit().await?;
                Ok(model)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }
}

#[async_trait]
impl BlobMetadataStore for SqlMetadataStore {
    async fn init(&self) -> StorageResult<()> {
        self.ensure_open()?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("metadata schema synchronized");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close().await;
        info!("metadata store closed");
        Ok(())
    }

    async fn get_service_properties(
        &self,
        ctx: &OperationContext,
        account: &str,
    ) -> StorageResult<Option<ServiceProperties>> {
        self.ensure_open()?;
        let row = sqlx::query("SELECT * FROM services WHERE account_name = ?")
            .bind(account)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let properties: StorageResult<ServiceProperties> = (|| {
            Ok(ServiceProperties {
                account_name: row.try_get("account_name")?,
                default_service_version: row.try_get("default_service_version")?,
                cors: json_opt(row.try_get("cors")?)?,
                logging: json_opt(row.try_get("logging")?)?,
                minute_metrics: json_opt(row.try_get("minute_metrics")?)?,
                hour_metrics: json_opt(row.try_get("hour_metrics")?)?,
                static_website: json_opt(row.try_get("static_website")?)?,
                delete_retention_policy: json_opt(row.try_get("delete_retention_policy")?)?,
            })
        })();
        properties.map(Some).map_err(|e| tag(ctx, e))
    }

    async fn set_service_properties(
        &self,
        ctx: &OperationContext,
        properties: ServiceProperties,
    ) -> StorageResult<ServiceProperties> {
        let account = properties.account_name.clone();
        let existing = self.get_service_properties(ctx, &account).await?;
        let merged = match existing {
            Some(stored) => stored.merged_with(properties),
            None => properties,
        };

        let result: StorageResult<()> = async {
            sqlx::query(
                "INSERT INTO services (account_name, default_service_version, cors, logging, \
                     minute_metrics, hour_metrics, static_website, delete_retention_policy) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (account_name) DO UPDATE SET \
                     default_service_version = excluded.default_service_version, \
                     cors = excluded.cors, \
                     logging = excluded.logging, \
                     minute_metrics = excluded.minute_metrics, \
                     hour_metrics = excluded.hour_metrics, \
                     static_website = excluded.static_website, \
                     delete_retention_policy = excluded.delete_retention_policy",
            )
            .bind(&merged.account_name)
            .bind(&merged.default_service_version)
            .bind(merged.cors.as_ref().map(to_json).transpose()?)
            .bind(merged.logging.as_ref().map(to_json).transpose()?)
            .bind(merged.minute_metrics.as_ref().map(to_json).transpose()?)
            .bind(merged.hour_metrics.as_ref().map(to_json).transpose()?)
            .bind(merged.static_website.as_ref().map(to_json).transpose()?)
            .bind(merged.delete_retention_policy.as_ref().map(to_json).transpose()?)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .await;
        result.map_err(|e| tag(ctx, e))?;
        Ok(merged)
    }

    async fn list_containers(
        &self,
        ctx: &OperationContext,
        account: &str,
        prefix: &str,
        max_results: u32,
        marker: Option<i64>,
    ) -> StorageResult<(Vec<ContainerModel>, Option<i64>)> {
        self.ensure_open()?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE account_name = "
        ));
        builder.push_bind(account);
        if !prefix.is_empty() {
            builder.push(" AND container_name LIKE ");
            builder.push_bind(format!("{prefix}%"));
        }
        if let Some(marker) = marker {
            builder.push(" AND container_id > ");
            builder.push_bind(marker);
        }
        builder.push(" ORDER BY container_id ASC LIMIT ");
        builder.push_bind(max_results as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let containers = rows
            .iter()
            .map(container_from_row)
            .collect::<StorageResult<Vec<_>>>()
            .map_err(|e| tag(ctx, e))?;

        let next_marker = if containers.len() as u32 == max_results {
            containers.last().and_then(|c| c.container_id)
        } else {
            None
        };
        Ok((containers, next_marker))
    }

    async fn create_container(
        &self,
        ctx: &OperationContext,
        mut container: ContainerModel,
    ) -> StorageResult<ContainerModel> {
        self.ensure_open()?;
        if container.name.is_empty() || container.name.len() > MAX_CONTAINER_NAME_LENGTH {
            return Err(tag(ctx, StorageError::new(ErrorCode::InvalidResourceName)));
        }

        let insert = sqlx::query(
            "INSERT INTO containers (account_name, container_name, last_modified, etag, \
                 metadata, container_acl, public_access, has_immutability_policy, \
                 has_legal_hold, lease) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&container.account)
        .bind(&container.name)
        .bind(container.last_modified)
        .bind(&container.etag)
        .bind(to_json(&container.metadata).map_err(|e| tag(ctx, e))?)
        .bind(to_json(&container.acl).map_err(|e| tag(ctx, e))?)
        .bind(
            container
                .public_access
                .map(|p| to_json(&p))
                .transpose()
                .map_err(|e| tag(ctx, e))?,
        )
        .bind(container.has_immutability_policy)
        .bind(container.has_legal_hold)
        .bind(to_json(&container.lease).map_err(|e| tag(ctx, e))?)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(result) => {
                container.container_id = Some(result.last_insert_rowid());
                debug!(account = %container.account, container = %container.name, "container created");
                Ok(container)
            }
            Err(err) if is_unique_violation(&err) => Err(tag(
                ctx,
                StorageError::new(ErrorCode::ContainerAlreadyExists),
            )),
            Err(err) => Err(tag(ctx, err.into())),
        }
    }

    async fn get_container_properties(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel> {
        let mut tx = self.begin().await?;
        let result: StorageResult<ContainerModel> = async {
            let mut model = load_container(&mut tx, account, container).await?;
            model.lease = model.lease.project(ctx.start_time);
            model.lease.validate_read(access.lease_id())?;
            Ok(model)
        }
        .await;
        result.map_err(|e| tag(ctx, e))
    }

    async fn get_container_acl(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel> {
        self.get_container_properties(ctx, account, container, access)
            .await
    }

    async fn set_container_metadata(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        metadata: HashMap<String, String>,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel> {
        self.mutate_container(ctx, account, container, access, |model| {
            model.metadata = metadata;
        })
        .await
    }

    async fn set_container_acl(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        acl: Vec<SignedIdentifier>,
        public_access: Option<PublicAccessLevel>,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel> {
        self.mutate_container(ctx, account, container, access, |model| {
            model.acl = acl;
            model.public_access = public_access;
        })
        .await
    }

    async fn delete_container(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let result: StorageResult<()> = async {
            let model = load_container(&mut tx, account, container).await?;
            let projected = model.lease.project(ctx.start_time);
            projected.validate_write(access.lease_id())?;

            sqlx::query("DELETE FROM containers WHERE container_id = ?")
                .bind(model.container_id)
                .execute(&mut *tx)
                .await?;
            let blobs = tombstone_blobs(&mut tx, account, container, None, "").await?;
            let blocks = tombstone_blocks(&mut tx, account, container, None).await?;
            debug!(
                account,
                container, blobs, blocks, "container deleted, children tombstoned"
            );
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    async fn check_container_exists(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let exists =
            sqlx::query("SELECT 1 FROM containers WHERE account_name = ? AND container_name = ?")
                .bind(account)
                .bind(container)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(tag(ctx, StorageError::new(ErrorCode::ContainerNotFound)));
        }
        Ok(())
    }

    async fn acquire_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        duration: i64,
        proposed_id: Option<&str>,
    ) -> StorageResult<ContainerModel> {
        let now = ctx.start_time;
        let (model, _) = self
            .with_container_lease(ctx, account, container, |lease| {
                lease.acquire(now, duration, proposed_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn release_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        lease_id: &str,
    ) -> StorageResult<ContainerModel> {
        let (model, _) = self
            .with_container_lease(ctx, account, container, |lease| {
                lease.release(lease_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn renew_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        lease_id: &str,
    ) -> StorageResult<ContainerModel> {
        let now = ctx.start_time;
        let (model, _) = self
            .with_container_lease(ctx, account, container, |lease| {
                lease.renew(now, lease_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn change_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        lease_id: &str,
        proposed_id: &str,
    ) -> StorageResult<ContainerModel> {
        let (model, _) = self
            .with_container_lease(ctx, account, container, |lease| {
                lease.change(lease_id, proposed_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn break_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        break_period: Option<i64>,
    ) -> StorageResult<(ContainerModel, i64)> {
        let now = ctx.start_time;
        self.with_container_lease(ctx, account, container, |lease| {
            lease.break_lease(now, break_period)
        })
        .await
    }

    async fn create_blob(
        &self,
        ctx: &OperationContext,
        mut blob: BlobModel,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        let mut tx = self.begin().await?;
        let result: StorageResult<BlobModel> = async {
            ensure_container(&mut tx, &blob.account, &blob.container).await?;

            let existing =
                load_live_blob(&mut tx, &blob.account, &blob.container, &blob.name, &blob.snapshot)
                    .await?;
            if let Some(existing) = existing {
                let projected = existing.lease.project(ctx.start_time);
                projected.validate_write(access.lease_id())?;
                if existing.access_tier == Some(AccessTier::Archive) {
                    return Err(StorageError::new(ErrorCode::BlobArchived));
                }
                // Overwriting does not disturb an active lease.
                blob.lease = projected.collapse_after_write();
                blob.last_modified = blob.last_modified.max(existing.last_modified);
                blob.blob_id = existing.blob_id;
            }

            let id = upsert_blob(&mut tx, &blob).await?;
            blob.blob_id = blob.blob_id.or(Some(id));
            Ok(blob)
        }
        .await;
        match result {
            Ok(blob) => {
                tx.commit().await?;
                Ok(blob)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    async fn download_blob(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        self.read_blob(ctx, account, container, blob, snapshot, access)
            .await
    }

    async fn get_blob_properties(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        self.read_blob(ctx, account, container, blob, snapshot, access)
            .await
    }

    async fn list_blobs(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        prefix: &str,
        max_results: u32,
        marker: Option<&str>,
        include_snapshots: bool,
    ) -> StorageResult<(Vec<BlobModel>, Option<String>)> {
        let mut tx = self.begin().await?;
        let result: StorageResult<(Vec<BlobModel>, Option<String>)> = async {
            ensure_container(&mut tx, account, container).await?;

            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {BLOB_COLUMNS} FROM blobs WHERE account_name = "
            ));
            builder.push_bind(account);
            builder.push(" AND container_name = ");
            builder.push_bind(container);
            builder.push(" AND deleting = 0 AND is_committed = 1");
            if !prefix.is_empty() {
                builder.push(" AND blob_name LIKE ");
                builder.push_bind(format!("{prefix}%"));
            }
            if let Some(marker) = marker {
                builder.push(" AND blob_name > ");
                builder.push_bind(marker.to_string());
            }
            if !include_snapshots {
                builder.push(" AND snapshot = ''");
            }
            builder.push(" ORDER BY blob_name ASC, snapshot ASC LIMIT ");
            // Over-fetch by one to detect whether more results exist.
            builder.push_bind(max_results as i64 + 1);

            let rows = builder.build().fetch_all(&mut *tx).await?;
            let mut blobs = rows
                .iter()
                .map(blob_from_row)
                .collect::<StorageResult<Vec<_>>>()?;

            let next_marker = if blobs.len() as u32 > max_results {
                blobs.truncate(max_results as usize);
                blobs.last().map(|b| b.name.clone())
            } else {
                None
            };
            Ok((blobs, next_marker))
        }
        .await;
        result.map_err(|e| tag(ctx, e))
    }

    async fn list_all_blobs(
        &self,
        max_results: u32,
        marker: Option<i64>,
        include_snapshots: bool,
        include_uncommitted: bool,
    ) -> StorageResult<(Vec<BlobModel>, Option<i64>)> {
        self.ensure_open()?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BLOB_COLUMNS} FROM blobs WHERE deleting = 0"
        ));
        if let Some(marker) = marker {
            builder.push(" AND blob_id > ");
            builder.push_bind(marker);
        }
        if !include_snapshots {
            builder.push(" AND snapshot = ''");
        }
        if !include_uncommitted {
            builder.push(" AND is_committed = 1");
        }
        builder.push(" ORDER BY blob_id ASC LIMIT ");
        builder.push_bind(max_results as i64 + 1);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut blobs = rows
            .iter()
            .map(blob_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        let next_marker = if blobs.len() as u32 > max_results {
            blobs.truncate(max_results as usize);
            blobs.last().and_then(|b| b.blob_id)
        } else {
            None
        };
        Ok((blobs, next_marker))
    }

    async fn set_blob_http_headers(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        content: ContentProperties,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        let now = ctx.start_time;
        self.mutate_blob(ctx, account, container, blob, access, |model| {
            let length = model.content.content_length;
            model.content = content;
            model.content.content_length = length;
            model.touch(now);
        })
        .await
    }

    async fn set_blob_metadata(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        metadata: HashMap<String, String>,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        let now = ctx.start_time;
        self.mutate_blob(ctx, account, container, blob, access, |model| {
            model.metadata = metadata;
            model.touch(now);
        })
        .await
    }

    async fn create_snapshot(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        metadata: Option<HashMap<String, String>>,
        access: &AccessConditions,
    ) -> StorageResult<(String, BlobModel)> {
        let mut tx = self.begin().await?;
        let result: StorageResult<(String, BlobModel)> = async {
            ensure_container(&mut tx, account, container).await?;
            let base = load_live_blob(&mut tx, account, container, blob, "")
                .await?
                .filter(|b| b.is_committed)
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
            base.lease
                .project(ctx.start_time)
                .validate_read(access.lease_id())?;

            let snapshot = snapshot_timestamp(&ctx.start_time);
            let mut copy = base.to_snapshot(snapshot.clone());
            if let Some(metadata) = metadata {
                copy.metadata = metadata;
            }
            let id = upsert_blob(&mut tx, &copy).await?;
            copy.blob_id = Some(id);
            Ok((snapshot, copy))
        }
        .await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    async fn delete_blob(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        delete_snapshots: Option<DeleteSnapshotsOption>,
        access: &AccessConditions,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let result: StorageResult<()> = async {
            ensure_container(&mut tx, account, container).await?;
            let target = load_live_blob(&mut tx, account, container, blob, snapshot)
                .await?
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;

            if target.is_base_blob() {
                target
                    .lease
                    .project(ctx.start_time)
                    .validate_write(access.lease_id())?;

                let snapshot_count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM blobs WHERE account_name = ? AND container_name = ? \
                     AND blob_name = ? AND snapshot != '' AND deleting = 0",
                )
                .bind(account)
                .bind(container)
                .bind(blob)
                .fetch_one(&mut *tx)
                .await?;

                match delete_snapshots {
                    None if snapshot_count > 0 => {
                        return Err(StorageError::new(ErrorCode::SnapshotsPresent));
                    }
                    None | Some(DeleteSnapshotsOption::Include) => {
                        tombstone_blobs(&mut tx, account, container, Some(blob), "").await?;
                        tombstone_blocks(&mut tx, account, container, Some(blob)).await?;
                    }
                    Some(DeleteSnapshotsOption::Only) => {
                        tombstone_blobs(&mut tx, account, container, Some(blob), " AND snapshot != ''")
                            .await?;
                    }
                }
            } else {
                if delete_snapshots.is_some() {
                    return Err(StorageError::with_message(
                        ErrorCode::InvalidOperation,
                        "a snapshot delete cannot itself specify snapshot handling",
                    ));
                }
                sqlx::query(
                    "UPDATE blobs SET deleting = (
                        SELECT IFNULL(MAX(d.deleting), 0) + 1 FROM blobs AS d
                        WHERE d.account_name = blobs.account_name
                          AND d.container_name = blobs.container_name
                          AND d.blob_name = blobs.blob_name
                          AND d.snapshot = blobs.snapshot
                    ) WHERE blob_id = ?",
                )
                .bind(target.blob_id)
                .execute(&mut *tx)
                .await?;
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                debug!(account, container, blob, snapshot, "blob deleted");
                Ok(())
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    async fn set_tier(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        tier: AccessTier,
        access: &AccessConditions,
    ) -> StorageResult<SetTierOutcome> {
        let mut tx = self.begin().await?;
        let result: StorageResult<SetTierOutcome> = async {
            ensure_container(&mut tx, account, container).await?;
            if !snapshot.is_empty() {
                return Err(StorageError::new(ErrorCode::BlobSnapshotsPresent));
            }
            let mut model = load_live_blob(&mut tx, account, container, blob, "")
                .await?
                .filter(|b| b.is_committed)
                .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
            let projected = model.lease.project(ctx.start_time);
            projected.validate_write(access.lease_id())?;
            if model.blob_type != BlobType::BlockBlob {
                return Err(StorageError::new(ErrorCode::InvalidBlobType));
            }

            let outcome = match model.access_tier {
                Some(AccessTier::Archive) if tier != AccessTier::Archive => {
                    SetTierOutcome::RehydrationPending
                }
                _ => SetTierOutcome::Updated,
            };

            model.lease = projected.collapse_after_write();
            model.access_tier = Some(tier);
            model.access_tier_inferred = false;
            model.access_tier_change_time = Some(ctx.start_time);
            save_blob(&mut tx, &model).await?;
            Ok(outcome)
        }
        .await;
        match result {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    async fn get_blob_type(
        &self,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
    ) -> StorageResult<Option<(BlobType, bool)>> {
        self.ensure_open()?;
        let row = sqlx::query(
            "SELECT blob_type, is_committed FROM blobs \
             WHERE account_name = ? AND container_name = ? AND blob_name = ? \
               AND snapshot = ? AND deleting = 0",
        )
        .bind(account)
        .bind(container)
        .bind(blob)
        .bind(snapshot)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let raw: String = row.try_get("blob_type")?;
            let blob_type = BlobType::parse(&raw).ok_or_else(|| {
                StorageError::with_message(
                    ErrorCode::InternalError,
                    format!("unknown blob type `{raw}` in store"),
                )
            })?;
            Ok((blob_type, row.try_get("is_committed")?))
        })
        .transpose()
    }

    async fn acquire_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        duration: i64,
        proposed_id: Option<&str>,
    ) -> StorageResult<BlobModel> {
        if !snapshot.is_empty() {
            return Err(tag(ctx, StorageError::new(ErrorCode::BlobSnapshotsPresent)));
        }
        let now = ctx.start_time;
        let (model, _) = self
            .with_blob_lease(ctx, account, container, blob, |lease| {
                lease.acquire(now, duration, proposed_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn release_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        lease_id: &str,
    ) -> StorageResult<BlobModel> {
        let (model, _) = self
            .with_blob_lease(ctx, account, container, blob, |lease| {
                lease.release(lease_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn renew_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        lease_id: &str,
    ) -> StorageResult<BlobModel> {
        let now = ctx.start_time;
        let (model, _) = self
            .with_blob_lease(ctx, account, container, blob, |lease| {
                lease.renew(now, lease_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn change_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        lease_id: &str,
        proposed_id: &str,
    ) -> StorageResult<BlobModel> {
        let (model, _) = self
            .with_blob_lease(ctx, account, container, blob, |lease| {
                lease.change(lease_id, proposed_id).map(|l| (l, 0))
            })
            .await?;
        Ok(model)
    }

    async fn break_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        break_period: Option<i64>,
    ) -> StorageResult<(BlobModel, i64)> {
        let now = ctx.start_time;
        self.with_blob_lease(ctx, account, container, blob, |lease| {
            lease.break_lease(now, break_period)
        })
        .await
    }

    async fn stage_block(
        &self,
        ctx: &OperationContext,
        block: BlockModel,
        access: &AccessConditions,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let result: StorageResult<()> = async {
            ensure_container(&mut tx, &block.account, &block.container).await?;
            if let Some(existing) =
                load_live_blob(&mut tx, &block.account, &block.container, &block.blob, "").await?
            {
                existing
                    .lease
                    .project(ctx.start_time)
                    .validate_write(access.lease_id())?;
            }

            sqlx::query(
                "INSERT INTO blocks (account_name, container_name, blob_name, block_name, \
                     deleting, size, persistency) \
                 VALUES (?, ?, ?, ?, 0, ?, ?) \
                 ON CONFLICT (account_name, container_name, blob_name, block_name, deleting) \
                 DO UPDATE SET size = excluded.size, persistency = excluded.persistency",
            )
            .bind(&block.account)
            .bind(&block.container)
            .bind(&block.blob)
            .bind(&block.block_name)
            .bind(block.size as i64)
            .bind(to_json(&block.persistency)?)
            .execute(&mut *tx)
            .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }

    async fn get_block_list(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        list_type: BlockListType,
        access: &AccessConditions,
    ) -> StorageResult<BlockList> {
        let mut tx = self.begin().await?;
        let result: StorageResult<BlockList> = async {
            ensure_container(&mut tx, account, container).await?;
            let live = load_live_blob(&mut tx, account, container, blob, "").await?;
            if let Some(ref live) = live {
                live.lease
                    .project(ctx.start_time)
                    .validate_read(access.lease_id())?;
            }
            let staged = load_staged_blocks(&mut tx, account, container, blob).await?;
            if live.is_none() && staged.is_empty() {
                return Err(StorageError::new(ErrorCode::BlobNotFound));
            }

            let committed = match list_type {
                BlockListType::Uncommitted => Vec::new(),
                _ => live.map(|b| b.committed_blocks).unwrap_or_default(),
            };
            let uncommitted = match list_type {
                BlockListType::Committed => Vec::new(),
                _ => staged,
            };
            Ok(BlockList {
                committed,
                uncommitted,
            })
        }
        .await;
        result.map_err(|e| tag(ctx, e))
    }

    async fn commit_block_list(
        &self,
        ctx: &OperationContext,
        blob: BlobModel,
        block_list: Vec<BlockListEntry>,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel> {
        let mut tx = self.begin().await?;
        let result: StorageResult<BlobModel> = async {
            ensure_container(&mut tx, &blob.account, &blob.container).await?;

            let existing =
                load_live_blob(&mut tx, &blob.account, &blob.container, &blob.name, &blob.snapshot)
                    .await?;
            let mut committed_by_name: HashMap<String, CommittedBlock> = HashMap::new();
            let mut lease = Lease::available();
            let mut creation_time = ctx.start_time;
            let mut existing_id = None;
            if let Some(ref existing) = existing {
                let projected = existing.lease.project(ctx.start_time);
                projected.validate_write(access.lease_id())?;
                lease = projected.collapse_after_write();
                creation_time = existing.creation_time;
                existing_id = existing.blob_id;
                for block in &existing.committed_blocks {
                    committed_by_name.insert(block.name.clone(), block.clone());
                }
            }

            let staged =
                load_staged_blocks(&mut tx, &blob.account, &blob.container, &blob.name).await?;
            let mut uncommitted_by_name: HashMap<String, CommittedBlock> = HashMap::new();
            for block in staged {
                uncommitted_by_name.insert(
                    block.block_name.clone(),
                    CommittedBlock {
                        name: block.block_name,
                        size: block.size,
                        persistency: block.persistency,
                    },
                );
            }

            let mut selected = Vec::with_capacity(block_list.len());
            for entry in &block_list {
                let source = BlockCommitType::parse(&entry.commit_type)?;
                let block = match source {
                    BlockCommitType::Uncommitted => uncommitted_by_name.get(&entry.block_name),
                    BlockCommitType::Committed => committed_by_name.get(&entry.block_name),
                    BlockCommitType::Latest => uncommitted_by_name
                        .get(&entry.block_name)
                        .or_else(|| committed_by_name.get(&entry.block_name)),
                };
                let block = block.ok_or_else(|| {
                    StorageError::with_message(
                        ErrorCode::InvalidOperation,
                        format!("block `{}` not found for commit", entry.block_name),
                    )
                })?;
                selected.push(block.clone());
            }

            let mut committed = blob;
            committed.blob_id = existing_id;
            committed.blob_type = BlobType::BlockBlob;
            committed.is_committed = true;
            committed.creation_time = creation_time;
            committed.last_modified = existing
                .as_ref()
                .map(|e| e.last_modified.max(ctx.start_time))
                .unwrap_or(ctx.start_time);
            committed.content.content_length = selected.iter().map(|b| b.size).sum();
            committed.committed_blocks = selected;
            committed.persistency = None;
            committed.sequence_number = None;
            committed.lease = lease;

            let id = upsert_blob(&mut tx, &committed).await?;
            committed.blob_id = committed.blob_id.or(Some(id));

            tombstone_blocks(&mut tx, &committed.account, &committed.container, Some(&committed.name))
                .await?;
            debug!(
                account = %committed.account,
                container = %committed.container,
                blob = %committed.name,
                blocks = committed.committed_blocks.len(),
                "block list committed"
            );
            Ok(committed)
        }
        .await;
        match result {
            Ok(blob) => {
                tx.commit().await?;
                Ok(blob)
            }
            Err(err) => Err(tag(ctx, err)),
        }
    }
}
