//! The metadata store operation surface.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::context::OperationContext;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{
    AccessTier, BlobModel, BlobType, BlockListEntry, BlockListType, BlockModel, CommittedBlock,
    ContainerModel, ContentProperties, PublicAccessLevel, ServiceProperties, SignedIdentifier,
};

/// Access conditions supplied with a request.
#[derive(Debug, Clone, Default)]
pub struct AccessConditions {
    /// Lease id from the request, if any.
    pub lease_id: Option<String>,
}

impl AccessConditions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn lease(lease_id: impl Into<String>) -> Self {
        Self {
            lease_id: Some(lease_id.into()),
        }
    }

    pub fn lease_id(&self) -> Option<&str> {
        self.lease_id.as_deref()
    }
}

/// Snapshot handling for blob deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSnapshotsOption {
    /// Delete the base blob together with all of its snapshots.
    Include,
    /// Delete only the snapshots, leaving the base blob.
    Only,
}

/// Outcome of a tier change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTierOutcome {
    /// Tier recorded; maps to a 200 response upstream.
    Updated,
    /// Archive rehydration accepted; maps to a 202 response upstream.
    RehydrationPending,
}

/// Result of a block-list query.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    pub committed: Vec<CommittedBlock>,
    pub uncommitted: Vec<BlockModel>,
}

/// Transactional metadata operations exposed to the REST handlers.
///
/// Every mutating operation runs inside a single backing-store transaction:
/// it looks up the target rows (container existence first), projects the
/// embedded lease to the request's logical clock, validates access
/// conditions, mutates, and commits. Callers observe either the full effect
/// of an operation or none of it.
#[async_trait]
pub trait BlobMetadataStore: Send + Sync {
    /// Synchronizes the schema. Idempotent; called once at startup.
    async fn init(&self) -> StorageResult<()>;

    /// Drains connections and marks the store closed. Subsequent operations
    /// fail with `StoreClosed`.
    async fn close(&self) -> StorageResult<()>;

    // Service properties

    async fn get_service_properties(
        &self,
        ctx: &OperationContext,
        account: &str,
    ) -> StorageResult<Option<ServiceProperties>>;

    /// Creates or updates service properties. Sections absent from the
    /// update keep their stored contents.
    async fn set_service_properties(
        &self,
        ctx: &OperationContext,
        properties: ServiceProperties,
    ) -> StorageResult<ServiceProperties>;

    // Container operations

    /// Lists containers of an account ordered by surrogate id. Returns the
    /// page and, when the page is full, the cursor for the next one.
    async fn list_containers(
        &self,
        ctx: &OperationContext,
        account: &str,
        prefix: &str,
        max_results: u32,
        marker: Option<i64>,
    ) -> StorageResult<(Vec<ContainerModel>, Option<i64>)>;

    async fn create_container(
        &self,
        ctx: &OperationContext,
        container: ContainerModel,
    ) -> StorageResult<ContainerModel>;

    async fn get_container_properties(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel>;

    async fn get_container_acl(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel>;

    async fn set_container_metadata(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        metadata: HashMap<String, String>,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel>;

    async fn set_container_acl(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        acl: Vec<SignedIdentifier>,
        public_access: Option<PublicAccessLevel>,
        access: &AccessConditions,
    ) -> StorageResult<ContainerModel>;

    /// Deletes the container row and tombstones every child blob and block.
    /// Physical removal of tombstoned rows is an external concern.
    async fn delete_container(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        access: &AccessConditions,
    ) -> StorageResult<()>;

    /// Existence probe; fails with `ContainerNotFound` on miss.
    async fn check_container_exists(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
    ) -> StorageResult<()>;

    // Container leases

    async fn acquire_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        duration: i64,
        proposed_id: Option<&str>,
    ) -> StorageResult<ContainerModel>;

    async fn release_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        lease_id: &str,
    ) -> StorageResult<ContainerModel>;

    async fn renew_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        lease_id: &str,
    ) -> StorageResult<ContainerModel>;

    async fn change_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        lease_id: &str,
        proposed_id: &str,
    ) -> StorageResult<ContainerModel>;

    /// Breaks the container lease; also returns the remaining break period
    /// in seconds.
    async fn break_container_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        break_period: Option<i64>,
    ) -> StorageResult<(ContainerModel, i64)>;

    // Blob operations

    /// Creates or overwrites the live blob row. Overwriting an
    /// archive-tier blob is rejected.
    async fn create_blob(
        &self,
        ctx: &OperationContext,
        blob: BlobModel,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel>;

    async fn download_blob(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel>;

    async fn get_blob_properties(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel>;

    /// Lists committed blobs of a container ordered by name. Returns the
    /// page and the continuation cursor (last blob name) when more exist.
    async fn list_blobs(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        prefix: &str,
        max_results: u32,
        marker: Option<&str>,
        include_snapshots: bool,
    ) -> StorageResult<(Vec<BlobModel>, Option<String>)>;

    /// Lists blobs across all accounts and containers, paged by surrogate
    /// id; used by the referenced-extent iterator.
    async fn list_all_blobs(
        &self,
        max_results: u32,
        marker: Option<i64>,
        include_snapshots: bool,
        include_uncommitted: bool,
    ) -> StorageResult<(Vec<BlobModel>, Option<i64>)>;

    /// Updates content properties; `content_length` of the supplied value
    /// is ignored and preserved from the stored row.
    async fn set_blob_http_headers(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        content: ContentProperties,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel>;

    async fn set_blob_metadata(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        metadata: HashMap<String, String>,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel>;

    /// Clones the live blob into a snapshot stamped with the request clock.
    /// Returns the snapshot identifier and the snapshot row.
    async fn create_snapshot(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        metadata: Option<HashMap<String, String>>,
        access: &AccessConditions,
    ) -> StorageResult<(String, BlobModel)>;

    async fn delete_blob(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        delete_snapshots: Option<DeleteSnapshotsOption>,
        access: &AccessConditions,
    ) -> StorageResult<()>;

    async fn set_tier(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        tier: AccessTier,
        access: &AccessConditions,
    ) -> StorageResult<SetTierOutcome>;

    /// Pure lookup of the blob variant and commit state.
    async fn get_blob_type(
        &self,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
    ) -> StorageResult<Option<(BlobType, bool)>>;

    // Blob leases

    /// Acquires a lease on the live blob. Snapshots cannot be leased.
    async fn acquire_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        snapshot: &str,
        duration: i64,
        proposed_id: Option<&str>,
    ) -> StorageResult<BlobModel>;

    async fn release_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        lease_id: &str,
    ) -> StorageResult<BlobModel>;

    async fn renew_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        lease_id: &str,
    ) -> StorageResult<BlobModel>;

    async fn change_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        lease_id: &str,
        proposed_id: &str,
    ) -> StorageResult<BlobModel>;

    async fn break_blob_lease(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        break_period: Option<i64>,
    ) -> StorageResult<(BlobModel, i64)>;

    // Block operations

    /// Stages a block: upsert by `(account, container, blob, block name)`.
    async fn stage_block(
        &self,
        ctx: &OperationContext,
        block: BlockModel,
        access: &AccessConditions,
    ) -> StorageResult<()>;

    async fn get_block_list(
        &self,
        ctx: &OperationContext,
        account: &str,
        container: &str,
        blob: &str,
        list_type: BlockListType,
        access: &AccessConditions,
    ) -> StorageResult<BlockList>;

    /// Commits a block list: resolves each entry against the staged and
    /// committed sets, upserts the live blob row, and tombstones all staged
    /// blocks of the blob.
    async fn commit_block_list(
        &self,
        ctx: &OperationContext,
        blob: BlobModel,
        block_list: Vec<BlockListEntry>,
        access: &AccessConditions,
    ) -> StorageResult<BlobModel>;

    // Declared-but-unimplemented surface. These mutate nothing.

    async fn start_copy_from_url(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "copy blob from URL"))
    }

    async fn undelete_blob(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "undelete blob"))
    }

    async fn upload_pages(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "upload pages"))
    }

    async fn clear_pages(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "clear pages"))
    }

    async fn get_page_ranges(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "get page ranges"))
    }

    async fn resize_page_blob(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "resize page blob"))
    }

    async fn update_sequence_number(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "update sequence number"))
    }

    async fn append_block(
        &self,
        ctx: &OperationContext,
        _account: &str,
        _container: &str,
        _blob: &str,
    ) -> StorageResult<()> {
        Err(not_implemented(ctx, "append block"))
    }
}

fn not_implemented(ctx: &OperationContext, operation: &str) -> StorageError {
    StorageError::with_message(
        ErrorCode::NotImplemented,
        format!("{operation} is not implemented"),
    )
    .with_request_id(ctx.request_id.clone())
}
