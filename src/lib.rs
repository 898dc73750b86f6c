//! sqlblob: SQL-backed metadata store for an Azure Blob Storage emulator.
//!
//! This crate is the persistence and concurrency-control core of a blob
//! service emulator. It owns the authoritative state of service properties,
//! containers, blobs (including snapshots), and staged blocks, and enforces
//! the lease protocol that gates mutating operations. HTTP parsing, wire
//! serialization, authentication, and payload storage live in upper layers;
//! blob content is referenced here only through opaque persistence chunks.
//!
//! # Example
//!
//! ```no_run
//! use sqlblob::models::ContainerModel;
//! use sqlblob::{BlobMetadataStore, DbConfig, OperationContext, SqlMetadataStore};
//!
//! #[tokio::main]
//! async fn main() -> sqlblob::StorageResult<()> {
//!     let store = SqlMetadataStore::connect(&DbConfig::from_env()?).await?;
//!     store.init().await?;
//!
//!     let ctx = OperationContext::new();
//!     let container = ContainerModel::new("devstoreaccount1", "mycontainer", ctx.start_time);
//!     store.create_container(&ctx, container).await?;
//!     store.check_container_exists(&ctx, "devstoreaccount1", "mycontainer").await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod cors;
pub mod error;
pub mod lease;
pub mod models;
pub mod storage;

// Re-exports for convenience
pub use config::{DbConfig, Dialect};
pub use context::OperationContext;
pub use error::{ErrorCode, StorageError, StorageResult};
pub use lease::{Lease, LeaseDurationType, LeaseState, LeaseStatus};
pub use storage::{
    AccessConditions, BlobMetadataStore, BlockList, DeleteSnapshotsOption, ExtentRefIterator,
    SetTierOutcome, SqlMetadataStore,
};
