//! Blob data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lease::Lease;

use super::new_etag;

/// Blob variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobType {
    BlockBlob,
    PageBlob,
    AppendBlob,
}

impl BlobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::BlockBlob => "BlockBlob",
            BlobType::PageBlob => "PageBlob",
            BlobType::AppendBlob => "AppendBlob",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BlockBlob" => Some(BlobType::BlockBlob),
            "PageBlob" => Some(BlobType::PageBlob),
            "AppendBlob" => Some(BlobType::AppendBlob),
            _ => None,
        }
    }
}

/// Access tiers for block blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessTier {
    Hot,
    Cool,
    Archive,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessTier::Hot => "Hot",
            AccessTier::Cool => "Cool",
            AccessTier::Archive => "Archive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hot" => Some(AccessTier::Hot),
            "cool" => Some(AccessTier::Cool),
            "archive" => Some(AccessTier::Archive),
            _ => None,
        }
    }
}

/// Reference to payload bytes held by the external extent store. The
/// metadata core never dereferences it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChunk {
    /// Id of the extent holding the bytes.
    pub store_id: String,
    /// Byte offset within the extent.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

impl PersistedChunk {
    pub fn new(store_id: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            store_id: store_id.into(),
            offset,
            length,
        }
    }
}

/// A block in a committed block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommittedBlock {
    pub name: String,
    pub size: u64,
    pub persistency: PersistedChunk,
}

/// Content properties of a blob.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentProperties {
    pub content_length: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub content_language: Option<String>,
    #[serde(default, with = "crate::codec::binary_opt")]
    pub content_md5: Option<Vec<u8>>,
    #[serde(default)]
    pub content_disposition: Option<String>,
    #[serde(default)]
    pub cache_control: Option<String>,
}

/// Blob row stored in the metadata store.
///
/// Identity is `(account, container, name, snapshot, deleting)`:
/// `snapshot` is empty for the live blob and the snapshot creation
/// timestamp otherwise; `deleting` is the tombstone generation, `0` for
/// live rows.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobModel {
    /// Surrogate monotonic id. `None` until the row has been inserted.
    pub blob_id: Option<i64>,
    pub account: String,
    pub container: String,
    pub name: String,
    pub snapshot: String,
    pub deleting: i64,
    pub blob_type: BlobType,
    /// False until a block list is committed or a single-shot upload
    /// finishes.
    pub is_committed: bool,
    pub creation_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub content: ContentProperties,
    pub access_tier: Option<AccessTier>,
    pub access_tier_inferred: bool,
    pub access_tier_change_time: Option<DateTime<Utc>>,
    /// Sequence number, page blobs only.
    pub sequence_number: Option<i64>,
    pub lease: Lease,
    /// Payload reference for single-shot uploads.
    pub persistency: Option<PersistedChunk>,
    /// Committed blocks in commit order, block blobs only.
    pub committed_blocks: Vec<CommittedBlock>,
    pub metadata: HashMap<String, String>,
}

impl BlobModel {
    /// Creates a live, uncommitted blob row stamped at `now`.
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        name: impl Into<String>,
        blob_type: BlobType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            blob_id: None,
            account: account.into(),
            container: container.into(),
            name: name.into(),
            snapshot: String::new(),
            deleting: 0,
            blob_type,
            is_committed: false,
            creation_time: now,
            last_modified: now,
            etag: new_etag(),
            content: ContentProperties::default(),
            access_tier: None,
            access_tier_inferred: false,
            access_tier_change_time: None,
            sequence_number: matches!(blob_type, BlobType::PageBlob).then_some(0),
            lease: Lease::available(),
            persistency: None,
            committed_blocks: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Returns true for the live (non-snapshot) row.
    pub fn is_base_blob(&self) -> bool {
        self.snapshot.is_empty()
    }

    /// Installs a fresh etag and advances `last_modified` without ever
    /// moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.etag = new_etag();
        self.last_modified = self.last_modified.max(now);
    }

    /// Clones this row into a snapshot identified by `snapshot`. Snapshots
    /// start without a lease.
    pub fn to_snapshot(&self, snapshot: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.blob_id = None;
        copy.snapshot = snapshot.into();
        copy.lease = Lease::available();
        copy
    }
}
