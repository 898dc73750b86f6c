//! Staged block data models.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, StorageError, StorageResult};

use super::PersistedChunk;

/// Which block lists to return from a block-list query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockListType {
    Committed,
    Uncommitted,
    #[default]
    All,
}

impl BlockListType {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "committed" => BlockListType::Committed,
            "uncommitted" => BlockListType::Uncommitted,
            _ => BlockListType::All,
        }
    }
}

/// Source a commit-list entry selects a block from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCommitType {
    /// Take the block from the staged (uncommitted) set.
    Uncommitted,
    /// Take the block from the currently committed list.
    Committed,
    /// Prefer the staged block, fall back to the committed one.
    Latest,
}

impl BlockCommitType {
    /// Parses a caller-supplied commit-type string. Anything other than the
    /// three known kinds is an invalid operation.
    pub fn parse(s: &str) -> StorageResult<Self> {
        match s.to_lowercase().as_str() {
            "uncommitted" => Ok(BlockCommitType::Uncommitted),
            "committed" => Ok(BlockCommitType::Committed),
            "latest" => Ok(BlockCommitType::Latest),
            other => Err(StorageError::with_message(
                ErrorCode::InvalidOperation,
                format!("unknown block commit type `{other}`"),
            )),
        }
    }
}

/// One entry of a caller-supplied commit list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockListEntry {
    pub block_name: String,
    /// Raw commit type as supplied by the caller; validated during commit.
    pub commit_type: String,
}

impl BlockListEntry {
    pub fn new(block_name: impl Into<String>, commit_type: impl Into<String>) -> Self {
        Self {
            block_name: block_name.into(),
            commit_type: commit_type.into(),
        }
    }
}

/// A staged (uncommitted) block row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockModel {
    /// Surrogate id; insertion order of staged blocks. `None` until the row
    /// has been inserted.
    pub id: Option<i64>,
    pub account: String,
    pub container: String,
    pub blob: String,
    /// Client-supplied block name.
    pub block_name: String,
    /// Tombstone generation, `0` for live rows.
    pub deleting: i64,
    pub size: u64,
    pub persistency: PersistedChunk,
}

impl BlockModel {
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        blob: impl Into<String>,
        block_name: impl Into<String>,
        size: u64,
        persistency: PersistedChunk,
    ) -> Self {
        Self {
            id: None,
            account: account.into(),
            container: container.into(),
            blob: blob.into(),
            block_name: block_name.into(),
            deleting: 0,
            size,
            persistency,
        }
    }
}
