//! Lazy enumeration of persistence chunks referenced by live metadata.
//!
//! Feeds the external garbage collector: a finite, single-pass sequence of
//! chunk batches covering every committed blob (its single-shot chunk and
//! every committed block) followed by every live staged block. Concurrent
//! mutations are not blocked; the collector must cross-check liveness
//! before deleting anything.

use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::StorageResult;
use crate::models::{CommittedBlock, PersistedChunk};

use super::sql::SqlMetadataStore;

/// Default number of rows fetched per page.
pub const DEFAULT_EXTENT_PAGE_SIZE: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Blobs,
    Blocks,
    Done,
}

/// Paged iterator over every referenced persistence chunk.
pub struct ExtentRefIterator {
    pool: SqlitePool,
    page_size: u32,
    phase: Phase,
    marker: i64,
}

impl ExtentRefIterator {
    /// Creates an iterator over the given store. `page_size` defaults to
    /// [`DEFAULT_EXTENT_PAGE_SIZE`].
    pub fn new(store: &SqlMetadataStore, page_size: Option<u32>) -> Self {
        Self {
            pool: store.pool().clone(),
            page_size: page_size.unwrap_or(DEFAULT_EXTENT_PAGE_SIZE).max(1),
            phase: Phase::Blobs,
            marker: 0,
        }
    }

    /// Returns the next batch of referenced chunks, or `None` when the scan
    /// is complete. Batches are never empty.
    pub async fn next_batch(&mut self) -> StorageResult<Option<Vec<PersistedChunk>>> {
        loop {
            let batch = match self.phase {
                Phase::Blobs => self.next_blob_page().await?,
                Phase::Blocks => self.next_block_page().await?,
                Phase::Done => return Ok(None),
            };
            match batch {
                Some(chunks) if chunks.is_empty() => continue,
                Some(chunks) => return Ok(Some(chunks)),
                // Page exhausted, move to the next phase.
                None => continue,
            }
        }
    }

    async fn next_blob_page(&mut self) -> StorageResult<Option<Vec<PersistedChunk>>> {
        let rows = sqlx::query(
            "SELECT blob_id, persistency, committed_blocks FROM blobs \
             WHERE deleting = 0 AND is_committed = 1 AND blob_id > ? \
             ORDER BY blob_id ASC LIMIT ?",
        )
        .bind(self.marker)
        .bind(self.page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            debug!("extent scan: blob phase complete");
            self.phase = Phase::Blocks;
            self.marker = 0;
            return Ok(None);
        }

        let mut chunks = Vec::new();
        for row in &rows {
            self.marker = row.try_get("blob_id")?;
            let persistency: Option<String> = row.try_get("persistency")?;
            if let Some(raw) = persistency.as_deref() {
                chunks.push(serde_json::from_str::<PersistedChunk>(raw)?);
            }
            let committed: Option<String> = row.try_get("committed_blocks")?;
            if let Some(raw) = committed.as_deref() {
                let blocks: Vec<CommittedBlock> = serde_json::from_str(raw)?;
                chunks.extend(blocks.into_iter().map(|b| b.persistency));
            }
        }

        if (rows.len() as u32) < self.page_size {
            debug!("extent scan: blob phase complete");
            self.phase = Phase::Blocks;
            self.marker = 0;
        }
        Ok(Some(chunks))
    }

    async fn next_block_page(&mut self) -> StorageResult<Option<Vec<PersistedChunk>>> {
        let rows = sqlx::query(
            "SELECT id, persistency FROM blocks \
             WHERE deleting = 0 AND id > ? \
             ORDER BY id ASC LIMIT ?",
        )
        .bind(self.marker)
        .bind(self.page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            self.phase = Phase::Done;
            return Ok(None);
        }

        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            self.marker = row.try_get("id")?;
            let raw: String = row.try_get("persistency")?;
            chunks.push(serde_json::from_str::<PersistedChunk>(raw.as_str())?);
        }

        if (rows.len() as u32) < self.page_size {
            self.phase = Phase::Done;
        }
        Ok(Some(chunks))
    }
}
