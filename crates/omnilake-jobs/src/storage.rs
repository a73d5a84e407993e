//! Entry storage and archive indexing.

use omnilake_core::{ArchiveOperation, Entry, NewEntry, Result};
use tracing::debug;
use uuid::Uuid;

use crate::context::EngineContext;

/// Stores entries and indexes them into archives, embedding content for
/// VECTOR archives.
#[derive(Clone)]
pub struct EntryStore {
    ctx: EngineContext,
}

impl EntryStore {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn add(&self, entry: NewEntry) -> Result<Entry> {
        let entry = self.ctx.repos.entries.create(entry).await?;
        debug!(entry_id = %entry.entry_id, char_count = entry.char_count, "Stored entry");
        Ok(entry)
    }

    /// Index an entry into an archive whose status permits `operation`.
    pub async fn index(
        &self,
        archive_id: &str,
        entry_id: Uuid,
        operation: ArchiveOperation,
    ) -> Result<()> {
        let archive = self.ctx.repos.archives.require(archive_id).await?;
        archive.check(operation)?;
        self.ctx
            .repos
            .entries
            .index(archive_id, entry_id, operation)
            .await?;

        if archive.is_vector() {
            let entry = self.ctx.repos.entries.require(entry_id).await?;
            self.embed_into(archive_id, &[entry]).await?;
        }
        debug!(%archive_id, %entry_id, "Indexed entry");
        Ok(())
    }

    /// Store and, when a destination is given, index with Write permission.
    pub async fn add_to(&self, entry: NewEntry, archive_id: Option<&str>) -> Result<Entry> {
        let entry = self.add(entry).await?;
        if let Some(archive_id) = archive_id {
            self.index(archive_id, entry.entry_id, ArchiveOperation::Write)
                .await?;
        }
        Ok(entry)
    }

    /// Embed entries and upsert them into the archive's vector index.
    pub async fn embed_into(&self, archive_id: &str, entries: &[Entry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = entries.iter().map(|e| e.content.clone()).collect();
        let vectors = self.ctx.embedding.embed_texts(&texts).await?;
        for (entry, vector) in entries.iter().zip(vectors) {
            self.ctx
                .repos
                .vectors
                .upsert(archive_id, entry.entry_id, vector)
                .await?;
        }
        Ok(entries.len())
    }
}
