//! Lookup execution: one instruction in, candidate entry ids out.

use chrono::Utc;
use omnilake_core::defaults;
use omnilake_core::{
    ArchiveOperation, Error, LookupInstruction, NewEntry, Result, Source,
};
use serde_json::json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::storage::EntryStore;

/// Runs single lookup instructions against storage, the vector index and
/// the web.
#[derive(Clone)]
pub struct LookupRunner {
    ctx: EngineContext,
    store: EntryStore,
}

impl LookupRunner {
    pub fn new(ctx: EngineContext) -> Self {
        let store = EntryStore::new(ctx.clone());
        Self { ctx, store }
    }

    /// Entry ids selected by `instruction`. References must already be
    /// resolved; placeholders never reach here.
    #[instrument(skip(self, instruction), fields(kind = instruction.kind()))]
    pub async fn run(&self, instruction: &LookupInstruction) -> Result<Vec<Uuid>> {
        let repos = &self.ctx.repos;
        let ids = match instruction {
            LookupInstruction::Basic {
                archive_id,
                max_entries,
                prioritize_tags,
            } => {
                repos.archives.require(archive_id).await?.check(ArchiveOperation::Read)?;
                repos
                    .entries
                    .list_archive_entries(archive_id, prioritize_tags, limit(*max_entries))
                    .await?
            }
            LookupInstruction::Vector {
                archive_id,
                query_string,
                max_entries,
                prioritize_tags,
            } => {
                let archive = repos.archives.require(archive_id).await?;
                archive.check(ArchiveOperation::Read)?;
                if !archive.is_vector() {
                    return Err(Error::Lookup(format!(
                        "archive {} has storage type {}, vector lookups need {}",
                        archive_id,
                        archive.storage_type,
                        defaults::STORAGE_TYPE_VECTOR
                    )));
                }
                let query = query_string.value()?;
                let embedding = self
                    .ctx
                    .embedding
                    .embed_texts(std::slice::from_ref(query))
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::Embedding("no embedding returned for query".into()))?;
                repos
                    .vectors
                    .query(archive_id, &embedding, prioritize_tags, limit(*max_entries))
                    .await?
            }
            LookupInstruction::DirectEntry { entry_id } => {
                vec![repos.entries.require(*entry_id.value()?).await?.entry_id]
            }
            LookupInstruction::DirectSource {
                source_type,
                source_id,
            } => {
                let source_id = source_id.value()?;
                let source = repos
                    .sources
                    .get(source_type, source_id)
                    .await?
                    .ok_or_else(|| {
                        Error::Lookup(format!("source {}/{} not found", source_type, source_id))
                    })?;
                match source.latest_content_entry_id {
                    Some(id) => vec![id],
                    None => {
                        return Err(Error::Lookup(format!(
                            "source {} has no content",
                            source.resource_name()
                        )))
                    }
                }
            }
            LookupInstruction::RelatedResponse { related_request_id } => {
                let related = repos.lake_requests.require(*related_request_id.value()?).await?;
                match related.response_entry_id {
                    Some(id) => vec![id],
                    None => {
                        return Err(Error::Lookup(format!(
                            "lake request {} has no response",
                            related.lake_request_id
                        )))
                    }
                }
            }
            LookupInstruction::RelatedSources { related_request_id } => {
                repos
                    .lake_requests
                    .require(*related_request_id.value()?)
                    .await?
                    .response_sources
            }
            LookupInstruction::WebSite {
                archive_id,
                retrieve_paths,
            } => self.fetch_site(archive_id, retrieve_paths).await?,
            LookupInstruction::BulkEntry { entry_ids } => repos
                .entries
                .get_many(entry_ids.value()?)
                .await?
                .into_iter()
                .map(|e| e.entry_id)
                .collect(),
            LookupInstruction::ParentChainEntries => {
                return Err(Error::Lookup(
                    "PARENT_CHAIN_ENTRIES is only valid inside an inception chain".into(),
                ))
            }
        };
        debug!(result_count = ids.len(), "Lookup finished");
        Ok(ids)
    }

    /// Fetch each path under the archive's `base_url`, storing new content as
    /// the latest original of its WEB_SITE source.
    async fn fetch_site(&self, archive_id: &str, paths: &[String]) -> Result<Vec<Uuid>> {
        let archive = self.ctx.repos.archives.require(archive_id).await?;
        archive.check(ArchiveOperation::Read)?;
        let base_url = archive.config_str("base_url").ok_or_else(|| {
            Error::Lookup(format!("archive {} has no configuration.base_url", archive_id))
        })?;

        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            let url = join_url(base_url, path);
            let content = self.fetch(&url).await?;
            ids.push(self.store_page(archive_id, &url, content).await?);
        }
        Ok(ids)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .ctx
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Lookup(format!("fetching {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Lookup(format!("fetching {}: HTTP {}", url, status)));
        }
        response
            .text()
            .await
            .map_err(|e| Error::Lookup(format!("reading {}: {}", url, e)))
    }

    /// Unchanged content reuses the source's latest entry.
    async fn store_page(&self, archive_id: &str, url: &str, content: String) -> Result<Uuid> {
        let repos = &self.ctx.repos;
        let existing = repos.sources.get(defaults::SOURCE_TYPE_WEB_SITE, url).await?;

        if let Some(latest) = existing.as_ref().and_then(|s| s.latest_content_entry_id) {
            if let Some(entry) = repos.entries.get(latest).await? {
                if entry.content_hash == omnilake_core::content_hash(&content) {
                    debug!(%url, entry_id = %latest, "Page unchanged");
                    return Ok(latest);
                }
            }
        }

        let entry = self
            .store
            .add(NewEntry::new(content).original_of(defaults::SOURCE_TYPE_WEB_SITE, url))
            .await?;
        self.store
            .index(archive_id, entry.entry_id, ArchiveOperation::Write)
            .await?;

        let source = Source {
            source_type: defaults::SOURCE_TYPE_WEB_SITE.to_string(),
            source_id: url.to_string(),
            source_arguments: json!({ "url": url, "archive_id": archive_id }),
            latest_content_entry_id: Some(entry.entry_id),
            added_on: existing.map(|s| s.added_on).unwrap_or_else(Utc::now),
        };
        repos.sources.put(&source).await?;
        info!(%url, entry_id = %entry.entry_id, "Stored fetched page");
        Ok(entry.entry_id)
    }
}

fn limit(max_entries: Option<i64>) -> i64 {
    max_entries
        .filter(|n| *n > 0)
        .unwrap_or(defaults::LOOKUP_MAX_ENTRIES)
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_normalizes_slashes() {
        assert_eq!(join_url("https://a.io/", "/docs"), "https://a.io/docs");
        assert_eq!(join_url("https://a.io", "docs/x"), "https://a.io/docs/x");
    }

    #[test]
    fn test_limit_defaults() {
        assert_eq!(limit(None), defaults::LOOKUP_MAX_ENTRIES);
        assert_eq!(limit(Some(0)), defaults::LOOKUP_MAX_ENTRIES);
        assert_eq!(limit(Some(3)), 3);
    }
}
