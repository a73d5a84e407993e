//! Lookup instructions: declarative specs of how a lake request finds its
//! candidate entries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deferred::{collect, Deferred, HasReferences, ResolvedValues, StepReference};
use super::lake_request::PlaceholderPolicy;
use crate::{Error, Result};

/// One lookup, tagged by `request_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupInstruction {
    /// Newest entries of an archive.
    Basic {
        archive_id: String,
        #[serde(default)]
        max_entries: Option<i64>,
        #[serde(default)]
        prioritize_tags: Vec<String>,
    },
    /// Nearest neighbours of the embedded query in an archive's vector index.
    Vector {
        archive_id: String,
        query_string: Deferred<String>,
        #[serde(default)]
        max_entries: Option<i64>,
        #[serde(default)]
        prioritize_tags: Vec<String>,
    },
    DirectEntry {
        entry_id: Deferred<Uuid>,
    },
    /// Latest content entry of a source.
    DirectSource {
        source_type: String,
        source_id: Deferred<String>,
    },
    /// The response entry of another lake request.
    RelatedResponse {
        related_request_id: Deferred<Uuid>,
    },
    /// The gathered sources of another lake request.
    RelatedSources {
        related_request_id: Deferred<Uuid>,
    },
    /// Pages fetched from the archive's configured `base_url`.
    WebSite {
        archive_id: String,
        retrieve_paths: Vec<String>,
    },
    BulkEntry {
        entry_ids: Deferred<Vec<Uuid>>,
    },
    /// Placeholder for the parent request's sources inside an inception chain.
    ParentChainEntries,
}

impl LookupInstruction {
    /// The `request_type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Basic { .. } => "BASIC",
            Self::Vector { .. } => "VECTOR",
            Self::DirectEntry { .. } => "DIRECT_ENTRY",
            Self::DirectSource { .. } => "DIRECT_SOURCE",
            Self::RelatedResponse { .. } => "RELATED_RESPONSE",
            Self::RelatedSources { .. } => "RELATED_SOURCES",
            Self::WebSite { .. } => "WEB_SITE",
            Self::BulkEntry { .. } => "BULK_ENTRY",
            Self::ParentChainEntries => "PARENT_CHAIN_ENTRIES",
        }
    }

    /// Archive the lookup reads from, if any.
    pub fn archive_id(&self) -> Option<&str> {
        match self {
            Self::Basic { archive_id, .. }
            | Self::Vector { archive_id, .. }
            | Self::WebSite { archive_id, .. } => Some(archive_id),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::ParentChainEntries)
    }

    pub fn validate(&self, placeholders: PlaceholderPolicy) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Validation(format!("{} lookup: {}", self.kind(), msg)));
        match self {
            Self::Basic {
                archive_id,
                max_entries,
                ..
            }
            | Self::Vector {
                archive_id,
                max_entries,
                ..
            } => {
                if archive_id.trim().is_empty() {
                    return invalid("archive_id is required");
                }
                if matches!(max_entries, Some(n) if *n <= 0) {
                    return invalid("max_entries must be positive");
                }
                if let Self::Vector {
                    query_string: Deferred::Literal(q),
                    ..
                } = self
                {
                    if q.trim().is_empty() {
                        return invalid("query_string is required");
                    }
                }
            }
            Self::DirectSource {
                source_type,
                source_id,
            } => {
                if source_type.trim().is_empty() {
                    return invalid("source_type is required");
                }
                if matches!(source_id, Deferred::Literal(s) if s.trim().is_empty()) {
                    return invalid("source_id is required");
                }
            }
            Self::WebSite {
                archive_id,
                retrieve_paths,
            } => {
                if archive_id.trim().is_empty() {
                    return invalid("archive_id is required");
                }
                if retrieve_paths.is_empty() {
                    return invalid("at least one retrieve path is required");
                }
            }
            Self::BulkEntry {
                entry_ids: Deferred::Literal(ids),
            } if ids.is_empty() => return invalid("at least one entry id is required"),
            Self::ParentChainEntries if placeholders == PlaceholderPolicy::Forbidden => {
                return invalid("only valid inside an INCEPTION chain definition");
            }
            _ => {}
        }
        Ok(())
    }
}

impl HasReferences for LookupInstruction {
    fn references(&self) -> Vec<&StepReference> {
        let mut out = Vec::new();
        match self {
            Self::Vector { query_string, .. } => collect(Some(query_string), &mut out),
            Self::DirectEntry { entry_id } => collect(Some(entry_id), &mut out),
            Self::DirectSource { source_id, .. } => collect(Some(source_id), &mut out),
            Self::RelatedResponse { related_request_id }
            | Self::RelatedSources { related_request_id } => {
                collect(Some(related_request_id), &mut out)
            }
            Self::BulkEntry { entry_ids } => collect(Some(entry_ids), &mut out),
            Self::Basic { .. } | Self::WebSite { .. } | Self::ParentChainEntries => {}
        }
        out
    }

    fn resolve_references(&mut self, values: &ResolvedValues) -> Result<()> {
        match self {
            Self::Vector { query_string, .. } => query_string.resolve(values),
            Self::DirectEntry { entry_id } => entry_id.resolve(values),
            Self::DirectSource { source_id, .. } => source_id.resolve(values),
            Self::RelatedResponse { related_request_id }
            | Self::RelatedSources { related_request_id } => related_request_id.resolve(values),
            Self::BulkEntry { entry_ids } => entry_ids.resolve(values),
            Self::Basic { .. } | Self::WebSite { .. } | Self::ParentChainEntries => Ok(()),
        }
    }
}
