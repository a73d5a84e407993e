//! Response stage: turns the processed entry into the request's response.

use omnilake_core::defaults::WRAP_SEPARATOR;
use omnilake_core::{
    ArchiveOperation, Deferred, Entry, Error, GenerationOptions, NewEntry, ResponseConfig, Result,
};
use omnilake_inference::prompts::response_prompt;
use tracing::{debug, instrument};

use crate::context::EngineContext;
use crate::storage::EntryStore;

/// `prepend + sep + content + sep + append`; an absent side drops its
/// separator.
pub fn wrap_content(
    prepend: Option<&str>,
    append: Option<&str>,
    separator: Option<&str>,
    content: &str,
) -> String {
    let separator = separator.unwrap_or(WRAP_SEPARATOR);
    let mut out = String::new();
    if let Some(prepend) = prepend {
        out.push_str(prepend);
        out.push_str(separator);
    }
    out.push_str(content);
    if let Some(append) = append {
        out.push_str(separator);
        out.push_str(append);
    }
    out
}

fn optional(value: &Option<Deferred<String>>) -> Result<Option<&str>> {
    value
        .as_ref()
        .map(|v| v.value().map(String::as_str))
        .transpose()
}

#[derive(Clone)]
pub struct Responder {
    ctx: EngineContext,
    store: EntryStore,
}

impl Responder {
    pub fn new(ctx: EngineContext) -> Self {
        let store = EntryStore::new(ctx.clone());
        Self { ctx, store }
    }

    /// Fail with `ArchiveBusy` while the destination archive cannot take
    /// writes, before any generation work is spent.
    pub async fn check_destination(&self, config: &ResponseConfig) -> Result<()> {
        if let Some(archive_id) = config.destination_archive_id() {
            if let Some(archive) = self.ctx.repos.archives.get(archive_id).await? {
                archive.check(ArchiveOperation::Write)?;
            }
        }
        Ok(())
    }

    /// Apply the response configuration, returning the response entry.
    #[instrument(skip_all, fields(response_type = config.kind(), processed_entry_id = %processed.entry_id))]
    pub async fn respond(&self, config: &ResponseConfig, processed: &Entry) -> Result<Entry> {
        let destination = config.destination_archive_id();
        match config {
            ResponseConfig::Direct { .. } => {
                if let Some(archive_id) = destination {
                    self.store
                        .index(archive_id, processed.entry_id, ArchiveOperation::Write)
                        .await?;
                }
                Ok(processed.clone())
            }
            ResponseConfig::Simple {
                goal,
                prompt,
                model_id,
                ..
            } => {
                let prompt = response_prompt(goal.value()?, optional(prompt)?, &processed.content);
                let options = GenerationOptions::default().with_model(model_id.as_deref());
                let content = self
                    .ctx
                    .generation
                    .generate_with_options(&prompt, &options)
                    .await?;
                self.store_response(content, processed, destination).await
            }
            ResponseConfig::Wrap {
                prepend_text,
                append_text,
                separator,
                ..
            } => {
                let content = wrap_content(
                    optional(prepend_text)?,
                    optional(append_text)?,
                    separator.as_deref(),
                    &processed.content,
                );
                self.store_response(content, processed, destination).await
            }
            ResponseConfig::ExportResponse => Err(Error::Processing(
                "EXPORT_RESPONSE must be rewritten before a request runs".into(),
            )),
        }
    }

    async fn store_response(
        &self,
        content: String,
        processed: &Entry,
        destination: Option<&str>,
    ) -> Result<Entry> {
        let entry = self
            .store
            .add_to(
                NewEntry::new(content).with_source_entries(&[processed.entry_id]),
                destination,
            )
            .await?;
        debug!(response_entry_id = %entry.entry_id, "Stored response entry");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omnilake_core::ArchiveStatus;
    use omnilake_db::{memory, test_fixtures};
    use omnilake_inference::MockInferenceBackend;
    use serde_json::json;

    #[test]
    fn test_wrap_exact_concatenation() {
        assert_eq!(wrap_content(Some("<<"), Some(">>"), Some("\n"), "X"), "<<\nX\n>>");
        assert_eq!(wrap_content(Some("A"), Some("B"), None, "X"), "A\n\nX\n\nB");
        assert_eq!(wrap_content(None, Some(">>"), Some("|"), "X"), "X|>>");
        assert_eq!(wrap_content(Some("<<"), None, Some("|"), "X"), "<<|X");
        assert_eq!(wrap_content(None, None, None, "X"), "X");
    }

    async fn setup(backend: MockInferenceBackend) -> (Responder, EngineContext, Entry) {
        let backend = Arc::new(backend);
        let ctx = EngineContext::new(memory::repositories(), backend.clone(), backend);
        ctx.repos
            .archives
            .create(&test_fixtures::active_archive("out"))
            .await
            .unwrap();
        let processed = ctx
            .repos
            .entries
            .create(NewEntry::new("processed text"))
            .await
            .unwrap();
        (Responder::new(ctx.clone()), ctx, processed)
    }

    fn config(value: serde_json::Value) -> ResponseConfig {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_direct_returns_processed_entry() {
        let (responder, _, processed) = setup(MockInferenceBackend::new()).await;
        let entry = responder
            .respond(&config(json!({"response_type": "DIRECT"})), &processed)
            .await
            .unwrap();
        assert_eq!(entry.entry_id, processed.entry_id);
    }

    #[tokio::test]
    async fn test_simple_generates_from_processed_content() {
        let backend = MockInferenceBackend::new().with_fixed_response("final answer");
        let (responder, _, processed) = setup(backend.clone()).await;
        let entry = responder
            .respond(
                &config(json!({"response_type": "SIMPLE", "goal": "answer it", "model_id": "m"})),
                &processed,
            )
            .await
            .unwrap();

        assert_eq!(entry.content, "final answer");
        assert_eq!(entry.sources, vec![processed.entry_id.to_string()]);
        let call = &backend.get_calls()[0];
        assert!(call.input.contains("USER GOAL: answer it"));
        assert!(call.input.ends_with("CONTENT TO USE FOR RESPONSE:\n\nprocessed text"));
        assert_eq!(call.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_wrap_indexes_into_destination() {
        let (responder, ctx, processed) = setup(MockInferenceBackend::new()).await;
        let entry = responder
            .respond(
                &config(json!({
                    "response_type": "WRAP",
                    "prepend_text": "Report:",
                    "destination_archive_id": "out"
                })),
                &processed,
            )
            .await
            .unwrap();

        assert_eq!(entry.content, "Report:\n\nprocessed text");
        let indexed = ctx.repos.entries.archive_entry_ids("out").await.unwrap();
        assert_eq!(indexed, vec![entry.entry_id]);
    }

    #[tokio::test]
    async fn test_busy_destination_is_retryable() {
        let (responder, ctx, _) = setup(MockInferenceBackend::new()).await;
        ctx.repos
            .archives
            .begin_maintenance("out", "ARCHIVE_VACUUM/x")
            .await
            .unwrap();

        let err = responder
            .check_destination(&config(json!({
                "response_type": "DIRECT",
                "destination_archive_id": "out"
            })))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ArchiveBusy { status: ArchiveStatus::Maintenance, .. }
        ));
        assert!(err.is_retryable());
    }
}
