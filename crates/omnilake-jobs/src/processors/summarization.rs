//! Recursive summarization.
//!
//! Round zero summarises every entry on its own. Each following round
//! groups the previous round's summaries and summarises every group of two
//! or more, until one summary remains. Intermediate summaries are stored as
//! entries so later prompts can cite them by id.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use omnilake_core::defaults;
use omnilake_core::{
    Entry, Error, GenerationOptions, NewEntry, Result, SummarizationInstructions,
};
use omnilake_inference::prompts::{summary_prompt, PromptEntry};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::ProcessingOutput;
use crate::context::EngineContext;
use crate::storage::EntryStore;

/// A summary produced during one round.
#[derive(Debug, Clone)]
struct Piece {
    entry_id: Uuid,
    content: String,
}

#[derive(Clone)]
pub struct Summarizer {
    ctx: EngineContext,
    store: EntryStore,
    max_group_size: usize,
    max_depth: u32,
}

impl Summarizer {
    pub fn new(ctx: EngineContext) -> Self {
        let store = EntryStore::new(ctx.clone());
        Self {
            ctx,
            store,
            max_group_size: defaults::SUMMARY_MAX_GROUP_SIZE,
            max_depth: defaults::SUMMARY_MAX_RECURSION_DEPTH,
        }
    }

    pub fn with_max_group_size(mut self, size: usize) -> Self {
        self.max_group_size = size.max(2);
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn summarize(
        &self,
        entries: &[Entry],
        instructions: &SummarizationInstructions,
    ) -> Result<ProcessingOutput> {
        if entries.is_empty() {
            return Err(Error::Processing("nothing to summarize".into()));
        }
        let goal = instructions.goal.value()?.as_str();
        let custom_prompt = match &instructions.prompt {
            Some(p) => Some(p.value()?.as_str()),
            None => None,
        };
        let options = &GenerationOptions::default().with_model(instructions.model_id.as_deref());

        let source_ids: Vec<Uuid> = entries.iter().map(|e| e.entry_id).collect();
        let dates: Vec<DateTime<Utc>> = entries.iter().map(|e| e.effective_on).collect();
        let final_entry = &|| {
            NewEntry::new(String::new())
                .with_source_entries(&source_ids)
                .with_effective_on(instructions.effective_on_calculation_rule.compute(&dates))
        };

        let single = entries.len() == 1;
        let round_zero = entries.iter().map(|entry| async move {
            let prompt_entry = self
                .prompt_entry(entry, instructions.include_source_metadata)
                .await?;
            let text = self
                .generate(summary_prompt(goal, custom_prompt, &[prompt_entry]), options)
                .await?;
            let new_entry = if single {
                NewEntry { content: text, ..final_entry() }
            } else {
                NewEntry::new(text)
                    .with_source_entries(&[entry.entry_id])
                    .with_effective_on(entry.effective_on)
            };
            self.store_piece(new_entry).await
        });
        let mut pieces = try_join_all(round_zero).await?;

        let mut depth = 0u32;
        while pieces.len() > 1 {
            depth += 1;
            if depth > self.max_depth {
                return Err(Error::Processing(format!(
                    "summarization did not converge within {} rounds",
                    self.max_depth
                )));
            }
            let groups: Vec<Vec<Piece>> = pieces
                .chunks(self.max_group_size)
                .map(<[Piece]>::to_vec)
                .collect();
            let last_round = groups.len() == 1;
            debug!(round = depth, groups = groups.len(), "Summarization round");

            let round = groups.into_iter().map(|group| {
                async move {
                    if group.len() == 1 {
                        return Ok::<_, Error>(group.into_iter().next());
                    }
                    let prompt_entries: Vec<PromptEntry> = group
                        .iter()
                        .map(|p| PromptEntry::new(p.entry_id.to_string(), p.content.clone()))
                        .collect();
                    let text = self
                        .generate(summary_prompt(goal, custom_prompt, &prompt_entries), options)
                        .await?;
                    let new_entry = if last_round {
                        NewEntry { content: text, ..final_entry() }
                    } else {
                        let ids: Vec<Uuid> = group.iter().map(|p| p.entry_id).collect();
                        NewEntry::new(text).with_source_entries(&ids)
                    };
                    self.store_piece(new_entry).await.map(Some)
                }
            });
            pieces = try_join_all(round).await?.into_iter().flatten().collect();
        }

        let summary = pieces
            .pop()
            .ok_or_else(|| Error::Processing("summarization produced no output".into()))?;
        info!(entry_id = %summary.entry_id, rounds = depth, "Summarization complete");
        Ok(ProcessingOutput {
            entry_id: summary.entry_id,
            content: summary.content,
        })
    }

    async fn prompt_entry(&self, entry: &Entry, include_metadata: bool) -> Result<PromptEntry> {
        let prompt_entry = PromptEntry::new(entry.entry_id.to_string(), entry.content.clone());
        if !include_metadata {
            return Ok(prompt_entry);
        }
        let Some((source_type, source_id)) = entry
            .original_of_source
            .as_deref()
            .and_then(|name| name.split_once('/'))
        else {
            return Ok(prompt_entry);
        };
        match self.ctx.repos.sources.get(source_type, source_id).await? {
            Some(source) => Ok(prompt_entry.with_source_metadata(source.source_arguments.to_string())),
            None => Ok(prompt_entry),
        }
    }

    async fn generate(&self, prompt: String, options: &GenerationOptions) -> Result<String> {
        self.ctx
            .generation
            .generate_with_options(&prompt, options)
            .await
    }

    async fn store_piece(&self, entry: NewEntry) -> Result<Piece> {
        let stored = self.store.add(entry).await?;
        Ok(Piece {
            entry_id: stored.entry_id,
            content: stored.content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use omnilake_core::{Deferred, EffectiveOnRule};
    use omnilake_db::memory;
    use omnilake_inference::MockInferenceBackend;

    fn instructions() -> SummarizationInstructions {
        SummarizationInstructions {
            goal: Deferred::Literal("find the facts".into()),
            prompt: None,
            include_source_metadata: false,
            model_id: None,
            effective_on_calculation_rule: EffectiveOnRule::Runtime,
        }
    }

    async fn setup(n: usize) -> (EngineContext, MockInferenceBackend, Vec<Entry>) {
        let backend = MockInferenceBackend::new().with_fixed_response("short summary");
        let ctx = EngineContext::new(
            memory::repositories(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
        );
        let mut entries = Vec::new();
        for i in 0..n {
            let entry = ctx
                .repos
                .entries
                .create(
                    NewEntry::new(format!("document {}", i))
                        .with_effective_on(Utc::now() - Duration::days(i as i64)),
                )
                .await
                .unwrap();
            entries.push(entry);
        }
        (ctx, backend, entries)
    }

    #[tokio::test]
    async fn test_single_entry_is_summarized_once() {
        let (ctx, backend, entries) = setup(1).await;
        let output = Summarizer::new(ctx.clone())
            .summarize(&entries, &instructions())
            .await
            .unwrap();

        assert_eq!(output.content, "short summary");
        assert_eq!(backend.generate_call_count(), 1);
        let stored = ctx.repos.entries.require(output.entry_id).await.unwrap();
        assert_eq!(stored.sources, vec![entries[0].entry_id.to_string()]);
    }

    #[tokio::test]
    async fn test_twelve_entries_take_two_rounds() {
        // 12 individual summaries -> groups of 5,5,2 -> 3 -> 1
        let (ctx, backend, entries) = setup(12).await;
        let mut instr = instructions();
        instr.effective_on_calculation_rule = EffectiveOnRule::Oldest;

        let output = Summarizer::new(ctx.clone())
            .summarize(&entries, &instr)
            .await
            .unwrap();

        assert_eq!(backend.generate_call_count(), 12 + 3 + 1);
        let stored = ctx.repos.entries.require(output.entry_id).await.unwrap();
        assert_eq!(stored.sources.len(), 12);
        let oldest = entries.iter().map(|e| e.effective_on).min().unwrap();
        assert_eq!(stored.effective_on, oldest);
    }

    #[tokio::test]
    async fn test_group_of_one_passes_through() {
        // 6 summaries -> groups of 5 and 1 -> the single passes through -> 2 -> 1
        let (ctx, backend, entries) = setup(6).await;
        Summarizer::new(ctx)
            .summarize(&entries, &instructions())
            .await
            .unwrap();
        assert_eq!(backend.generate_call_count(), 6 + 1 + 1);
    }

    #[tokio::test]
    async fn test_depth_limit_fails() {
        let (ctx, _backend, entries) = setup(9).await;
        let result = Summarizer::new(ctx)
            .with_max_group_size(2)
            .with_max_depth(2)
            .summarize(&entries, &instructions())
            .await;
        assert!(matches!(result, Err(Error::Processing(_))));
    }

    #[tokio::test]
    async fn test_prompt_carries_goal_and_model() {
        let (ctx, backend, entries) = setup(1).await;
        let mut instr = instructions();
        instr.model_id = Some("summary-model".into());
        instr.prompt = Some(Deferred::Literal("CUSTOM INSTRUCTIONS".into()));

        Summarizer::new(ctx).summarize(&entries, &instr).await.unwrap();

        let call = &backend.get_calls()[0];
        assert_eq!(call.model.as_deref(), Some("summary-model"));
        assert!(call.input.starts_with("CUSTOM INSTRUCTIONS\n\nUSER GOAL: find the facts"));
        assert!(call
            .input
            .ends_with(&format!("{}\n\ndocument 0", entries[0].entry_id)));
    }
}
