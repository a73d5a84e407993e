//! Processing instructions: how gathered entries become response content.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::chain::LakeChainStep;
use super::deferred::{collect, Deferred, HasReferences, ResolvedValues, StepReference};
use super::lake_request::PlaceholderPolicy;
use super::EffectiveOnRule;
use crate::defaults;
use crate::{Error, Result};

/// Processing stage, tagged by `processor_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "processor_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingInstructions {
    Summarization(SummarizationInstructions),
    KnowledgeGraph(KnowledgeGraphInstructions),
    Inception(InceptionInstructions),
}

impl ProcessingInstructions {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Summarization(_) => "SUMMARIZATION",
            Self::KnowledgeGraph(_) => "KNOWLEDGE_GRAPH",
            Self::Inception(_) => "INCEPTION",
        }
    }

    /// Summarize with only a goal.
    pub fn summarize(goal: impl Into<String>) -> Self {
        Self::Summarization(SummarizationInstructions {
            goal: Deferred::Literal(goal.into()),
            prompt: None,
            include_source_metadata: false,
            model_id: None,
            effective_on_calculation_rule: EffectiveOnRule::default(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Summarization(s) => require_text("SUMMARIZATION", "goal", &s.goal),
            Self::KnowledgeGraph(kg) => {
                require_text("KNOWLEDGE_GRAPH", "goal", &kg.goal)?;
                if kg.top_n_communities == 0 || kg.top_n_communities > 100 {
                    return Err(Error::Validation(
                        "KNOWLEDGE_GRAPH processor: top_n_communities must be a percentage in 1..=100"
                            .into(),
                    ));
                }
                if kg.community_filtering_max_group_size == 0 {
                    return Err(Error::Validation(
                        "KNOWLEDGE_GRAPH processor: community_filtering_max_group_size must be positive"
                            .into(),
                    ));
                }
                Ok(())
            }
            Self::Inception(inception) => inception.validate(),
        }
    }
}

fn require_text(kind: &str, field: &str, value: &Deferred<String>) -> Result<()> {
    match value {
        Deferred::Literal(s) if s.trim().is_empty() => Err(Error::Validation(format!(
            "{} processor: {} is required",
            kind, field
        ))),
        _ => Ok(()),
    }
}

/// Recursive summarization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationInstructions {
    pub goal: Deferred<String>,
    #[serde(default)]
    pub prompt: Option<Deferred<String>>,
    #[serde(default)]
    pub include_source_metadata: bool,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub effective_on_calculation_rule: EffectiveOnRule,
}

/// Knowledge graph extraction and filtering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraphInstructions {
    pub goal: Deferred<String>,
    #[serde(default)]
    pub ai_filter_include_goal: bool,
    #[serde(default)]
    pub ai_filter_model_id: Option<String>,
    #[serde(default = "default_threshold_min")]
    pub community_filtering_threshold_min: usize,
    #[serde(default = "default_max_group_size")]
    pub community_filtering_max_group_size: usize,
    #[serde(default)]
    pub knowledge_extraction_include_goal: bool,
    #[serde(default)]
    pub knowledge_extraction_model_id: Option<String>,
    #[serde(default = "default_min_weight")]
    pub minimally_considered_weight: u32,
    #[serde(default)]
    pub response_model_id: Option<String>,
    /// Percentage of the densest communities kept.
    #[serde(default = "default_top_n")]
    pub top_n_communities: u32,
}

fn default_threshold_min() -> usize {
    defaults::KG_COMMUNITY_THRESHOLD_MIN
}

fn default_max_group_size() -> usize {
    defaults::KG_COMMUNITY_MAX_GROUP_SIZE
}

fn default_min_weight() -> u32 {
    defaults::KG_MINIMALLY_CONSIDERED_WEIGHT
}

fn default_top_n() -> u32 {
    defaults::KG_TOP_N_COMMUNITIES_PERCENT
}

/// How an inception processor hands entries to its sub-chains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryDistributionMode {
    /// One sub-chain over every source entry.
    #[default]
    All,
    /// One sub-chain per source entry.
    Individual,
}

/// Processing by sub-chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InceptionInstructions {
    pub chain_definition: Vec<LakeChainStep>,
    #[serde(default)]
    pub entry_distribution_mode: EntryDistributionMode,
    #[serde(default)]
    pub join_instructions: Option<Box<ProcessingInstructions>>,
}

impl InceptionInstructions {
    /// Name of the step whose response is exported.
    pub fn export_step(&self) -> Option<&str> {
        self.chain_definition
            .iter()
            .find(|s| s.lake_request.response_config.is_export())
            .map(|s| s.name.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_definition.is_empty() {
            return Err(Error::Validation(
                "INCEPTION processor: chain_definition is required".into(),
            ));
        }
        let exports = self
            .chain_definition
            .iter()
            .filter(|s| s.lake_request.response_config.is_export())
            .count();
        if exports != 1 {
            return Err(Error::Validation(format!(
                "INCEPTION processor: chain_definition must contain exactly one EXPORT_RESPONSE step, found {}",
                exports
            )));
        }
        for step in &self.chain_definition {
            step.lake_request.validate(PlaceholderPolicy::Permitted)?;
        }
        if let Some(join) = &self.join_instructions {
            join.validate()?;
        }
        Ok(())
    }

    /// Whether the source set needs a join chain under this mode.
    pub fn requires_join(&self, source_count: usize) -> bool {
        self.entry_distribution_mode == EntryDistributionMode::Individual && source_count > 1
    }

    /// The sub-chain definition for one branch, with placeholders rewritten:
    /// PARENT_CHAIN_ENTRIES becomes a lookup over `entries`, EXPORT_RESPONSE
    /// becomes DIRECT.
    pub fn branch_definition(&self, entries: &[Uuid]) -> Vec<LakeChainStep> {
        self.chain_definition
            .iter()
            .cloned()
            .map(|mut step| {
                step.lake_request.replace_placeholders(entries);
                step
            })
            .collect()
    }
}

impl HasReferences for ProcessingInstructions {
    /// References inside an inception chain definition address the
    /// sub-chain's own steps and are resolved there.
    fn references(&self) -> Vec<&StepReference> {
        let mut out = Vec::new();
        match self {
            Self::Summarization(s) => {
                collect(Some(&s.goal), &mut out);
                collect(s.prompt.as_ref(), &mut out);
            }
            Self::KnowledgeGraph(kg) => collect(Some(&kg.goal), &mut out),
            Self::Inception(_) => {}
        }
        out
    }

    fn resolve_references(&mut self, values: &ResolvedValues) -> Result<()> {
        match self {
            Self::Summarization(s) => {
                s.goal.resolve(values)?;
                if let Some(prompt) = s.prompt.as_mut() {
                    prompt.resolve(values)?;
                }
                Ok(())
            }
            Self::KnowledgeGraph(kg) => kg.goal.resolve(values),
            Self::Inception(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inception_json(export_steps: usize) -> serde_json::Value {
        let steps: Vec<_> = (0..export_steps.max(1))
            .map(|i| {
                json!({
                    "name": format!("step_{i}"),
                    "lake_request": {
                        "lookup_instructions": [{"request_type": "PARENT_CHAIN_ENTRIES"}],
                        "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"},
                        "response_config": {"response_type": if i < export_steps { "EXPORT_RESPONSE" } else { "DIRECT" }}
                    }
                })
            })
            .collect();
        json!({"processor_type": "INCEPTION", "chain_definition": steps})
    }

    #[test]
    fn test_summarization_defaults() {
        let p: ProcessingInstructions =
            serde_json::from_value(json!({"processor_type": "SUMMARIZATION", "goal": "explain"}))
                .unwrap();
        match &p {
            ProcessingInstructions::Summarization(s) => {
                assert!(!s.include_source_metadata);
                assert_eq!(s.effective_on_calculation_rule, EffectiveOnRule::Runtime);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_knowledge_graph_defaults() {
        let p: ProcessingInstructions =
            serde_json::from_value(json!({"processor_type": "KNOWLEDGE_GRAPH", "goal": "map"}))
                .unwrap();
        match p {
            ProcessingInstructions::KnowledgeGraph(kg) => {
                assert_eq!(kg.community_filtering_threshold_min, 50);
                assert_eq!(kg.community_filtering_max_group_size, 150);
                assert_eq!(kg.minimally_considered_weight, 1);
                assert_eq!(kg.top_n_communities, 80);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_goal_rejected() {
        let p = ProcessingInstructions::summarize("   ");
        assert!(matches!(p.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_inception_requires_exactly_one_export() {
        let one: ProcessingInstructions = serde_json::from_value(inception_json(1)).unwrap();
        assert!(one.validate().is_ok());
        let none: ProcessingInstructions = serde_json::from_value(inception_json(0)).unwrap();
        assert!(none.validate().is_err());
        let two: ProcessingInstructions = serde_json::from_value(inception_json(2)).unwrap();
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_inception_references_are_not_collected() {
        let p: ProcessingInstructions = serde_json::from_value(json!({
            "processor_type": "INCEPTION",
            "chain_definition": [{
                "name": "inner",
                "lake_request": {
                    "lookup_instructions": [{"request_type": "DIRECT_ENTRY", "entry_id": "REF:x.response_id"}],
                    "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"},
                    "response_config": {"response_type": "EXPORT_RESPONSE"}
                }
            }]
        }))
        .unwrap();
        assert!(p.references().is_empty());
    }

    #[test]
    fn test_branch_definition_rewrites_placeholders() {
        let p: ProcessingInstructions = serde_json::from_value(inception_json(1)).unwrap();
        let ProcessingInstructions::Inception(inception) = p else {
            panic!("expected inception");
        };
        let entries = vec![Uuid::new_v4()];
        let steps = inception.branch_definition(&entries);
        let body = &steps[0].lake_request;
        assert!(!body.response_config.is_export());
        assert!(!body.lookup_instructions[0].is_placeholder());
        assert_eq!(inception.export_step(), Some("step_0"));
    }

    #[test]
    fn test_requires_join() {
        let mut inception = InceptionInstructions {
            chain_definition: vec![],
            entry_distribution_mode: EntryDistributionMode::All,
            join_instructions: None,
        };
        assert!(!inception.requires_join(3));
        inception.entry_distribution_mode = EntryDistributionMode::Individual;
        assert!(!inception.requires_join(1));
        assert!(inception.requires_join(2));
    }
}
