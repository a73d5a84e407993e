//! Knowledge graph processing: triple extraction, community filtering and a
//! final response over the filtered graph.

use std::collections::{BTreeMap, HashMap};

use futures::future::try_join_all;
use omnilake_core::{
    Entry, Error, GenerationOptions, KnowledgeGraphInstructions, NewEntry, Result,
};
use omnilake_inference::prompts::{extraction_prompt, filter_prompt, graph_response_prompt};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::ProcessingOutput;
use crate::context::EngineContext;
use crate::storage::EntryStore;

/// One directed, labelled relationship.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Relationship {
    pub source: String,
    pub relationship: String,
    pub target: String,
}

impl Relationship {
    /// Parse a `source|relationship|target` line, lower-cased. Anything else
    /// yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim().to_lowercase();
        let mut parts = line.split('|').map(str::trim);
        let (source, relationship, target) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some()
            || source.is_empty()
            || relationship.is_empty()
            || target.is_empty()
        {
            return None;
        }
        Some(Self {
            source: source.to_string(),
            relationship: relationship.to_string(),
            target: target.to_string(),
        })
    }
}

/// Weighted multigraph: repeated relationships add to their weight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeGraph {
    edges: BTreeMap<Relationship, u32>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph of every well-formed line of a model answer.
    pub fn from_model_output(output: &str) -> Self {
        let mut graph = Self::new();
        for line in output.lines() {
            match Relationship::parse(line) {
                Some(relationship) => graph.add(relationship, 1),
                None if !line.trim().is_empty() => trace!(%line, "Ignoring malformed triple"),
                None => {}
            }
        }
        graph
    }

    pub fn add(&mut self, relationship: Relationship, weight: u32) {
        *self.edges.entry(relationship).or_insert(0) += weight;
    }

    pub fn merge(&mut self, other: &KnowledgeGraph) {
        for (relationship, weight) in &other.edges {
            self.add(relationship.clone(), *weight);
        }
    }

    /// Number of distinct relationships.
    pub fn connection_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn weight(&self, source: &str, relationship: &str, target: &str) -> Option<u32> {
        self.edges
            .iter()
            .find(|(r, _)| r.source == source && r.relationship == relationship && r.target == target)
            .map(|(_, w)| *w)
    }

    pub fn node_count(&self) -> usize {
        let mut nodes: Vec<&str> = self
            .edges
            .keys()
            .flat_map(|r| [r.source.as_str(), r.target.as_str()])
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }

    pub fn total_weight(&self) -> u64 {
        self.edges.values().map(|w| u64::from(*w)).sum()
    }

    /// Total weight over `n·(n−1)`; zero below two nodes.
    pub fn density(&self) -> f64 {
        let n = self.node_count() as f64;
        if n < 2.0 {
            return 0.0;
        }
        self.total_weight() as f64 / (n * (n - 1.0))
    }

    /// Copy without relationships lighter than `min_weight`.
    pub fn filter_by_weight(&self, min_weight: u32) -> Self {
        Self {
            edges: self
                .edges
                .iter()
                .filter(|(_, w)| **w >= min_weight)
                .map(|(r, w)| (r.clone(), *w))
                .collect(),
        }
    }

    /// Connected components, densest first.
    pub fn communities(&self) -> Vec<KnowledgeGraph> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for r in self.edges.keys() {
            for node in [r.source.as_str(), r.target.as_str()] {
                let next = index.len();
                index.entry(node).or_insert(next);
            }
        }

        let mut parent: Vec<usize> = (0..index.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        for r in self.edges.keys() {
            let a = find(&mut parent, index[r.source.as_str()]);
            let b = find(&mut parent, index[r.target.as_str()]);
            if a != b {
                parent[a] = b;
            }
        }

        let mut components: BTreeMap<usize, KnowledgeGraph> = BTreeMap::new();
        for (r, w) in &self.edges {
            let root = find(&mut parent, index[r.source.as_str()]);
            components.entry(root).or_default().add(r.clone(), *w);
        }

        let mut communities: Vec<KnowledgeGraph> = components.into_values().collect();
        communities.sort_by(|a, b| {
            b.density()
                .total_cmp(&a.density())
                .then_with(|| b.connection_count().cmp(&a.connection_count()))
                .then_with(|| a.edges.keys().next().cmp(&b.edges.keys().next()))
        });
        communities
    }

    /// One `source -relationship-> target` line per relationship.
    pub fn to_text(&self) -> String {
        self.edges
            .keys()
            .map(|r| format!("{} -{}-> {}", r.source, r.relationship, r.target))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// As [`to_text`](Self::to_text) with `(weight: N)` suffixes.
    pub fn to_weighted_text(&self) -> String {
        self.edges
            .iter()
            .map(|(r, w)| format!("{} -{}-> {} (weight: {})", r.source, r.relationship, r.target, w))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pack communities, largest first, into groups of at most `max_size`
/// connections. A community larger than `max_size` forms its own group.
pub fn group_by_connections(communities: Vec<KnowledgeGraph>, max_size: usize) -> Vec<Vec<KnowledgeGraph>> {
    let mut sorted = communities;
    sorted.sort_by_key(|g| std::cmp::Reverse(g.connection_count()));

    let mut groups = Vec::new();
    let mut current: Vec<KnowledgeGraph> = Vec::new();
    let mut current_size = 0;
    for community in sorted {
        let size = community.connection_count();
        if current_size + size > max_size && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(community);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[derive(Clone)]
pub struct KnowledgeGraphProcessor {
    ctx: EngineContext,
    store: EntryStore,
}

impl KnowledgeGraphProcessor {
    pub fn new(ctx: EngineContext) -> Self {
        let store = EntryStore::new(ctx.clone());
        Self { ctx, store }
    }

    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn process(
        &self,
        entries: &[Entry],
        instructions: &KnowledgeGraphInstructions,
    ) -> Result<ProcessingOutput> {
        let goal = instructions.goal.value()?.as_str();

        let graph = self.extract(entries, goal, instructions).await?;
        let graph = if instructions.minimally_considered_weight > 1 {
            graph.filter_by_weight(instructions.minimally_considered_weight)
        } else {
            graph
        };
        if graph.is_empty() {
            return Err(Error::Processing(
                "knowledge extraction produced no relationships".into(),
            ));
        }
        info!(
            connections = graph.connection_count(),
            nodes = graph.node_count(),
            "Knowledge graph extracted"
        );

        let filtered = self.filter(&graph, goal, instructions).await?;
        let information = if filtered.is_empty() {
            warn!("Filtering removed every relationship; responding from the unfiltered graph");
            graph.to_text()
        } else {
            filtered.to_text()
        };

        let options =
            GenerationOptions::default().with_model(instructions.response_model_id.as_deref());
        let content = self
            .ctx
            .generation
            .generate_with_options(&graph_response_prompt(goal, &information), &options)
            .await?;

        let source_ids: Vec<Uuid> = entries.iter().map(|e| e.entry_id).collect();
        let entry = self
            .store
            .add(NewEntry::new(content).with_source_entries(&source_ids))
            .await?;
        Ok(ProcessingOutput {
            entry_id: entry.entry_id,
            content: entry.content,
        })
    }

    async fn extract(
        &self,
        entries: &[Entry],
        goal: &str,
        instructions: &KnowledgeGraphInstructions,
    ) -> Result<KnowledgeGraph> {
        let options = &GenerationOptions::default()
            .with_model(instructions.knowledge_extraction_model_id.as_deref());
        let focus = instructions.knowledge_extraction_include_goal.then_some(goal);

        let extractions = entries.iter().map(|entry| async move {
            let prompt = extraction_prompt(&entry.content, focus);
            let output = self
                .ctx
                .generation
                .generate_with_options(&prompt, options)
                .await?;
            Ok::<_, Error>(KnowledgeGraph::from_model_output(&output))
        });

        let mut graph = KnowledgeGraph::new();
        for extracted in try_join_all(extractions).await? {
            graph.merge(&extracted);
        }
        Ok(graph)
    }

    async fn filter(
        &self,
        graph: &KnowledgeGraph,
        goal: &str,
        instructions: &KnowledgeGraphInstructions,
    ) -> Result<KnowledgeGraph> {
        let group_texts: Vec<String> =
            if graph.connection_count() < instructions.community_filtering_threshold_min {
                debug!("Graph below community threshold; filtering it whole");
                vec![graph.to_text()]
            } else {
                let communities = graph.communities();
                let percent = instructions.top_n_communities.min(100) as usize;
                let keep = (communities.len() * percent / 100).max(1);
                debug!(communities = communities.len(), keep, "Filtering top communities");
                let kept: Vec<KnowledgeGraph> = communities.into_iter().take(keep).collect();
                group_by_connections(kept, instructions.community_filtering_max_group_size)
                    .into_iter()
                    .map(|group| {
                        group
                            .iter()
                            .map(KnowledgeGraph::to_weighted_text)
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .collect()
            };

        let options =
            &GenerationOptions::default().with_model(instructions.ai_filter_model_id.as_deref());
        let focus = instructions.ai_filter_include_goal.then_some(goal);
        let filters = group_texts.iter().map(|text| async move {
            let output = self
                .ctx
                .generation
                .generate_with_options(&filter_prompt(text, focus), options)
                .await?;
            Ok::<_, Error>(KnowledgeGraph::from_model_output(&output))
        });

        let mut filtered = KnowledgeGraph::new();
        for graph in try_join_all(filters).await? {
            filtered.merge(&graph);
        }
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omnilake_core::Deferred;
    use omnilake_db::memory;
    use omnilake_inference::MockInferenceBackend;

    fn rel(s: &str, r: &str, t: &str) -> Relationship {
        Relationship {
            source: s.into(),
            relationship: r.into(),
            target: t.into(),
        }
    }

    #[test]
    fn test_parse_lowercases_and_rejects_malformed() {
        assert_eq!(
            Relationship::parse("John Smith|Works At|Acme Corp"),
            Some(rel("john smith", "works at", "acme corp"))
        );
        assert_eq!(Relationship::parse("a|b"), None);
        assert_eq!(Relationship::parse("a|b|c|d"), None);
        assert_eq!(Relationship::parse("a||c"), None);
        assert_eq!(Relationship::parse("no pipes here"), None);
    }

    #[test]
    fn test_repeated_triples_add_weight() {
        let mut graph = KnowledgeGraph::from_model_output("a|knows|b\nA|KNOWS|B\nb|likes|c\njunk");
        assert_eq!(graph.connection_count(), 2);
        assert_eq!(graph.weight("a", "knows", "b"), Some(2));

        graph.merge(&KnowledgeGraph::from_model_output("b|likes|c"));
        assert_eq!(graph.weight("b", "likes", "c"), Some(2));
        let heavy = graph.filter_by_weight(2);
        assert_eq!(heavy.connection_count(), 2);
        assert!(graph.filter_by_weight(3).is_empty());
    }

    #[test]
    fn test_communities_are_components_ranked_by_density() {
        // {a,b}: weight 3 over 2 nodes -> 1.5; {x,y,z}: weight 2 over 3 nodes -> 0.33
        let graph = KnowledgeGraph::from_model_output(
            "x|r|y\ny|r|z\na|r|b\na|r|b\na|s|b",
        );
        let communities = graph.communities();
        assert_eq!(communities.len(), 2);
        assert_eq!(communities[0].node_count(), 2);
        assert!((communities[0].density() - 1.5).abs() < f64::EPSILON);
        assert_eq!(communities[1].node_count(), 3);
    }

    #[test]
    fn test_grouping_respects_max_size() {
        let sizes = [4usize, 3, 2, 2, 1];
        let communities: Vec<KnowledgeGraph> = sizes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let mut g = KnowledgeGraph::new();
                for j in 0..*n {
                    g.add(rel(&format!("c{}", i), &format!("r{}", j), "t"), 1);
                }
                g
            })
            .collect();

        let groups = group_by_connections(communities, 5);
        let totals: Vec<usize> = groups
            .iter()
            .map(|g| g.iter().map(KnowledgeGraph::connection_count).sum())
            .collect();
        assert_eq!(totals, vec![4, 5, 3]);
    }

    #[test]
    fn test_text_rendering() {
        let graph = KnowledgeGraph::from_model_output("a|knows|b\na|knows|b");
        assert_eq!(graph.to_text(), "a -knows-> b");
        assert_eq!(graph.to_weighted_text(), "a -knows-> b (weight: 2)");
    }

    fn instructions() -> KnowledgeGraphInstructions {
        serde_json::from_value(serde_json::json!({"goal": "who works where"})).unwrap()
    }

    #[tokio::test]
    async fn test_process_extracts_filters_and_responds() {
        let backend = MockInferenceBackend::new()
            .with_response_mapping("Extract knowledge", "alice|works at|acme\nbob|works at|acme")
            .with_response_mapping("Filter and clean", "alice|works at|acme")
            .with_fixed_response("Alice works at Acme.");
        let ctx = EngineContext::new(
            memory::repositories(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
        );
        let entry = ctx
            .repos
            .entries
            .create(NewEntry::new("Alice and Bob both work at Acme."))
            .await
            .unwrap();

        let output = KnowledgeGraphProcessor::new(ctx.clone())
            .process(std::slice::from_ref(&entry), &instructions())
            .await
            .unwrap();

        assert_eq!(output.content, "Alice works at Acme.");
        assert_eq!(backend.generate_call_count(), 3);
        let last = backend.get_calls().pop().unwrap();
        assert!(last.input.contains("alice -works at-> acme"));
        assert!(!last.input.contains("bob"));
        let stored = ctx.repos.entries.require(output.entry_id).await.unwrap();
        assert_eq!(stored.sources, vec![entry.entry_id.to_string()]);
    }

    #[tokio::test]
    async fn test_process_without_relationships_fails() {
        let backend = MockInferenceBackend::new().with_fixed_response("nothing useful");
        let ctx = EngineContext::new(
            memory::repositories(),
            Arc::new(backend.clone()),
            Arc::new(backend),
        );
        let entry = ctx.repos.entries.create(NewEntry::new("text")).await.unwrap();
        let mut instr = instructions();
        instr.goal = Deferred::Literal("g".into());

        let result = KnowledgeGraphProcessor::new(ctx)
            .process(&[entry], &instr)
            .await;
        assert!(matches!(result, Err(Error::Processing(_))));
    }
}
