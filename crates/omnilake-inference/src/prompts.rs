//! Fixed prompt formats.
//!
//! Every prompt is a list of sections joined by blank lines. Custom prompts
//! supplied in a request replace only the leading instruction section.

/// Default instructions for the summarization processor.
pub const DEFAULT_SUMMARY_PROMPT: &str = "\
You summarize content for a stated user goal. Extract only the facts, \
figures, insights and findings that serve the goal and discard everything \
else. Keep the detail and accuracy of the original while being concise. \
Reply with the summary only.";

/// Default instructions for SIMPLE responses.
pub const DEFAULT_RESPONSE_PROMPT: &str = "\
Using only the content provided, write a response that achieves the user's \
goal. Be clear, accurate and relevant, and follow any instructions in the \
goal. If the content is not sufficient, reply exactly \
\"Insufficient information for response\".";

/// Instructions for the validation judge.
pub const JUDGE_PROMPT: &str = "\
Given validation instructions followed by content to review, decide whether \
the content meets ALL of the validation criteria.

Respond ONLY with:
- \"SUCCESS\" if the content meets ALL validation criteria
- \"FAILURE\" if the content fails ANY validation criterion";

/// Instructions for knowledge extraction.
pub const EXTRACTION_PROMPT: &str = "\
Extract knowledge from the text below as triples, one per line, in the form:
Entity1|Relationship|Entity2

The first and last elements are nouns or noun phrases, the middle element \
is a verb phrase. Capture names, roles, organizations, locations, dates and \
quantities when present. Output ONLY triples, with no other text.

Example:
John Smith|works at|Acme Corp
Acme Corp|located in|New York";

/// Instructions for knowledge graph filtering.
pub const FILTER_PROMPT: &str = "\
Filter and clean the knowledge graph below. Remove relationships that add \
no useful information, resolve contradictions in favour of the higher \
weight, and merge relationships that say the same thing.

Input lines look like: node1 -relationship-> node2 (weight: N)
Output one triple per line as node1|relationship|node2, and nothing else. \
Output nothing if no useful information remains.";

/// Instructions for the knowledge graph final response.
pub const GRAPH_RESPONSE_PROMPT: &str = "\
Given the information below, respond in the way that best achieves the \
user's goal.";

/// Section headings.
pub const USER_GOAL_HEADING: &str = "USER GOAL:";
pub const SOURCE_METADATA_HEADING: &str = "SOURCE METADATA:";
pub const CONTENT_HEADING: &str = "CONTENT:";
pub const RESPONSE_CONTENT_HEADING: &str = "CONTENT TO USE FOR RESPONSE:";
pub const VALIDATION_INSTRUCTIONS_HEADING: &str = "VALIDATION INSTRUCTIONS:";
pub const CONTENT_TO_VALIDATE_HEADING: &str = "CONTENT TO VALIDATE:";

const SECTION_SEPARATOR: &str = "\n\n";

/// One entry rendered into a summary prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptEntry {
    pub entry_id: String,
    pub content: String,
    /// Source arguments of the entry's origin, pre-rendered.
    pub source_metadata: Option<String>,
}

impl PromptEntry {
    pub fn new(entry_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            content: content.into(),
            source_metadata: None,
        }
    }

    pub fn with_source_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.source_metadata = Some(metadata.into());
        self
    }

    fn render(&self) -> String {
        match &self.source_metadata {
            Some(metadata) => format!(
                "{}\n\n{}\n\n{}\n\n{}\n\n{}",
                self.entry_id, SOURCE_METADATA_HEADING, metadata, CONTENT_HEADING, self.content
            ),
            None => format!("{}\n\n{}", self.entry_id, self.content),
        }
    }
}

fn join(sections: &[&str]) -> String {
    sections.join(SECTION_SEPARATOR)
}

/// Summary prompt over one or more entries.
pub fn summary_prompt(goal: &str, custom_prompt: Option<&str>, entries: &[PromptEntry]) -> String {
    let goal = format!("{} {}", USER_GOAL_HEADING, goal);
    let rendered: Vec<String> = entries.iter().map(PromptEntry::render).collect();
    let mut sections = vec![custom_prompt.unwrap_or(DEFAULT_SUMMARY_PROMPT), goal.as_str()];
    sections.extend(rendered.iter().map(String::as_str));
    join(&sections)
}

/// SIMPLE responder prompt.
pub fn response_prompt(goal: &str, custom_prompt: Option<&str>, content: &str) -> String {
    let goal = format!("{} {}", USER_GOAL_HEADING, goal);
    join(&[
        custom_prompt.unwrap_or(DEFAULT_RESPONSE_PROMPT),
        &goal,
        RESPONSE_CONTENT_HEADING,
        content,
    ])
}

/// Validation judge prompt.
pub fn judge_prompt(instructions: &str, content: &str) -> String {
    join(&[
        JUDGE_PROMPT,
        VALIDATION_INSTRUCTIONS_HEADING,
        instructions,
        CONTENT_TO_VALIDATE_HEADING,
        content,
    ])
}

/// Triple extraction prompt for one entry.
pub fn extraction_prompt(content: &str, goal: Option<&str>) -> String {
    match goal {
        Some(goal) => {
            let focus = format!(
                "Focus on knowledge that helps with the user's stated goal: \"{}\"",
                goal
            );
            join(&[EXTRACTION_PROMPT, &focus, content])
        }
        None => join(&[EXTRACTION_PROMPT, content]),
    }
}

/// Filtering prompt for a rendered graph.
pub fn filter_prompt(graph: &str, goal: Option<&str>) -> String {
    match goal {
        Some(goal) => {
            let focus = format!(
                "Keep the information that helps with the user's stated goal: \"{}\"",
                goal
            );
            join(&[FILTER_PROMPT, &focus, graph])
        }
        None => join(&[FILTER_PROMPT, graph]),
    }
}

/// Final knowledge graph response prompt.
pub fn graph_response_prompt(goal: &str, information: &str) -> String {
    let goal = format!("Goal:\n{}", goal);
    let information = format!("Information:\n{}", information);
    join(&[GRAPH_RESPONSE_PROMPT, &goal, &information])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_prompt_layout() {
        let prompt = summary_prompt(
            "find risks",
            None,
            &[PromptEntry::new("e1", "alpha"), PromptEntry::new("e2", "beta")],
        );
        let expected = format!(
            "{}\n\nUSER GOAL: find risks\n\ne1\n\nalpha\n\ne2\n\nbeta",
            DEFAULT_SUMMARY_PROMPT
        );
        assert_eq!(prompt, expected);
    }

    #[test]
    fn test_summary_prompt_custom_and_metadata() {
        let entry = PromptEntry::new("e1", "page text").with_source_metadata("{\"url\":\"u\"}");
        let prompt = summary_prompt("g", Some("CUSTOM"), &[entry]);
        assert!(prompt.starts_with("CUSTOM\n\nUSER GOAL: g\n\n"));
        assert!(prompt.ends_with(
            "e1\n\nSOURCE METADATA:\n\n{\"url\":\"u\"}\n\nCONTENT:\n\npage text"
        ));
        assert!(!prompt.contains(DEFAULT_SUMMARY_PROMPT));
    }

    #[test]
    fn test_response_prompt_layout() {
        let prompt = response_prompt("answer", None, "facts");
        assert_eq!(
            prompt,
            format!(
                "{}\n\nUSER GOAL: answer\n\nCONTENT TO USE FOR RESPONSE:\n\nfacts",
                DEFAULT_RESPONSE_PROMPT
            )
        );
    }

    #[test]
    fn test_judge_prompt_layout() {
        let prompt = judge_prompt("mentions cats", "a cat sat");
        assert!(prompt.starts_with(JUDGE_PROMPT));
        assert!(prompt.ends_with(
            "VALIDATION INSTRUCTIONS:\n\nmentions cats\n\nCONTENT TO VALIDATE:\n\na cat sat"
        ));
    }

    #[test]
    fn test_goal_sections_are_optional() {
        assert!(!extraction_prompt("text", None).contains("stated goal"));
        assert!(extraction_prompt("text", Some("g")).contains("\"g\""));
        assert!(filter_prompt("a -b-> c (weight: 1)", Some("g")).ends_with("a -b-> c (weight: 1)"));
        assert!(graph_response_prompt("g", "info").ends_with("Information:\ninfo"));
    }
}
