//! Response configuration: what happens to processed content.

use serde::{Deserialize, Serialize};

use super::deferred::{collect, Deferred, HasReferences, ResolvedValues, StepReference};
use super::lake_request::PlaceholderPolicy;
use crate::{Error, Result};

/// Response stage, tagged by `response_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseConfig {
    /// Processed content is the response.
    Direct {
        #[serde(default)]
        destination_archive_id: Option<String>,
    },
    /// A fresh synthesis keyed on a goal.
    Simple {
        goal: Deferred<String>,
        #[serde(default)]
        prompt: Option<Deferred<String>>,
        #[serde(default)]
        model_id: Option<String>,
        #[serde(default)]
        destination_archive_id: Option<String>,
    },
    /// Processed content surrounded by fixed text.
    Wrap {
        #[serde(default)]
        prepend_text: Option<Deferred<String>>,
        #[serde(default)]
        append_text: Option<Deferred<String>>,
        #[serde(default)]
        separator: Option<String>,
        #[serde(default)]
        destination_archive_id: Option<String>,
    },
    /// Placeholder marking the exported step of an inception chain.
    ExportResponse,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self::Direct {
            destination_archive_id: None,
        }
    }
}

impl ResponseConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "DIRECT",
            Self::Simple { .. } => "SIMPLE",
            Self::Wrap { .. } => "WRAP",
            Self::ExportResponse => "EXPORT_RESPONSE",
        }
    }

    pub fn destination_archive_id(&self) -> Option<&str> {
        match self {
            Self::Direct {
                destination_archive_id,
            }
            | Self::Simple {
                destination_archive_id,
                ..
            }
            | Self::Wrap {
                destination_archive_id,
                ..
            } => destination_archive_id.as_deref(),
            Self::ExportResponse => None,
        }
    }

    pub fn is_export(&self) -> bool {
        matches!(self, Self::ExportResponse)
    }

    pub fn validate(&self, placeholders: PlaceholderPolicy) -> Result<()> {
        match self {
            Self::Simple {
                goal: Deferred::Literal(goal),
                ..
            } if goal.trim().is_empty() => Err(Error::Validation(
                "SIMPLE response: goal is required".into(),
            )),
            Self::ExportResponse if placeholders == PlaceholderPolicy::Forbidden => {
                Err(Error::Validation(
                    "EXPORT_RESPONSE is only valid inside an INCEPTION chain definition".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl HasReferences for ResponseConfig {
    fn references(&self) -> Vec<&StepReference> {
        let mut out = Vec::new();
        match self {
            Self::Simple { goal, prompt, .. } => {
                collect(Some(goal), &mut out);
                collect(prompt.as_ref(), &mut out);
            }
            Self::Wrap {
                prepend_text,
                append_text,
                ..
            } => {
                collect(prepend_text.as_ref(), &mut out);
                collect(append_text.as_ref(), &mut out);
            }
            Self::Direct { .. } | Self::ExportResponse => {}
        }
        out
    }

    fn resolve_references(&mut self, values: &ResolvedValues) -> Result<()> {
        match self {
            Self::Simple { goal, prompt, .. } => {
                goal.resolve(values)?;
                if let Some(p) = prompt.as_mut() {
                    p.resolve(values)?;
                }
            }
            Self::Wrap {
                prepend_text,
                append_text,
                ..
            } => {
                for text in [prepend_text, append_text].into_iter().flatten() {
                    text.resolve(values)?;
                }
            }
            Self::Direct { .. } | Self::ExportResponse => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_is_direct_without_destination() {
        let cfg = ResponseConfig::default();
        assert_eq!(cfg.kind(), "DIRECT");
        assert!(cfg.destination_archive_id().is_none());
    }

    #[test]
    fn test_wrap_deserialize() {
        let cfg: ResponseConfig = serde_json::from_value(json!({
            "response_type": "WRAP",
            "prepend_text": "<<",
            "append_text": "REF:a.response_body",
            "destination_archive_id": "out"
        }))
        .unwrap();
        assert_eq!(cfg.destination_archive_id(), Some("out"));
        assert_eq!(cfg.references().len(), 1);
    }

    #[test]
    fn test_export_placeholder_policy() {
        let cfg: ResponseConfig =
            serde_json::from_value(json!({"response_type": "EXPORT_RESPONSE"})).unwrap();
        assert!(cfg.is_export());
        assert!(cfg.validate(PlaceholderPolicy::Forbidden).is_err());
        assert!(cfg.validate(PlaceholderPolicy::Permitted).is_ok());
    }

    #[test]
    fn test_simple_requires_goal() {
        let cfg = ResponseConfig::Simple {
            goal: Deferred::Literal(String::new()),
            prompt: None,
            model_id: None,
            destination_archive_id: None,
        };
        assert!(cfg.validate(PlaceholderPolicy::Forbidden).is_err());
    }
}
