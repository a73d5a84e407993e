//! Synchronous checks run when a chain is submitted.
//!
//! Everything rejected here is rejected before any job exists, so nothing
//! malformed ever enters the event pipeline.

use std::collections::HashMap;

use omnilake_core::{
    effective_conditional, Error, HasReferences, LakeChainStep, PlaceholderPolicy,
    ProcessingInstructions, Result, ValidationDirective,
};
use tracing::{debug, info, warn};

/// Facts about an accepted chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainAnalysis {
    /// Per step, whether it may end up skipped.
    pub effective_conditional: Vec<bool>,
    /// Accepted but suspicious configuration.
    pub warnings: Vec<String>,
}

fn step_error(step: &str, e: Error) -> Error {
    match e {
        Error::Validation(msg) => Error::Validation(format!("step '{}': {}", step, msg)),
        other => other,
    }
}

/// Validate a chain definition. Top-level chains use
/// [`PlaceholderPolicy::Forbidden`]; inception definitions nested in a step
/// are checked recursively with placeholders permitted.
pub fn validate_chain(
    steps: &[LakeChainStep],
    placeholders: PlaceholderPolicy,
) -> Result<ChainAnalysis> {
    if steps.is_empty() {
        return Err(Error::Validation(
            "a chain must contain at least one step".into(),
        ));
    }

    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(Error::Validation(format!("step {} has no name", i)));
        }
        if positions.insert(step.name.as_str(), i).is_some() {
            return Err(Error::Validation(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
    }

    let mut warnings = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        step.lake_request
            .validate(placeholders)
            .map_err(|e| step_error(&step.name, e))?;

        for reference in step.lake_request.references() {
            match positions.get(reference.step_name.as_str()) {
                None => {
                    return Err(Error::Validation(format!(
                        "step '{}': {} names an unknown step",
                        step.name, reference
                    )))
                }
                Some(&j) if j >= i => {
                    return Err(Error::Validation(format!(
                        "step '{}': {} must name a step declared earlier",
                        step.name, reference
                    )))
                }
                Some(_) => {}
            }
            reference.field().map_err(|e| step_error(&step.name, e))?;
        }

        if let ProcessingInstructions::Inception(inception) =
            &step.lake_request.processing_instructions
        {
            let nested = validate_chain(&inception.chain_definition, PlaceholderPolicy::Permitted)
                .map_err(|e| step_error(&step.name, e))?;
            warnings.extend(
                nested
                    .warnings
                    .into_iter()
                    .map(|w| format!("step '{}': {}", step.name, w)),
            );
        }

        let Some(validation) = &step.validation else {
            continue;
        };
        if validation.is_noop() {
            info!(
                step_name = %step.name,
                "Validation block sets neither on_success nor on_failure; it has no effect"
            );
            continue;
        }
        for directive in [&validation.on_success, &validation.on_failure]
            .into_iter()
            .flatten()
        {
            let ValidationDirective::ExecuteChainStep(target) = directive else {
                continue;
            };
            match positions.get(target.as_str()) {
                None => {
                    return Err(Error::Validation(format!(
                        "step '{}': validation targets unknown step '{}'",
                        step.name, target
                    )))
                }
                Some(&j) if j <= i => {
                    return Err(Error::Validation(format!(
                        "step '{}': validation target '{}' must be declared later",
                        step.name, target
                    )))
                }
                Some(&j) if !steps[j].conditional => {
                    let warning = format!(
                        "step '{}': validation target '{}' is not conditional and runs regardless",
                        step.name, target
                    );
                    warn!(step_name = %step.name, %target, "Validation targets a non-conditional step");
                    warnings.push(warning);
                }
                Some(_) => {}
            }
        }
    }

    let effective = effective_conditional(steps);
    for (step, inherited) in steps.iter().zip(&effective) {
        if *inherited && !step.conditional {
            debug!(step_name = %step.name, "Step is conditional through its references");
        }
    }

    Ok(ChainAnalysis {
        effective_conditional: effective,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn steps(value: Value) -> Vec<LakeChainStep> {
        serde_json::from_value(value).unwrap()
    }

    fn step(name: &str) -> Value {
        json!({
            "name": name,
            "lake_request": {
                "lookup_instructions": [{"request_type": "BASIC", "archive_id": "docs"}],
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"}
            }
        })
    }

    fn assert_rejected(chain: Value, needle: &str) {
        match validate_chain(&steps(chain), PlaceholderPolicy::Forbidden) {
            Err(Error::Validation(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("expected validation error containing {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_simple_chain() {
        let mut b = step("b");
        b["lake_request"]["processing_instructions"]["goal"] = json!("REF:a.response_body");
        let analysis =
            validate_chain(&steps(json!([step("a"), b])), PlaceholderPolicy::Forbidden).unwrap();
        assert_eq!(analysis.effective_conditional, vec![false, false]);
        assert!(analysis.warnings.is_empty());
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert_rejected(json!([]), "at least one step");
        assert_rejected(json!([step("a"), step("a")]), "duplicate step name 'a'");
    }

    #[test]
    fn test_rejects_forward_and_unknown_references() {
        let mut a = step("a");
        a["lake_request"]["processing_instructions"]["goal"] = json!("REF:b.response_body");
        assert_rejected(json!([a, step("b")]), "declared earlier");

        let mut b = step("b");
        b["lake_request"]["processing_instructions"]["goal"] = json!("REF:zzz.response_body");
        assert_rejected(json!([step("a"), b]), "unknown step");
    }

    #[test]
    fn test_rejects_unknown_reference_field() {
        let mut b = step("b");
        b["lake_request"]["processing_instructions"]["goal"] = json!("REF:a.nonsense");
        assert_rejected(json!([step("a"), b]), "unknown reference field");
    }

    #[test]
    fn test_directive_targets_must_be_later() {
        let mut a = step("a");
        a["validation"] = json!({"prompt": "ok?", "on_success": {"execute_chain_step": "a"}});
        assert_rejected(json!([a]), "declared later");

        let mut b = step("b");
        b["validation"] = json!({"prompt": "ok?", "on_failure": {"execute_chain_step": "missing"}});
        assert_rejected(json!([step("a"), b]), "unknown step 'missing'");
    }

    #[test]
    fn test_non_conditional_target_warns() {
        let mut a = step("a");
        a["validation"] = json!({"prompt": "ok?", "on_success": {"execute_chain_step": "b"}});
        let analysis =
            validate_chain(&steps(json!([a, step("b")])), PlaceholderPolicy::Forbidden).unwrap();
        assert_eq!(analysis.warnings.len(), 1);
        assert!(analysis.warnings[0].contains("not conditional"));
    }

    #[test]
    fn test_noop_validation_is_accepted() {
        let mut a = step("a");
        a["validation"] = json!({"prompt": "ok?"});
        assert!(validate_chain(&steps(json!([a])), PlaceholderPolicy::Forbidden).is_ok());
    }

    #[test]
    fn test_placeholders_rejected_at_top_level() {
        let mut a = step("a");
        a["lake_request"]["lookup_instructions"] = json!([{"request_type": "PARENT_CHAIN_ENTRIES"}]);
        assert_rejected(json!([a]), "step 'a'");
    }

    #[test]
    fn test_nested_inception_definition_is_checked() {
        let inner_bad = json!({
            "name": "inner",
            "lake_request": {
                "lookup_instructions": [{"request_type": "PARENT_CHAIN_ENTRIES"}],
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "REF:ghost.response_body"},
                "response_config": {"response_type": "EXPORT_RESPONSE"}
            }
        });
        let outer = json!([{
            "name": "outer",
            "lake_request": {
                "lookup_instructions": [{"request_type": "BASIC", "archive_id": "docs"}],
                "processing_instructions": {
                    "processor_type": "INCEPTION",
                    "chain_definition": [inner_bad]
                }
            }
        }]);
        assert_rejected(outer, "unknown step");
    }

    #[test]
    fn test_transitive_conditionality_reported() {
        let mut b = step("b");
        b["conditional"] = json!(true);
        let mut c = step("c");
        c["lake_request"]["processing_instructions"]["goal"] = json!("REF:b.response_body");
        let analysis =
            validate_chain(&steps(json!([step("a"), b, c])), PlaceholderPolicy::Forbidden)
                .unwrap();
        assert_eq!(analysis.effective_conditional, vec![false, true, true]);
    }
}
