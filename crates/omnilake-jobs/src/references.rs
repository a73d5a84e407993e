//! Resolution of `REF:` fields against earlier chain steps.

use std::collections::HashMap;

use omnilake_core::{
    ChainRequest, Error, HasReferences, JobStatus, LakeRequest, LakeRequestBody, ReferenceField,
    ResolvedValues, Result, StepReference,
};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::context::EngineContext;

/// Outcome of resolving a step body.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every reference replaced; ready to submit.
    Resolved(LakeRequestBody),
    /// A referenced step did not run or produced nothing; the step is skipped.
    Unresolvable { reference: String, reason: String },
}

#[derive(Clone)]
pub struct ReferenceResolver {
    ctx: EngineContext,
}

impl ReferenceResolver {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Resolve every reference in `body` against the chain's executed steps.
    ///
    /// Missing dependencies yield [`Resolution::Unresolvable`]. A path that
    /// does not exist in a produced value, or a value of the wrong type, is
    /// a `Reference` error.
    pub async fn resolve(
        &self,
        chain: &ChainRequest,
        body: &LakeRequestBody,
    ) -> Result<Resolution> {
        let references: Vec<StepReference> = body.references().into_iter().cloned().collect();
        if references.is_empty() {
            return Ok(Resolution::Resolved(body.clone()));
        }

        let mut requests: HashMap<Uuid, LakeRequest> = HashMap::new();
        let mut values = ResolvedValues::new();
        for reference in references {
            if values.contains_key(&reference) {
                continue;
            }
            let Some(lake_request_id) = chain.executed_requests.get(&reference.step_name) else {
                return Ok(unresolvable(
                    &reference,
                    format!("step '{}' was not executed", reference.step_name),
                ));
            };
            if !requests.contains_key(lake_request_id) {
                let request = self.ctx.repos.lake_requests.require(*lake_request_id).await?;
                requests.insert(*lake_request_id, request);
            }
            let Some(request) = requests.get(lake_request_id) else {
                continue;
            };

            let field = reference.field()?;
            if field.requires_completion() && request.request_status != JobStatus::Completed {
                return Ok(unresolvable(
                    &reference,
                    format!(
                        "step '{}' has not completed (status {})",
                        reference.step_name, request.request_status
                    ),
                ));
            }
            let Some(value) = self.field_value(request, field).await? else {
                return Ok(unresolvable(
                    &reference,
                    format!("step '{}' produced no response", reference.step_name),
                ));
            };
            let value = navigate(value, reference.nested_path())
                .map_err(|e| Error::Reference(format!("{}: {}", reference, e)))?;
            debug!(%reference, "Resolved reference");
            values.insert(reference, value);
        }

        let mut resolved = body.clone();
        resolved.resolve_references(&values)?;
        Ok(Resolution::Resolved(resolved))
    }

    async fn field_value(
        &self,
        request: &LakeRequest,
        field: ReferenceField,
    ) -> Result<Option<JsonValue>> {
        let value = match field {
            ReferenceField::LakeRequestId => {
                Some(JsonValue::String(request.lake_request_id.to_string()))
            }
            ReferenceField::RequestStatus => {
                Some(JsonValue::String(request.request_status.as_str().to_string()))
            }
            ReferenceField::ResponseSources => Some(JsonValue::Array(
                request
                    .response_sources
                    .iter()
                    .map(|id| JsonValue::String(id.to_string()))
                    .collect(),
            )),
            ReferenceField::ResponseEntryId => request
                .response_entry_id
                .map(|id| JsonValue::String(id.to_string())),
            ReferenceField::ResponseBody => match request.response_entry_id {
                Some(id) => Some(JsonValue::String(
                    self.ctx.repos.entries.require(id).await?.content,
                )),
                None => None,
            },
        };
        Ok(value)
    }
}

fn unresolvable(reference: &StepReference, reason: String) -> Resolution {
    Resolution::Unresolvable {
        reference: reference.to_string(),
        reason,
    }
}

/// Follow a dotted path into a value. Strings holding JSON are parsed before
/// indexing; array positions are decimal indices.
pub fn navigate(value: JsonValue, path: &[String]) -> Result<JsonValue> {
    let mut current = value;
    for segment in path {
        if let JsonValue::String(text) = &current {
            current = serde_json::from_str(text).map_err(|_| {
                Error::Reference(format!("cannot index '{}' into plain text", segment))
            })?;
        }
        let next = match &current {
            JsonValue::Object(map) => map.get(segment).cloned(),
            JsonValue::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned()),
            _ => None,
        };
        current = next.ok_or_else(|| Error::Reference(format!("path segment '{}' not found", segment)))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omnilake_core::{Deferred, Job, JobType, LookupInstruction, NewEntry, ProcessingInstructions};
    use omnilake_db::memory;
    use omnilake_inference::MockInferenceBackend;
    use serde_json::json;

    fn context() -> EngineContext {
        let backend = Arc::new(MockInferenceBackend::new());
        EngineContext::new(memory::repositories(), backend.clone(), backend)
    }

    async fn completed_request(ctx: &EngineContext, content: &str) -> LakeRequest {
        let job = Job::new(JobType::LakeRequest);
        ctx.repos.jobs.create(&job).await.unwrap();
        let body = LakeRequestBody::new(ProcessingInstructions::summarize("g"));
        let request = LakeRequest::new(body, &job, None);
        ctx.repos.lake_requests.create(&request).await.unwrap();
        let entry = ctx.repos.entries.create(NewEntry::new(content)).await.unwrap();
        ctx.repos
            .lake_requests
            .set_response_entry(request.lake_request_id, entry.entry_id)
            .await
            .unwrap();
        ctx.repos
            .lake_requests
            .close(request.lake_request_id, JobStatus::Completed)
            .await
            .unwrap();
        ctx.repos.lake_requests.require(request.lake_request_id).await.unwrap()
    }

    fn chain_with(executed: &[(&str, Uuid)]) -> ChainRequest {
        let mut chain = ChainRequest::new(vec![], &Job::new(JobType::LakeChainRequest));
        for (name, id) in executed {
            chain.executed_requests.insert(name.to_string(), *id);
        }
        chain
    }

    fn body_with_goal(goal: &str) -> LakeRequestBody {
        serde_json::from_value(json!({
            "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": goal}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolves_response_body_and_id() {
        let ctx = context();
        let request = completed_request(&ctx, "the answer").await;
        let chain = chain_with(&[("a", request.lake_request_id)]);
        let resolver = ReferenceResolver::new(ctx);

        let body = body_with_goal("REF:a.response_body")
            .with_lookup(serde_json::from_value(json!({
                "request_type": "DIRECT_ENTRY",
                "entry_id": "REF:a.response_id"
            })).unwrap());

        let Resolution::Resolved(resolved) = resolver.resolve(&chain, &body).await.unwrap() else {
            panic!("expected resolution");
        };
        match &resolved.processing_instructions {
            ProcessingInstructions::Summarization(s) => {
                assert_eq!(s.goal, Deferred::Literal("the answer".to_string()))
            }
            other => panic!("unexpected {other:?}"),
        }
        match &resolved.lookup_instructions[0] {
            LookupInstruction::DirectEntry { entry_id } => {
                assert_eq!(entry_id.literal().copied(), request.response_entry_id)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_step_is_unresolvable() {
        let resolver = ReferenceResolver::new(context());
        let chain = chain_with(&[]);
        let outcome = resolver
            .resolve(&chain, &body_with_goal("REF:b.response_body"))
            .await
            .unwrap();
        match outcome {
            Resolution::Unresolvable { reference, reason } => {
                assert_eq!(reference, "REF:b.response_body");
                assert!(reason.contains("not executed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nested_path_into_json_body() {
        let ctx = context();
        let request = completed_request(&ctx, r#"{"verdict": {"label": "ship it"}}"#).await;
        let chain = chain_with(&[("a", request.lake_request_id)]);
        let resolver = ReferenceResolver::new(ctx);

        let resolved = resolver
            .resolve(&chain, &body_with_goal("REF:a.response_body.verdict.label"))
            .await
            .unwrap();
        let Resolution::Resolved(body) = resolved else {
            panic!("expected resolution");
        };
        let ProcessingInstructions::Summarization(s) = body.processing_instructions else {
            panic!("expected summarization");
        };
        assert_eq!(s.goal.value().unwrap(), "ship it");

        let err = resolver
            .resolve(&chain, &body_with_goal("REF:a.response_body.missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reference(_)));
    }

    #[test]
    fn test_navigate_arrays() {
        let value = json!(["x", "y"]);
        assert_eq!(navigate(value.clone(), &["1".to_string()]).unwrap(), json!("y"));
        assert!(navigate(value, &["5".to_string()]).is_err());
        assert!(navigate(json!("plain"), &["a".to_string()]).is_err());
    }
}
