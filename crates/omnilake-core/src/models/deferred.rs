//! Deferred values: fields that are either a literal or a `REF:` token
//! pointing at a field of an earlier chain step's result.
//!
//! References are parsed once, when a body is deserialized, so nothing
//! downstream scans strings for `REF:` tokens. Resolution replaces each
//! `Deferred::Reference` with a `Deferred::Literal` before dispatch.

use std::collections::HashMap;
use std::fmt;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{Error, Result};

/// Prefix marking a string as a step reference.
pub const REFERENCE_PREFIX: &str = "REF:";

/// Result fields of a lake request a reference may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceField {
    /// `response_id` or `response_entry_id`
    ResponseEntryId,
    /// Content of the response entry
    ResponseBody,
    /// Entry ids gathered by the lookups
    ResponseSources,
    LakeRequestId,
    RequestStatus,
}

impl ReferenceField {
    pub const NAMES: [&'static str; 6] = [
        "response_id",
        "response_entry_id",
        "response_body",
        "response_sources",
        "lake_request_id",
        "request_status",
    ];

    /// Whether the value only exists once the referenced request has completed.
    pub fn requires_completion(&self) -> bool {
        !matches!(self, Self::LakeRequestId)
    }
}

impl std::str::FromStr for ReferenceField {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "response_id" | "response_entry_id" => Ok(Self::ResponseEntryId),
            "response_body" => Ok(Self::ResponseBody),
            "response_sources" => Ok(Self::ResponseSources),
            "lake_request_id" => Ok(Self::LakeRequestId),
            "request_status" => Ok(Self::RequestStatus),
            other => Err(Error::Validation(format!(
                "unknown reference field '{}', expected one of {}",
                other,
                Self::NAMES.join(", ")
            ))),
        }
    }
}

/// A parsed `REF:<step_name>.<field_path>` token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepReference {
    pub step_name: String,
    /// Dotted path; the first segment names a [`ReferenceField`], the rest
    /// index into the value (object keys or array positions).
    pub field_path: Vec<String>,
}

impl StepReference {
    pub fn new(step_name: impl Into<String>, field: &str) -> Self {
        Self {
            step_name: step_name.into(),
            field_path: field.split('.').map(str::to_string).collect(),
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        let body = token.strip_prefix(REFERENCE_PREFIX).ok_or_else(|| {
            Error::Validation(format!("'{}' is not a step reference", token))
        })?;
        let mut segments = body.split('.');
        let step_name = segments.next().unwrap_or_default();
        let field_path: Vec<String> = segments.map(str::to_string).collect();
        if step_name.is_empty() || field_path.is_empty() || field_path.iter().any(String::is_empty)
        {
            return Err(Error::Validation(format!(
                "malformed reference '{}', expected REF:<step_name>.<field_path>",
                token
            )));
        }
        Ok(Self {
            step_name: step_name.to_string(),
            field_path,
        })
    }

    /// The top-level result field addressed.
    pub fn field(&self) -> Result<ReferenceField> {
        match self.field_path.first() {
            Some(first) => first.parse(),
            None => Err(Error::Validation(format!("reference {} has no field", self))),
        }
    }

    /// Path below the top-level field.
    pub fn nested_path(&self) -> &[String] {
        self.field_path.get(1..).unwrap_or_default()
    }
}

impl fmt::Display for StepReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{}",
            REFERENCE_PREFIX,
            self.step_name,
            self.field_path.join(".")
        )
    }
}

/// Values fetched for a set of references.
pub type ResolvedValues = HashMap<StepReference, JsonValue>;

/// Conversion of a resolved JSON value into the declared field type.
pub trait FromResolved: Sized {
    fn from_resolved(value: &JsonValue) -> Result<Self>;
}

impl FromResolved for String {
    /// Strings are taken as-is; arrays become one line per element; any
    /// other structured value is embedded as JSON text.
    fn from_resolved(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::Null => Err(Error::Reference("reference resolved to null".into())),
            JsonValue::String(s) => Ok(s.clone()),
            JsonValue::Array(items) => Ok(items
                .iter()
                .map(|item| match item {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n")),
            other => Ok(other.to_string()),
        }
    }
}

impl FromResolved for Uuid {
    fn from_resolved(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::String(s) => Uuid::parse_str(s)
                .map_err(|e| Error::Reference(format!("'{}' is not an id: {}", s, e))),
            JsonValue::Array(items) if items.len() == 1 => Uuid::from_resolved(&items[0]),
            other => Err(Error::Reference(format!(
                "expected an id, reference resolved to {}",
                other
            ))),
        }
    }
}

impl FromResolved for Vec<Uuid> {
    fn from_resolved(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::Array(items) => items.iter().map(Uuid::from_resolved).collect(),
            single => Ok(vec![Uuid::from_resolved(single)?]),
        }
    }
}

/// A field that is either known at submission or deferred to a prior step.
#[derive(Debug, Clone, PartialEq)]
pub enum Deferred<T> {
    Literal(T),
    Reference(StepReference),
}

impl<T> Deferred<T> {
    pub fn literal(&self) -> Option<&T> {
        match self {
            Self::Literal(v) => Some(v),
            Self::Reference(_) => None,
        }
    }

    pub fn reference(&self) -> Option<&StepReference> {
        match self {
            Self::Literal(_) => None,
            Self::Reference(r) => Some(r),
        }
    }

    /// The literal value, or a `Reference` error if still unresolved.
    pub fn value(&self) -> Result<&T> {
        match self {
            Self::Literal(v) => Ok(v),
            Self::Reference(r) => Err(Error::Reference(format!("unresolved reference {}", r))),
        }
    }
}

impl<T: FromResolved> Deferred<T> {
    /// Replace a reference with its resolved value. Literals are untouched.
    pub fn resolve(&mut self, values: &ResolvedValues) -> Result<()> {
        if let Self::Reference(r) = self {
            let value = values
                .get(r)
                .ok_or_else(|| Error::Reference(format!("no value resolved for {}", r)))?;
            let literal = T::from_resolved(value)
                .map_err(|e| Error::Reference(format!("{}: {}", r, e)))?;
            tracing::debug!(reference = %r, "Reference resolved");
            *self = Self::Literal(literal);
        }
        Ok(())
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

impl<T: Serialize> Serialize for Deferred<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Literal(v) => v.serialize(serializer),
            Self::Reference(r) => serializer.serialize_str(&r.to_string()),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Deferred<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        if let JsonValue::String(s) = &value {
            if s.starts_with(REFERENCE_PREFIX) {
                return StepReference::parse(s)
                    .map(Self::Reference)
                    .map_err(D::Error::custom);
            }
        }
        T::deserialize(value)
            .map(Self::Literal)
            .map_err(D::Error::custom)
    }
}

/// Bodies that may carry deferred references.
pub trait HasReferences {
    /// Every unresolved reference, in field order.
    fn references(&self) -> Vec<&StepReference>;

    /// Replace every reference with its value from `values`.
    fn resolve_references(&mut self, values: &ResolvedValues) -> Result<()>;

    fn has_references(&self) -> bool {
        !self.references().is_empty()
    }
}

/// Push the reference held by an optional deferred field, if any.
pub(crate) fn collect<'a, T>(field: Option<&'a Deferred<T>>, out: &mut Vec<&'a StepReference>) {
    if let Some(r) = field.and_then(Deferred::reference) {
        out.push(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference() {
        let r = StepReference::parse("REF:step_a.response_id").unwrap();
        assert_eq!(r.step_name, "step_a");
        assert_eq!(r.field_path, vec!["response_id"]);
        assert_eq!(r.field().unwrap(), ReferenceField::ResponseEntryId);
        assert!(r.nested_path().is_empty());
    }

    #[test]
    fn test_parse_nested_reference() {
        let r = StepReference::parse("REF:a.response_sources.0").unwrap();
        assert_eq!(r.field().unwrap(), ReferenceField::ResponseSources);
        assert_eq!(r.nested_path(), &["0".to_string()]);
        assert_eq!(r.to_string(), "REF:a.response_sources.0");
    }

    #[test]
    fn test_parse_malformed_references() {
        for token in ["REF:", "REF:a", "REF:.response_id", "REF:a.", "a.response_id"] {
            assert!(StepReference::parse(token).is_err(), "{token} should fail");
        }
    }

    #[test]
    fn test_unknown_field_is_validation_error() {
        let r = StepReference::parse("REF:a.nope").unwrap();
        assert!(matches!(r.field(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_deserialize_literal_and_reference() {
        let lit: Deferred<String> = serde_json::from_value(json!("plain text")).unwrap();
        assert_eq!(lit, Deferred::Literal("plain text".to_string()));

        let r: Deferred<String> = serde_json::from_value(json!("REF:a.response_body")).unwrap();
        assert_eq!(
            r.reference().map(|r| r.step_name.as_str()),
            Some("a")
        );
        assert_eq!(serde_json::to_value(&r).unwrap(), json!("REF:a.response_body"));
    }

    #[test]
    fn test_deserialize_typed_literal() {
        let id = Uuid::new_v4();
        let d: Deferred<Uuid> = serde_json::from_value(json!(id.to_string())).unwrap();
        assert_eq!(d.literal(), Some(&id));
        assert!(serde_json::from_value::<Deferred<Uuid>>(json!("not-a-uuid")).is_err());
    }

    #[test]
    fn test_resolve_replaces_reference() {
        let mut d: Deferred<String> = serde_json::from_value(json!("REF:a.response_body")).unwrap();
        assert!(d.value().is_err());
        let mut values = ResolvedValues::new();
        values.insert(
            StepReference::parse("REF:a.response_body").unwrap(),
            json!("the answer"),
        );
        d.resolve(&values).unwrap();
        assert_eq!(d.value().unwrap(), "the answer");
    }

    #[test]
    fn test_resolve_missing_value_errors() {
        let mut d: Deferred<Uuid> = Deferred::Reference(StepReference::new("a", "response_id"));
        assert!(matches!(
            d.resolve(&ResolvedValues::new()),
            Err(Error::Reference(_))
        ));
    }

    #[test]
    fn test_string_from_structured_values() {
        assert_eq!(String::from_resolved(&json!(["a", "b"])).unwrap(), "a\nb");
        assert_eq!(String::from_resolved(&json!({"k": 1})).unwrap(), "{\"k\":1}");
        assert!(String::from_resolved(&JsonValue::Null).is_err());
    }

    #[test]
    fn test_uuid_list_accepts_single_id() {
        let id = Uuid::new_v4();
        let ids = Vec::<Uuid>::from_resolved(&json!(id.to_string())).unwrap();
        assert_eq!(ids, vec![id]);
        let ids = Vec::<Uuid>::from_resolved(&json!([id.to_string(), id.to_string()])).unwrap();
        assert_eq!(ids.len(), 2);
    }
}
