//! Parsing and per-entry validation of reasoning-service responses.
//!
//! A response is a JSON object mapping field id to field object, the same
//! shape as the final output document restricted to one batch. Entries that
//! fail validation are dropped individually; only a response that is not a
//! JSON object at all fails the whole batch.

use crate::error::{ReasoningError, ValidationError};
use crate::extract::{FieldKind, Position};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// One field object proposed by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedField {
    pub id: String,
    pub label: String,
    pub explanation: Option<String>,
    pub kind: FieldKind,
    pub required: bool,
    pub placeholder: Option<String>,
    pub options: Option<Vec<String>>,
    pub max_length: Option<u32>,
    pub field_name: String,
    pub source_documents: Vec<String>,
    /// Existing index to join, or a batch-local group key.
    pub order_index: Option<i64>,
    pub parent: Option<String>,
    pub parent_condition: Option<Value>,
    pub position: Option<Position>,
    pub is_parent_question: bool,
    /// Existing canonical id this entry should be folded into.
    pub merge_into: Option<String>,
    /// `(source_pdf, field_name)` pairs of the raw fields this entry covers.
    pub raw_fields: Vec<(String, String)>,
    /// Move the whole existing group of the merge target to `order_index`.
    pub reassign_group: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProposal {
    /// In response order.
    pub fields: Vec<ProposedField>,
}

/// Remove a surrounding markdown code fence and any chatter around the
/// outermost JSON object.
pub fn strip_code_fence(text: &str) -> &str {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = body.trim_start_matches('`');
        body = body.strip_prefix("json").unwrap_or(body);
        if let Some(end) = body.rfind("```") {
            body = &body[..end];
        }
        body = body.trim();
    }
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    }
}

/// Parse a raw model reply. Malformed entries come back as validation
/// errors next to the proposal instead of failing it.
pub fn parse_proposal(text: &str) -> Result<(BatchProposal, Vec<ValidationError>), ReasoningError> {
    let body = strip_code_fence(text);
    let entries: IndexMap<String, Value> = serde_json::from_str(body)
        .map_err(|e| ReasoningError::MalformedResponse(format!("expected a JSON object: {}", e)))?;

    let mut proposal = BatchProposal::default();
    let mut invalid = Vec::new();
    for (id, value) in entries {
        match parse_entry(&id, &value) {
            Ok(field) => proposal.fields.push(field),
            Err(e) => invalid.push(e),
        }
    }
    Ok((proposal, invalid))
}

fn parse_entry(id: &str, value: &Value) -> Result<ProposedField, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::NotAnObject { id: id.to_string() })?;
    if id.trim().is_empty() {
        return Err(ValidationError::InvalidValue {
            id: id.to_string(),
            key: "id",
            reason: "empty field id".to_string(),
        });
    }

    let label = required_str(id, obj, "label")?;
    let kind = FieldKind::from_type_name(&required_str(id, obj, "type")?);
    let required = match obj.get("required") {
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(invalid(id, "required", "not a boolean")),
        None => return Err(missing(id, "required")),
    };

    let meta = match obj.get("_metadata") {
        Some(Value::Object(m)) => m,
        Some(_) => return Err(invalid(id, "_metadata", "not an object")),
        None => return Err(missing(id, "_metadata")),
    };
    let field_name = match meta.get("field_name") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(_) => return Err(invalid(id, "_metadata.field_name", "not a non-empty string")),
        None => return Err(missing(id, "_metadata.field_name")),
    };

    let source_documents = match meta.get("source_pdf") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        _ => Vec::new(),
    };

    let raw_fields = match meta.get("raw_fields") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let doc = item.get("source_pdf")?.as_str()?;
                let name = item.get("field_name")?.as_str()?;
                Some((doc.to_string(), name.to_string()))
            })
            .collect(),
        _ => source_documents
            .iter()
            .map(|doc| (doc.clone(), field_name.clone()))
            .collect(),
    };

    Ok(ProposedField {
        id: id.to_string(),
        label,
        explanation: optional_str(obj, "explanation"),
        kind,
        required,
        placeholder: optional_str(obj, "placeholder"),
        options: obj.get("options").and_then(Value::as_array).map(|opts| {
            opts.iter()
                .map(|o| o.as_str().map(String::from).unwrap_or_else(|| o.to_string()))
                .collect()
        }),
        max_length: obj
            .get("max_length")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        field_name,
        source_documents,
        order_index: meta.get("order_index").and_then(Value::as_i64),
        parent: optional_str(meta, "parent"),
        parent_condition: meta.get("parent_condition").filter(|v| v.is_object()).cloned(),
        position: meta
            .get("position")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        is_parent_question: meta
            .get("is_parent_question")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        merge_into: optional_str(meta, "merge_into"),
        raw_fields,
        reassign_group: meta.get("reassign_group").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn missing(id: &str, key: &'static str) -> ValidationError {
    ValidationError::MissingKey { id: id.to_string(), key }
}

fn invalid(id: &str, key: &'static str, reason: &str) -> ValidationError {
    ValidationError::InvalidValue {
        id: id.to_string(),
        key,
        reason: reason.to_string(),
    }
}

fn required_str(id: &str, obj: &Map<String, Value>, key: &'static str) -> Result<String, ValidationError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(invalid(id, key, "not a non-empty string")),
        None => Err(missing(id, key)),
    }
}

fn optional_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
