//! Serialization of the final document.
//!
//! Key order is the first-insertion order of the consolidation state, so a
//! given state always renders to the same bytes.

use crate::consolidate::{CanonicalField, ConsolidationState};
use crate::error::FormfuseError;
use crate::extract::{FieldKind, Position, RawField};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
pub struct OutputField<'a> {
    pub label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<&'a str>,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(rename = "_metadata")]
    pub metadata: OutputMetadata<'a>,
}

#[derive(Serialize)]
pub struct OutputMetadata<'a> {
    pub field_name: &'a str,
    pub source_pdf: &'a [String],
    pub order_index: u32,
    pub parent: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_condition: Option<&'a serde_json::Value>,
    pub position: Option<&'a Position>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_parent_question: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generated: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unprocessed: bool,
}

impl<'a> From<&'a CanonicalField> for OutputField<'a> {
    fn from(f: &'a CanonicalField) -> Self {
        Self {
            label: &f.label,
            explanation: f.explanation.as_deref(),
            kind: f.kind,
            required: f.required,
            placeholder: f.placeholder.as_deref(),
            options: f.options.as_deref(),
            max_length: f.max_length,
            metadata: OutputMetadata {
                field_name: &f.field_name,
                source_pdf: &f.source_documents,
                order_index: f.order_index,
                parent: f.parent_id.as_deref(),
                parent_condition: f.parent_condition.as_ref(),
                position: f.position.as_ref(),
                is_parent_question: f.is_parent_question,
                generated: f.generated,
                unprocessed: f.unprocessed,
            },
        }
    }
}

pub fn assemble(state: &ConsolidationState) -> IndexMap<&str, OutputField<'_>> {
    state
        .fields()
        .map(|f| (f.canonical_id.as_str(), OutputField::from(f)))
        .collect()
}

pub fn render(state: &ConsolidationState) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&assemble(state))
}

#[derive(Serialize)]
struct RawDocument<'a> {
    total_fields: usize,
    fields: &'a [RawField],
}

/// `--extract-only` output: the raw records, untouched.
pub fn render_extract_only(fields: &[RawField]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&RawDocument { total_fields: fields.len(), fields })
}

pub fn write_output(path: &Path, contents: &str) -> Result<(), FormfuseError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| FormfuseError::Output {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| FormfuseError::Output {
        path: path.to_path_buf(),
        source,
    })
}
