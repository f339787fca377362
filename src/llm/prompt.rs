use crate::batch::Batch;
use crate::consolidate::ContextEntry;
use crate::extract::{FieldKind, RawField};
use serde::Serialize;

pub const SYSTEM_PROMPT: &str = "You are an expert at analyzing and organizing PDF form fields. \
You merge fields collected from many forms into one clean, deduplicated questionnaire. \
You always answer with a single JSON object and nothing else.";

#[derive(Serialize)]
struct BatchEntry<'a> {
    field_name: &'a str,
    source_pdf: &'a str,
    #[serde(rename = "type")]
    kind: FieldKind,
    required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
}

impl<'a> From<&'a RawField> for BatchEntry<'a> {
    fn from(f: &'a RawField) -> Self {
        Self {
            field_name: &f.name,
            source_pdf: &f.source_document,
            kind: f.kind,
            required: f.required,
            options: f.options.as_deref(),
            max_length: f.max_length,
            page: f.position.as_ref().and_then(|p| p.page),
        }
    }
}

/// Build the user message for one batch. Existing canonical fields go in as
/// compact JSON so the model can reuse their ids and order indices.
pub fn build_prompt(context: &[ContextEntry], batch: &Batch<'_>) -> String {
    let entries: Vec<BatchEntry> = batch.fields.iter().map(BatchEntry::from).collect();
    let batch_json = serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string());
    let context_json = if context.is_empty() {
        "[] (no fields yet, this is the first batch)".to_string()
    } else {
        serde_json::to_string(context).unwrap_or_else(|_| "[]".to_string())
    };

    format!(
        r#"EXISTING CANONICAL FIELDS (from earlier batches):
{context_json}

NEW BATCH OF EXTRACTED FIELDS:
{batch_json}

Your task:
1. Deduplicate the new fields against the existing canonical fields and against each other.
   Be intelligent: not too strict (no exact string match needed: "Name", "Full Name" and
   "Applicant Name" are the same), not too loose (never merge "First Name" with "Last Name"
   or "Full Name").
2. Group related fields (name parts, address lines, contact details, spouse, children...)
   by giving them the same "order_index".
3. Propose parent questions that gate related fields ("Are you married?",
   "How many children do you have?") and link children to them.
4. Write a clear label (phrased as a question), an explanation, and a placeholder.

Return ONE JSON object mapping a snake_case field id to a field object:
{{
  "<field_id>": {{
    "label": "What is your first name?",
    "explanation": "Enter your legal first name",
    "type": "text | checkbox | radio | choice | signature | boolean | number",
    "required": true,
    "placeholder": "e.g. Jane",
    "options": ["only", "for", "choice", "fields"],
    "max_length": 40,
    "_metadata": {{
      "field_name": "<best field name; for parent questions the field id>",
      "source_pdf": ["<every source pdf of the merged fields>"],
      "raw_fields": [{{"source_pdf": "a.pdf", "field_name": "First Name"}}],
      "order_index": 0,
      "parent": "<parent field id or null>",
      "parent_condition": {{"operator": "equals", "value": true}},
      "position": null,
      "merge_into": "<existing canonical id, only when merging into one>",
      "reassign_group": false,
      "is_parent_question": false,
      "generated": false
    }}
  }}
}}

Rules:
- Include exactly the fields of the NEW BATCH (merged where appropriate) plus any new parent
  questions. Do not repeat existing canonical fields unless a new field merges into them.
- To merge a new field into an existing canonical field, reuse its id or set "merge_into".
- "raw_fields" must list every (source_pdf, field_name) pair of the new batch the entry covers.
- "order_index": reuse an existing order_index to join that group; any other number is a new
  group shared by all entries of this batch with that number.
- Set "reassign_group": true only to move an existing field's whole group to "order_index".
- Parent questions: "is_parent_question": true, "generated": true, type "boolean", "number"
  or "choice". Reuse an existing parent question instead of asking the same thing twice.
- "parent" must be an existing canonical id or an id defined in this response.
- "parent_condition" operators: equals, not_equals, greater_than, greater_or_equal,
  less_than, less_or_equal.

Respond with ONLY the JSON object, no additional text."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::tests::raw;

    #[test]
    fn prompt_carries_context_and_batch() {
        let fields = vec![raw("a.pdf", "Name:"), raw("b.pdf", "DOB")];
        let batch = Batch { index: 0, fields: &fields };
        let context = vec![ContextEntry {
            id: "email".into(),
            field_name: "Email".into(),
            label: "What is your email?".into(),
            kind: FieldKind::Text,
            order_index: 4,
            parent: None,
            is_parent_question: false,
            source_pdf: vec!["c.pdf".into()],
        }];

        let prompt = build_prompt(&context, &batch);
        assert!(prompt.contains(r#""field_name":"Name:","source_pdf":"a.pdf","type":"text""#));
        assert!(prompt.contains(r#""id":"email""#));
        assert!(prompt.contains(r#""order_index":4"#));
        assert!(!prompt.contains(r#""is_parent_question":false"#));
    }

    #[test]
    fn first_batch_says_so() {
        let fields = vec![raw("a.pdf", "Name:")];
        let prompt = build_prompt(&[], &Batch { index: 0, fields: &fields });
        assert!(prompt.contains("this is the first batch"));
    }
}
