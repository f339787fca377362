//! Cross-batch consolidation of reasoning-service proposals.
//!
//! [`ConsolidationState`] is owned by the pipeline and passed by reference
//! into each stage. Batches must be applied one at a time and in order: the
//! next request is built from the state produced by the previous one.

use crate::extract::{FieldKind, Position, RawField};
use crate::llm::response::{BatchProposal, ProposedField};
use crate::report::{RunReport, Stage};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Deduplicated representation of one logical question across all documents.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalField {
    pub canonical_id: String,
    pub field_name: String,
    pub label: String,
    pub explanation: Option<String>,
    pub kind: FieldKind,
    pub required: bool,
    pub placeholder: Option<String>,
    pub options: Option<Vec<String>>,
    pub max_length: Option<u32>,
    /// Unique, in order of first appearance.
    pub source_documents: Vec<String>,
    pub order_index: u32,
    pub parent_id: Option<String>,
    pub parent_condition: Option<serde_json::Value>,
    pub position: Option<Position>,
    pub is_parent_question: bool,
    pub generated: bool,
    /// Emitted straight from extraction after a reasoning failure.
    pub unprocessed: bool,
}

impl CanonicalField {
    fn add_sources<'s>(&mut self, sources: impl IntoIterator<Item = &'s String>) {
        for s in sources {
            if !self.source_documents.contains(s) {
                self.source_documents.push(s.clone());
            }
        }
    }
}

/// Compact view of one canonical entry sent along with each batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextEntry {
    pub id: String,
    pub field_name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub order_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_parent_question: bool,
    pub source_pdf: Vec<String>,
}

/// What one call to [`ConsolidationState::apply`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub merged: usize,
    pub uncovered: usize,
}

#[derive(Debug, Default, Clone)]
pub struct ConsolidationState {
    fields: IndexMap<String, CanonicalField>,
    /// (source document, raw field name) -> canonical id
    raw_index: HashMap<(String, String), String>,
    /// normalized question text -> parent question id
    parent_questions: HashMap<String, String>,
    next_order_index: u32,
}

/// Lowercase, drop punctuation, collapse whitespace. Two parent questions
/// with the same normalized text are the same question.
pub fn normalize_question(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c.to_lowercase().next().unwrap_or(c) } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Id derived from a raw field name for entries that never went through
/// the reasoning service.
pub fn slugify(name: &str) -> String {
    let slug = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() {
        "field".to_string()
    } else {
        slug
    }
}

impl ConsolidationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalField> {
        self.fields.get(id)
    }

    /// Entries in first-insertion order.
    pub fn fields(&self) -> impl Iterator<Item = &CanonicalField> {
        self.fields.values()
    }

    pub fn canonical_for(&self, document: &str, name: &str) -> Option<&str> {
        self.raw_index
            .get(&(document.to_string(), name.to_string()))
            .map(String::as_str)
    }

    pub fn order_indices(&self) -> BTreeSet<u32> {
        self.fields.values().map(|f| f.order_index).collect()
    }

    pub fn parent_question_count(&self) -> usize {
        self.fields.values().filter(|f| f.is_parent_question).count()
    }

    pub fn context(&self) -> Vec<ContextEntry> {
        self.fields
            .values()
            .map(|f| ContextEntry {
                id: f.canonical_id.clone(),
                field_name: f.field_name.clone(),
                label: f.label.clone(),
                kind: f.kind,
                order_index: f.order_index,
                parent: f.parent_id.clone(),
                is_parent_question: f.is_parent_question,
                source_pdf: f.source_documents.clone(),
            })
            .collect()
    }

    fn allocate_order_index(&mut self) -> u32 {
        let idx = self.next_order_index;
        self.next_order_index += 1;
        idx
    }

    fn unique_id(&self, base: &str) -> String {
        if !self.fields.contains_key(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.fields.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Fold one batch's proposals into the state.
    pub fn apply(&mut self, batch: &[RawField], proposal: BatchProposal, report: &mut RunReport) -> BatchOutcome {
        let mut run = BatchRun {
            known_groups: self.order_indices(),
            local_groups: HashMap::new(),
            alias: HashMap::new(),
            touched: Vec::new(),
            outcome: BatchOutcome::default(),
        };

        // Parents first so children in the same batch can point at them.
        let (parents, fields): (Vec<_>, Vec<_>) =
            proposal.fields.into_iter().partition(|f| f.is_parent_question);

        for p in parents {
            self.apply_parent(&mut run, batch, p);
        }
        for f in fields {
            self.apply_field(&mut run, batch, f, report);
        }

        let touched = std::mem::take(&mut run.touched);
        for (id, parent, condition) in touched {
            self.link_parent(&run, &id, parent, condition, report);
        }

        for raw in batch {
            if self.canonical_for(&raw.source_document, &raw.name).is_none() {
                run.outcome.uncovered += 1;
                report.warn(
                    Stage::Consolidation,
                    format!("{}: `{}` is not covered by any returned field", raw.source_document, raw.name),
                );
            }
        }

        run.outcome
    }

    fn apply_parent(&mut self, run: &mut BatchRun, batch: &[RawField], p: ProposedField) {
        let norm = normalize_question(&p.label);

        let existing = match self.fields.get(&p.id) {
            Some(f) if f.is_parent_question => Some(p.id.clone()),
            _ => self.parent_questions.get(&norm).cloned(),
        };

        if let Some(id) = existing {
            tracing::debug!("Parent question `{}` merges into `{}`", p.id, id);
            run.alias.insert(p.id.clone(), id.clone());
            // A relabel keeps the old wording mapped and adds the new one.
            self.parent_questions.entry(norm).or_insert_with(|| id.clone());
            self.merge_into(run, &id, &p);
            run.outcome.merged += 1;
            run.touched.push((id, p.parent, p.parent_condition));
            return;
        }

        let id = self.unique_id(&p.id);
        let order_index = self.resolve_order_index(run, p.order_index);
        let position = p.position.clone().or_else(|| raw_position(batch, &p.raw_fields));
        run.alias.insert(p.id.clone(), id.clone());
        self.parent_questions.insert(norm, id.clone());
        self.insert_new(&id, &p, order_index, position, true);
        run.outcome.created += 1;
        run.touched.push((id, p.parent, p.parent_condition));
    }

    fn apply_field(&mut self, run: &mut BatchRun, batch: &[RawField], f: ProposedField, report: &mut RunReport) {
        let target = self.merge_target(run, &f, report);

        let id = match target {
            Some(id) => {
                self.merge_into(run, &id, &f);
                run.outcome.merged += 1;
                id
            }
            None => {
                let id = self.unique_id(&f.id);
                let order_index = self.resolve_order_index(run, f.order_index);
                let position = f.position.clone().or_else(|| raw_position(batch, &f.raw_fields));
                self.insert_new(&id, &f, order_index, position, false);
                run.outcome.created += 1;
                id
            }
        };

        run.alias.insert(f.id.clone(), id.clone());
        for (doc, name) in &f.raw_fields {
            let key = (doc.clone(), name.clone());
            match self.raw_index.get(&key) {
                Some(existing) if existing != &id => tracing::debug!(
                    "{}/{} already belongs to `{}`, not remapping to `{}`",
                    doc, name, existing, id
                ),
                Some(_) => {}
                None => {
                    self.raw_index.insert(key, id.clone());
                }
            }
        }
        run.touched.push((id, f.parent, f.parent_condition));
    }

    /// Existing entry this proposal folds into: the service's explicit merge
    /// decision first, then an id match, then the reverse raw-field index.
    fn merge_target(&self, run: &BatchRun, f: &ProposedField, report: &mut RunReport) -> Option<String> {
        if let Some(target) = &f.merge_into {
            let target = run.alias.get(target).unwrap_or(target);
            match self.fields.get(target) {
                Some(t) if !t.is_parent_question => return Some(target.clone()),
                Some(_) => report.warn(
                    Stage::Consolidation,
                    format!("`{}` cannot merge into parent question `{}`", f.id, target),
                ),
                None => report.warn(
                    Stage::Consolidation,
                    format!("`{}` names unknown merge target `{}`, treating as new", f.id, target),
                ),
            }
        }

        if let Some(existing) = self.fields.get(&f.id) {
            if !existing.is_parent_question {
                return Some(f.id.clone());
            }
        }

        let mut hits: Vec<&String> = Vec::new();
        for (doc, name) in &f.raw_fields {
            if let Some(id) = self.raw_index.get(&(doc.clone(), name.clone())) {
                if !hits.contains(&id) {
                    hits.push(id);
                }
            }
        }
        if hits.len() > 1 {
            report.warn(
                Stage::Consolidation,
                format!(
                    "`{}` covers fields of several entries ({}), merging into `{}` only",
                    f.id,
                    hits.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                    hits[0]
                ),
            );
        }
        hits.first().map(|s| s.to_string())
    }

    fn resolve_order_index(&mut self, run: &mut BatchRun, proposed: Option<i64>) -> u32 {
        match proposed {
            Some(k) if u32::try_from(k).map_or(false, |k| run.known_groups.contains(&k)) => k as u32,
            Some(k) => match run.local_groups.get(&k) {
                Some(idx) => *idx,
                None => {
                    let idx = self.allocate_order_index();
                    run.local_groups.insert(k, idx);
                    idx
                }
            },
            None => self.allocate_order_index(),
        }
    }

    fn insert_new(&mut self, id: &str, p: &ProposedField, order_index: u32, position: Option<Position>, parent_question: bool) {
        let mut sources = Vec::new();
        for s in p.source_documents.iter().chain(p.raw_fields.iter().map(|(doc, _)| doc)) {
            if !sources.contains(s) {
                sources.push(s.clone());
            }
        }

        self.fields.insert(
            id.to_string(),
            CanonicalField {
                canonical_id: id.to_string(),
                field_name: p.field_name.clone(),
                label: p.label.clone(),
                explanation: p.explanation.clone(),
                kind: p.kind,
                required: p.required,
                placeholder: p.placeholder.clone(),
                options: p.options.clone(),
                max_length: p.max_length,
                source_documents: sources,
                order_index,
                parent_id: None,
                parent_condition: None,
                position,
                is_parent_question: parent_question,
                generated: parent_question,
                unprocessed: false,
            },
        );
    }

    /// Union sources, take the newest generated text, keep the group unless
    /// the proposal explicitly moves the whole group.
    fn merge_into(&mut self, run: &mut BatchRun, id: &str, p: &ProposedField) {
        let regroup = if p.reassign_group {
            p.order_index.map(|k| self.resolve_order_index(run, Some(k)))
        } else {
            None
        };

        let Some(existing) = self.fields.get_mut(id) else {
            return;
        };
        existing.add_sources(p.source_documents.iter());
        existing.add_sources(p.raw_fields.iter().map(|(doc, _)| doc));
        existing.label = p.label.clone();
        if p.explanation.is_some() {
            existing.explanation = p.explanation.clone();
        }
        if p.placeholder.is_some() {
            existing.placeholder = p.placeholder.clone();
        }
        existing.required |= p.required;
        if existing.options.is_none() {
            existing.options = p.options.clone();
        }
        if existing.max_length.is_none() {
            existing.max_length = p.max_length;
        }
        if existing.position.is_none() {
            existing.position = p.position.clone();
        }

        let old = existing.order_index;
        if let Some(new) = regroup.filter(|new| *new != old) {
            tracing::debug!("Group {} reassigned to {} via `{}`", old, new, id);
            for f in self.fields.values_mut().filter(|f| f.order_index == old) {
                f.order_index = new;
            }
        }
    }

    fn link_parent(
        &mut self,
        run: &BatchRun,
        id: &str,
        parent: Option<String>,
        condition: Option<serde_json::Value>,
        report: &mut RunReport,
    ) {
        let Some(requested) = parent else {
            return;
        };
        let resolved = run.alias.get(&requested).cloned().unwrap_or(requested.clone());

        if !self.fields.contains_key(&resolved) {
            report.warn(
                Stage::Consolidation,
                format!("`{}` refers to unknown parent `{}`, link dropped", id, requested),
            );
            return;
        }
        if resolved == id || self.is_ancestor(id, &resolved) {
            report.warn(
                Stage::Consolidation,
                format!("`{}` -> `{}` would create a parent cycle, link dropped", id, resolved),
            );
            return;
        }

        if let Some(f) = self.fields.get_mut(id) {
            f.parent_id = Some(resolved);
            if condition.is_some() {
                f.parent_condition = condition;
            }
        }
    }

    /// Whether `start` is already somewhere above `node` on its parent chain.
    fn is_ancestor(&self, start: &str, node: &str) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = self.fields.get(node).and_then(|f| f.parent_id.clone());
        while let Some(id) = cursor {
            if id == start {
                return true;
            }
            if !seen.insert(id.clone()) {
                return false;
            }
            cursor = self.fields.get(&id).and_then(|f| f.parent_id.clone());
        }
        false
    }

    /// Turn raw fields straight into canonical entries, bypassing reasoning.
    /// Fields already covered by an earlier batch are left alone.
    pub fn add_unprocessed(&mut self, raw: &[RawField]) -> usize {
        let mut added = 0;
        for field in raw {
            if self.canonical_for(&field.source_document, &field.name).is_some() {
                continue;
            }
            let id = self.unique_id(&slugify(&field.name));
            let order_index = self.allocate_order_index();
            self.fields.insert(
                id.clone(),
                CanonicalField {
                    canonical_id: id.clone(),
                    field_name: field.name.clone(),
                    label: field.name.clone(),
                    explanation: None,
                    kind: field.kind,
                    required: field.required,
                    placeholder: None,
                    options: field.options.clone(),
                    max_length: field.max_length,
                    source_documents: vec![field.source_document.clone()],
                    order_index,
                    parent_id: None,
                    parent_condition: None,
                    position: field.position.clone(),
                    is_parent_question: false,
                    generated: false,
                    unprocessed: true,
                },
            );
            self.raw_index.insert(field.key(), id);
            added += 1;
        }
        added
    }
}

struct BatchRun {
    /// Order indices that existed before this batch.
    known_groups: BTreeSet<u32>,
    /// Batch-local group key -> allocated index.
    local_groups: HashMap<i64, u32>,
    /// Proposed id -> canonical id it ended up as.
    alias: HashMap<String, String>,
    touched: Vec<(String, Option<String>, Option<serde_json::Value>)>,
    outcome: BatchOutcome,
}

fn raw_position(batch: &[RawField], pairs: &[(String, String)]) -> Option<Position> {
    pairs.iter().find_map(|(doc, name)| {
        batch
            .iter()
            .find(|r| &r.source_document == doc && &r.name == name)
            .and_then(|r| r.position.clone())
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::response::parse_proposal;

    pub fn raw(doc: &str, name: &str) -> RawField {
        RawField {
            name: name.to_string(),
            kind: FieldKind::Text,
            required: false,
            options: None,
            max_length: None,
            source_document: doc.to_string(),
            value: None,
            position: None,
        }
    }

    fn proposal(json: &str) -> BatchProposal {
        let (p, invalid) = parse_proposal(json).unwrap();
        assert!(invalid.is_empty(), "{:?}", invalid);
        p
    }

    #[test]
    fn duplicate_across_documents_merges_sources() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        let batch = vec![raw("a.pdf", "First Name"), raw("b.pdf", "First Name")];

        state.apply(
            &batch,
            proposal(r#"{"first_name": {"label": "What is your first name?", "type": "text", "required": true,
                "_metadata": {"field_name": "First Name", "source_pdf": ["a.pdf", "b.pdf"], "order_index": 0}}}"#),
            &mut report,
        );

        assert_eq!(state.len(), 1);
        let f = state.get("first_name").unwrap();
        assert_eq!(f.source_documents, vec!["a.pdf", "b.pdf"]);
        assert_eq!(state.canonical_for("b.pdf", "First Name"), Some("first_name"));
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn later_batch_merges_through_reverse_index_and_id() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();

        state.apply(
            &[raw("a.pdf", "First Name")],
            proposal(r#"{"first_name": {"label": "First name?", "type": "text", "required": false,
                "explanation": "old", "_metadata": {"field_name": "First Name", "source_pdf": "a.pdf"}}}"#),
            &mut report,
        );
        let idx = state.get("first_name").unwrap().order_index;

        let outcome = state.apply(
            &[raw("b.pdf", "First Name")],
            proposal(r#"{"first_name": {"label": "What is your first name?", "type": "text", "required": true,
                "explanation": "new", "_metadata": {"field_name": "First Name", "source_pdf": "b.pdf", "order_index": 99}}}"#),
            &mut report,
        );

        assert_eq!(outcome, BatchOutcome { created: 0, merged: 1, uncovered: 0 });
        let f = state.get("first_name").unwrap();
        assert_eq!(f.source_documents, vec!["a.pdf", "b.pdf"]);
        assert_eq!(f.label, "What is your first name?");
        assert_eq!(f.explanation.as_deref(), Some("new"));
        assert!(f.required);
        assert_eq!(f.order_index, idx, "group kept without explicit reassignment");
    }

    #[test]
    fn explicit_merge_into_with_different_id() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "Name:")],
            proposal(r#"{"name": {"label": "Name?", "type": "text", "required": true,
                "_metadata": {"field_name": "Name:", "source_pdf": "a.pdf"}}}"#),
            &mut report,
        );
        state.apply(
            &[raw("b.pdf", "Applicant Name")],
            proposal(r#"{"applicant_name": {"label": "What is your name?", "type": "text", "required": true,
                "_metadata": {"field_name": "Applicant Name", "source_pdf": "b.pdf", "merge_into": "name"}}}"#),
            &mut report,
        );

        assert_eq!(state.len(), 1);
        assert_eq!(state.get("name").unwrap().source_documents, vec!["a.pdf", "b.pdf"]);
        assert_eq!(state.canonical_for("b.pdf", "Applicant Name"), Some("name"));
    }

    #[test]
    fn first_and_last_name_never_merge() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "First Name")],
            proposal(r#"{"first_name": {"label": "First name?", "type": "text", "required": true,
                "_metadata": {"field_name": "First Name", "source_pdf": "a.pdf", "order_index": 0}}}"#),
            &mut report,
        );
        state.apply(
            &[raw("a.pdf", "Last Name")],
            proposal(r#"{"last_name": {"label": "Last name?", "type": "text", "required": true,
                "_metadata": {"field_name": "Last Name", "source_pdf": "a.pdf", "order_index": 0}}}"#),
            &mut report,
        );

        assert_eq!(state.len(), 2);
        assert_ne!(
            state.canonical_for("a.pdf", "First Name"),
            state.canonical_for("a.pdf", "Last Name")
        );
        // order_index 0 existed before the second batch, so this is an explicit join
        assert_eq!(state.get("first_name").unwrap().order_index, state.get("last_name").unwrap().order_index);
    }

    #[test]
    fn batch_local_group_keys_get_fresh_indices() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "Email")],
            proposal(r#"{"email": {"label": "Email?", "type": "text", "required": false,
                "_metadata": {"field_name": "Email", "source_pdf": "a.pdf"}}}"#),
            &mut report,
        );
        assert_eq!(state.get("email").unwrap().order_index, 0);

        // keys 7 and 3 are unknown groups: two fresh indices, shared per key
        state.apply(
            &[raw("a.pdf", "Street"), raw("a.pdf", "City"), raw("a.pdf", "Employer")],
            proposal(r#"{
                "street": {"label": "Street?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Street", "source_pdf": "a.pdf", "order_index": 7}},
                "employer": {"label": "Employer?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Employer", "source_pdf": "a.pdf", "order_index": 3}},
                "city": {"label": "City?", "type": "text", "required": false,
                    "_metadata": {"field_name": "City", "source_pdf": "a.pdf", "order_index": 7}}
            }"#),
            &mut report,
        );

        let street = state.get("street").unwrap().order_index;
        let city = state.get("city").unwrap().order_index;
        let employer = state.get("employer").unwrap().order_index;
        assert_eq!(street, city);
        assert_ne!(street, employer);
        assert_eq!((street, employer), (1, 2));
        assert_ne!(street, 0, "a local key never joins an existing group by accident");
    }

    #[test]
    fn colliding_groups_merge_only_when_reassigned() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "Street"), raw("a.pdf", "City")],
            proposal(r#"{
                "street": {"label": "Street?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Street", "source_pdf": "a.pdf", "order_index": 0}},
                "city": {"label": "City?", "type": "text", "required": false,
                    "_metadata": {"field_name": "City", "source_pdf": "a.pdf", "order_index": 0}}
            }"#),
            &mut report,
        );
        state.apply(
            &[raw("b.pdf", "Zip")],
            proposal(r#"{"zip": {"label": "Zip?", "type": "text", "required": false,
                "_metadata": {"field_name": "Zip", "source_pdf": "b.pdf", "order_index": 5}}}"#),
            &mut report,
        );
        assert_eq!(state.order_indices().len(), 2);

        // Without reassign_group, a different index on an existing entry is ignored.
        state.apply(
            &[],
            proposal(r#"{"street": {"label": "Street?", "type": "text", "required": false,
                "_metadata": {"field_name": "Street", "order_index": 1}}}"#),
            &mut report,
        );
        assert_eq!(state.order_indices().len(), 2);

        // With it, the whole group of `street` moves into the zip group.
        let zip_group = state.get("zip").unwrap().order_index;
        state.apply(
            &[],
            proposal(&format!(
                r#"{{"street": {{"label": "Street?", "type": "text", "required": false,
                "_metadata": {{"field_name": "Street", "order_index": {}, "reassign_group": true}}}}}}"#,
                zip_group
            )),
            &mut report,
        );
        assert_eq!(state.order_indices().len(), 1);
        assert_eq!(state.get("city").unwrap().order_index, zip_group);
    }

    #[test]
    fn semantically_identical_parent_is_merged_across_batches() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "Spouse Name")],
            proposal(r#"{
                "are_you_married": {"label": "Are you married?", "type": "boolean", "required": false,
                    "_metadata": {"field_name": "are_you_married", "is_parent_question": true, "generated": true}},
                "spouse_name": {"label": "Spouse name?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Spouse Name", "source_pdf": "a.pdf",
                                  "parent": "are_you_married",
                                  "parent_condition": {"operator": "equals", "value": true}}}
            }"#),
            &mut report,
        );
        state.apply(
            &[raw("b.pdf", "Spouse DOB")],
            proposal(r#"{
                "is_married": {"label": "  are you MARRIED ", "type": "boolean", "required": false,
                    "_metadata": {"field_name": "is_married", "is_parent_question": true, "generated": true}},
                "spouse_dob": {"label": "Spouse date of birth?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Spouse DOB", "source_pdf": "b.pdf", "parent": "is_married"}}
            }"#),
            &mut report,
        );

        assert_eq!(state.parent_question_count(), 1);
        assert!(state.get("is_married").is_none());
        assert_eq!(state.get("spouse_dob").unwrap().parent_id.as_deref(), Some("are_you_married"));
        let spouse = state.get("spouse_name").unwrap();
        assert_eq!(spouse.parent_id.as_deref(), Some("are_you_married"));
        assert_eq!(spouse.parent_condition.as_ref().unwrap()["operator"], "equals");
        assert!(state.get("are_you_married").unwrap().generated);
    }

    #[test]
    fn relabelled_parent_still_matches_new_wording() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        let married = |id: &str, label: &str| {
            proposal(&format!(
                r#"{{"{id}": {{"label": "{label}", "type": "boolean", "required": false,
                    "_metadata": {{"field_name": "{id}", "is_parent_question": true, "generated": true}}}}}}"#
            ))
        };

        state.apply(&[], married("married", "Are you married?"), &mut report);
        state.apply(&[], married("married", "Are you currently married?"), &mut report);
        state.apply(&[], married("currently_married", "Are you currently married?"), &mut report);
        state.apply(&[], married("is_married", "Are you married?"), &mut report);

        assert_eq!(state.parent_question_count(), 1);
        assert_eq!(state.get("married").unwrap().label, "Are you currently married?");
        assert!(state.get("currently_married").is_none());
    }

    #[test]
    fn out_of_range_order_index_is_not_an_existing_group() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "First")],
            proposal(r#"{"first": {"label": "First?", "type": "text", "required": false,
                "_metadata": {"field_name": "First", "source_pdf": "a.pdf", "order_index": 0}}}"#),
            &mut report,
        );
        state.apply(
            &[raw("a.pdf", "Second")],
            proposal(r#"{"second": {"label": "Second?", "type": "text", "required": false,
                "_metadata": {"field_name": "Second", "source_pdf": "a.pdf", "order_index": 4294967296}}}"#),
            &mut report,
        );
        assert_eq!(state.get("first").unwrap().order_index, 0);
        assert_ne!(state.get("second").unwrap().order_index, 0);
        assert_eq!(state.order_indices().len(), 2);
    }

    #[test]
    fn distinct_parent_questions_stay_distinct() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[],
            proposal(r#"{
                "has_children": {"label": "Do you have children?", "type": "boolean", "required": false,
                    "_metadata": {"field_name": "has_children", "is_parent_question": true}},
                "num_children": {"label": "How many children do you have?", "type": "number", "required": false,
                    "_metadata": {"field_name": "num_children", "is_parent_question": true}}
            }"#),
            &mut report,
        );
        assert_eq!(state.parent_question_count(), 2);
    }

    #[test]
    fn dangling_and_cyclic_parents_are_dropped() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "A"), raw("a.pdf", "B")],
            proposal(r#"{
                "a": {"label": "A?", "type": "text", "required": false,
                    "_metadata": {"field_name": "A", "source_pdf": "a.pdf", "parent": "ghost"}},
                "b": {"label": "B?", "type": "text", "required": false,
                    "_metadata": {"field_name": "B", "source_pdf": "a.pdf", "parent": "a"}}
            }"#),
            &mut report,
        );
        assert!(state.get("a").unwrap().parent_id.is_none());
        assert_eq!(state.get("b").unwrap().parent_id.as_deref(), Some("a"));

        state.apply(
            &[],
            proposal(r#"{"a": {"label": "A?", "type": "text", "required": false,
                "_metadata": {"field_name": "A", "parent": "b"}}}"#),
            &mut report,
        );
        assert!(state.get("a").unwrap().parent_id.is_none());
        assert_eq!(report.warnings().len(), 2);
    }

    #[test]
    fn every_parent_resolves() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        state.apply(
            &[raw("a.pdf", "Child1"), raw("a.pdf", "Child2")],
            proposal(r#"{
                "has_kids": {"label": "Do you have children?", "type": "boolean", "required": false,
                    "_metadata": {"field_name": "has_kids", "is_parent_question": true}},
                "child1": {"label": "First child?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Child1", "source_pdf": "a.pdf", "parent": "has_kids"}},
                "child2": {"label": "Second child?", "type": "text", "required": false,
                    "_metadata": {"field_name": "Child2", "source_pdf": "a.pdf", "parent": "nope"}}
            }"#),
            &mut report,
        );
        for f in state.fields() {
            if let Some(p) = &f.parent_id {
                assert!(state.get(p).is_some(), "{} -> {}", f.canonical_id, p);
            }
        }
    }

    #[test]
    fn uncovered_raw_fields_are_reported() {
        let mut state = ConsolidationState::new();
        let mut report = RunReport::new();
        let outcome = state.apply(
            &[raw("a.pdf", "Kept"), raw("a.pdf", "Forgotten")],
            proposal(r#"{"kept": {"label": "Kept?", "type": "text", "required": false,
                "_metadata": {"field_name": "Kept", "source_pdf": "a.pdf"}}}"#),
            &mut report,
        );
        assert_eq!(outcome.uncovered, 1);
        assert!(report.warnings()[0].message.contains("Forgotten"));
    }

    #[test]
    fn unprocessed_fields_get_unique_ids_and_fresh_groups() {
        let mut state = ConsolidationState::new();
        let added = state.add_unprocessed(&[raw("a.pdf", "Name:"), raw("b.pdf", "Name:"), raw("b.pdf", "E-mail")]);
        assert_eq!(added, 3);
        let ids: Vec<_> = state.fields().map(|f| f.canonical_id.as_str()).collect();
        assert_eq!(ids, vec!["name", "name_2", "e_mail"]);
        assert_eq!(state.order_indices().len(), 3);
        assert!(state.fields().all(|f| f.unprocessed && f.parent_id.is_none()));
        assert_eq!(state.add_unprocessed(&[raw("a.pdf", "Name:")]), 0);
    }

    #[test]
    fn question_normalization() {
        assert_eq!(normalize_question("Are you   married?"), "are you married");
        assert_eq!(normalize_question("ARE YOU MARRIED"), "are you married");
        assert_ne!(normalize_question("Do you have children?"), normalize_question("How many children?"));
        assert_eq!(slugify("  Date of Birth (MM/DD) "), "date_of_birth_mm_dd");
    }
}
