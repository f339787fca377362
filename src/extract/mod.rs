pub mod text;

use crate::error::ExtractionError;
use crate::report::{RunReport, Stage};
use indexmap::IndexMap;
use lopdf::{Dictionary, Document, Object, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use text::decode_pdf_string;

// Field flag bits (PDF 32000-1, 12.7.3.1 and 12.7.4.2)
const FF_REQUIRED: i64 = 1 << 1;
const FF_RADIO: i64 = 1 << 15;
const FF_PUSHBUTTON: i64 = 1 << 16;

const MAX_FIELD_DEPTH: usize = 32;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Checkbox,
    Radio,
    Choice,
    Signature,
    Boolean,
    Number,
    Other,
}

impl FieldKind {
    /// Lenient mapping for type names coming back from the reasoning service.
    pub fn from_type_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" | "string" | "textarea" => FieldKind::Text,
            "checkbox" | "button" => FieldKind::Checkbox,
            "radio" => FieldKind::Radio,
            "choice" | "select" | "dropdown" => FieldKind::Choice,
            "signature" => FieldKind::Signature,
            "boolean" | "bool" | "yes_no" => FieldKind::Boolean,
            "number" | "integer" => FieldKind::Number,
            _ => FieldKind::Other,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Position {
    /// 1-based page number, when the widget could be located.
    pub page: Option<u32>,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One form field as the PDF exposes it. Immutable after extraction.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RawField {
    #[serde(rename = "field_name")]
    pub name: String,
    #[serde(rename = "field_type")]
    pub kind: FieldKind,
    pub required: bool,
    pub options: Option<Vec<String>>,
    pub max_length: Option<u32>,
    #[serde(rename = "source_pdf")]
    pub source_document: String,
    pub value: Option<String>,
    pub position: Option<Position>,
}

impl RawField {
    /// Identity used by the reverse index: names are only unique per document.
    pub fn key(&self) -> (String, String) {
        (self.source_document.clone(), self.name.clone())
    }
}

/// Extract every field of every document, in document order.
///
/// A document that cannot be read aborts the run unless `best_effort` is
/// set, in which case it is skipped and noted in the report.
pub fn extract_all(
    paths: &[PathBuf],
    best_effort: bool,
    report: &mut RunReport,
) -> Result<Vec<RawField>, ExtractionError> {
    let mut all = Vec::new();

    for (path, source) in paths.iter().zip(document_labels(paths)) {
        tracing::info!("Processing: {} as {}", path.display(), source);
        match extract_file(path, &source, report) {
            Ok(fields) => {
                tracing::info!("  Extracted {} fields", fields.len());
                all.extend(fields);
            }
            Err(e) if best_effort => {
                report.warn(Stage::Extraction, format!("skipped: {}", e));
                report.skipped_files.push(path.display().to_string());
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!("Total fields extracted: {}", all.len());
    report.raw_fields = all.len();
    Ok(all)
}

/// Name each document's fields are attributed to: its file name, or the
/// path as given when several inputs share that file name.
pub fn document_labels(paths: &[PathBuf]) -> Vec<String> {
    let names: Vec<String> = paths
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.display().to_string())
        })
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for name in &names {
        *counts.entry(name.as_str()).or_default() += 1;
    }

    paths
        .iter()
        .zip(&names)
        .map(|(path, name)| {
            if counts.get(name.as_str()).copied().unwrap_or(0) > 1 {
                path.display().to_string()
            } else {
                name.clone()
            }
        })
        .collect()
}

/// Fields of one document, tagged with `source`.
pub fn extract_file(path: &Path, source: &str, report: &mut RunReport) -> Result<Vec<RawField>, ExtractionError> {
    if !path.exists() {
        return Err(ExtractionError::NotFound { path: path.to_path_buf() });
    }

    let doc = Document::load(path).map_err(|e| ExtractionError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if doc.is_encrypted() {
        return Err(ExtractionError::Encrypted { path: path.to_path_buf() });
    }

    let roots = acroform_fields(&doc).ok_or_else(|| ExtractionError::NoAcroForm {
        path: path.to_path_buf(),
    })?;

    let walker = FieldWalker::new(&doc, source);
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    for root in roots {
        walker.walk(root, Inherited::default(), 0, &mut visited, &mut found, report);
    }

    // Names are unique per document; the last occurrence wins.
    let mut by_name: IndexMap<String, RawField> = IndexMap::new();
    for field in found {
        if by_name.contains_key(&field.name) {
            report.warn(
                Stage::Extraction,
                format!("{}: duplicate field name `{}`, keeping last occurrence", source, field.name),
            );
        }
        by_name.insert(field.name.clone(), field);
    }

    Ok(by_name.into_values().collect())
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    resolve(doc, obj).and_then(|o| o.as_dict().ok())
}

/// Top-level `/Fields` entries of the catalog's `/AcroForm`, or `None` when
/// the document has no interactive form.
fn acroform_fields(doc: &Document) -> Option<Vec<&Object>> {
    let catalog = doc.catalog().ok()?;
    let acroform = resolve_dict(doc, catalog.get(b"AcroForm").ok()?)?;
    let fields = resolve(doc, acroform.get(b"Fields").ok()?)?.as_array().ok()?;
    Some(fields.iter().collect())
}

#[derive(Default, Clone)]
struct Inherited {
    name: Option<String>,
    field_type: Option<Vec<u8>>,
    flags: Option<i64>,
}

struct FieldWalker<'a> {
    doc: &'a Document,
    source: &'a str,
    widget_pages: HashMap<ObjectId, u32>,
    page_numbers: HashMap<ObjectId, u32>,
}

impl<'a> FieldWalker<'a> {
    fn new(doc: &'a Document, source: &'a str) -> Self {
        let mut widget_pages = HashMap::new();
        let mut page_numbers = HashMap::new();

        for (number, page_id) in doc.get_pages() {
            page_numbers.insert(page_id, number);
            let annots = doc
                .get_object(page_id)
                .ok()
                .and_then(|p| p.as_dict().ok())
                .and_then(|p| p.get(b"Annots").ok())
                .and_then(|a| resolve(doc, a))
                .and_then(|a| a.as_array().ok());
            for annot in annots.into_iter().flatten() {
                if let Object::Reference(id) = annot {
                    widget_pages.insert(*id, number);
                }
            }
        }

        Self { doc, source, widget_pages, page_numbers }
    }

    fn walk(
        &self,
        node: &Object,
        inherited: Inherited,
        depth: usize,
        visited: &mut HashSet<ObjectId>,
        out: &mut Vec<RawField>,
        report: &mut RunReport,
    ) {
        if depth > MAX_FIELD_DEPTH {
            report.warn(Stage::Extraction, format!("{}: field tree too deep, truncated", self.source));
            return;
        }
        let id = match node {
            Object::Reference(id) => {
                if !visited.insert(*id) {
                    return;
                }
                Some(*id)
            }
            _ => None,
        };
        let dict = match resolve_dict(self.doc, node) {
            Some(d) => d,
            None => return,
        };

        let partial = get_text(dict, b"T");
        let name = match (&inherited.name, &partial) {
            (Some(prefix), Some(p)) => Some(format!("{}.{}", prefix, p)),
            (None, Some(p)) => Some(p.clone()),
            (prefix, None) => prefix.clone(),
        };
        let here = Inherited {
            name,
            field_type: dict
                .get(b"FT")
                .ok()
                .and_then(|o| o.as_name().ok())
                .map(|n| n.to_vec())
                .or(inherited.field_type),
            flags: dict.get(b"Ff").ok().and_then(|o| o.as_i64().ok()).or(inherited.flags),
        };

        let kids: Vec<&Object> = dict
            .get(b"Kids")
            .ok()
            .and_then(|k| resolve(self.doc, k))
            .and_then(|k| k.as_array().ok())
            .map(|k| k.iter().collect())
            .unwrap_or_default();

        // Kids carrying their own /T are child fields; the rest are widgets.
        let child_fields: Vec<&Object> = kids
            .iter()
            .copied()
            .filter(|k| resolve_dict(self.doc, k).map_or(false, |d| d.has(b"T")))
            .collect();

        if !child_fields.is_empty() {
            for kid in child_fields {
                self.walk(kid, here.clone(), depth + 1, visited, out, report);
            }
            return;
        }

        let name = match here.name.clone().filter(|n| !n.trim().is_empty()) {
            Some(n) => n,
            None => {
                report.warn(Stage::Extraction, format!("{}: skipping field without a name", self.source));
                return;
            }
        };

        let widget = kids
            .first()
            .and_then(|k| match k {
                Object::Reference(wid) => Some((Some(*wid), resolve_dict(self.doc, k)?)),
                _ => Some((None, resolve_dict(self.doc, k)?)),
            })
            .unwrap_or((id, dict));

        let flags = here.flags.unwrap_or(0);
        out.push(RawField {
            name,
            kind: field_kind(here.field_type.as_deref(), flags),
            required: flags & FF_REQUIRED != 0,
            options: options(self.doc, dict),
            max_length: dict
                .get(b"MaxLen")
                .ok()
                .and_then(|o| o.as_i64().ok())
                .and_then(|n| u32::try_from(n).ok()),
            source_document: self.source.to_string(),
            value: get_text(dict, b"V"),
            position: self.position(widget.0, widget.1),
        });
    }

    fn position(&self, widget_id: Option<ObjectId>, widget: &Dictionary) -> Option<Position> {
        let rect = widget.get(b"Rect").ok().and_then(|r| resolve(self.doc, r))?.as_array().ok()?;
        if rect.len() != 4 {
            return None;
        }
        let n: Vec<f32> = rect.iter().filter_map(as_f32).collect();
        if n.len() != 4 {
            return None;
        }
        let page = widget_id
            .and_then(|id| self.widget_pages.get(&id).copied())
            .or_else(|| match widget.get(b"P") {
                Ok(Object::Reference(pid)) => self.page_numbers.get(pid).copied(),
                _ => None,
            });

        Some(Position {
            page,
            x: n[0].min(n[2]),
            y: n[1].min(n[3]),
            width: (n[2] - n[0]).abs(),
            height: (n[3] - n[1]).abs(),
        })
    }
}

fn field_kind(field_type: Option<&[u8]>, flags: i64) -> FieldKind {
    match field_type {
        Some(b"Tx") => FieldKind::Text,
        Some(b"Btn") if flags & FF_PUSHBUTTON != 0 => FieldKind::Other,
        Some(b"Btn") if flags & FF_RADIO != 0 => FieldKind::Radio,
        Some(b"Btn") => FieldKind::Checkbox,
        Some(b"Ch") => FieldKind::Choice,
        Some(b"Sig") => FieldKind::Signature,
        _ => FieldKind::Other,
    }
}

fn options(doc: &Document, dict: &Dictionary) -> Option<Vec<String>> {
    let opts = dict.get(b"Opt").ok().and_then(|o| resolve(doc, o))?.as_array().ok()?;
    let values: Vec<String> = opts
        .iter()
        .filter_map(|o| match resolve(doc, o)? {
            // [export display] pairs: the display text is what a person reads
            Object::Array(pair) => pair.last().and_then(object_text),
            other => object_text(other),
        })
        .collect();
    (!values.is_empty()).then_some(values)
}

fn get_text(dict: &Dictionary, key: &[u8]) -> Option<String> {
    dict.get(key).ok().and_then(object_text)
}

fn object_text(obj: &Object) -> Option<String> {
    let s = match obj {
        Object::String(bytes, _) | Object::Name(bytes) => decode_pdf_string(bytes),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn as_f32(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    }
}
