use crate::error::ConfigError;
use crate::report::{RunReport, Stage};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read an input list: one path per line, blanks and `#` comments ignored.
pub fn read_input_list(list: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let contents = std::fs::read_to_string(list).map_err(|source| ConfigError::InputList {
        path: list.to_path_buf(),
        source,
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .map_or(false, |e| e.to_string_lossy().eq_ignore_ascii_case("pdf"))
}

/// Expand directories and screen out non-PDF paths. Missing files are kept
/// so extraction reports them against the file name.
pub fn resolve_inputs(
    positional: &[PathBuf],
    input_list: Option<&Path>,
    report: &mut RunReport,
) -> Result<Vec<PathBuf>, ConfigError> {
    let mut candidates: Vec<PathBuf> = positional.to_vec();
    if let Some(list) = input_list {
        candidates.extend(read_input_list(list)?);
    }

    let mut resolved = Vec::new();
    for path in candidates {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(&path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_pdf(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            if found.is_empty() {
                report.warn(Stage::Input, format!("no PDF files under {}", path.display()));
            }
            resolved.extend(found);
        } else if !is_pdf(&path) {
            report.warn(Stage::Input, format!("not a PDF file, skipping: {}", path.display()));
        } else if !resolved.contains(&path) {
            resolved.push(path);
        }
    }

    if resolved.is_empty() {
        return Err(ConfigError::NoInputs);
    }
    Ok(resolved)
}
