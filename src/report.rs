use console::style;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Extraction,
    Reasoning,
    Validation,
    Consolidation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Extraction => "extract",
            Stage::Reasoning => "reasoning",
            Stage::Validation => "validate",
            Stage::Consolidation => "consolidate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub stage: Stage,
    pub message: String,
}

/// Warnings and counters collected over one run, printed once at the end.
#[derive(Debug, Default)]
pub struct RunReport {
    warnings: Vec<Warning>,
    pub raw_fields: usize,
    pub canonical_fields: usize,
    pub parent_questions: usize,
    pub groups: usize,
    pub reasoning_calls: usize,
    pub skipped_files: Vec<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning. Also goes to the log file so it is timestamped
    /// alongside the surrounding debug output.
    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%stage, "{}", message);
        self.warnings.push(Warning { stage, message });
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn print_summary(&self, extract_only: bool) {
        println!();
        println!("{}", style("SUMMARY").bold());
        println!("{}", "=".repeat(60));
        println!("Total fields extracted: {}", self.raw_fields);
        if !extract_only {
            println!("Reasoning calls:        {}", self.reasoning_calls);
            println!("Final combined fields:  {}", self.canonical_fields);
            println!("Generated parent questions: {}", self.parent_questions);
            println!("Field groups:           {}", self.groups);
        }
        if !self.skipped_files.is_empty() {
            println!("Skipped files:          {}", self.skipped_files.join(", "));
        }

        if self.warnings.is_empty() {
            println!("{}", style("No warnings.").green());
            return;
        }

        println!();
        println!("{} ({})", style("Warnings").yellow().bold(), self.warnings.len());
        for w in &self.warnings {
            println!("  [{}] {}", style(w.stage).dim(), w.message);
        }
    }
}
