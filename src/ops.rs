use crate::assemble;
use crate::batch::BatchPlan;
use crate::config::{FallbackPolicy, RunSettings};
use crate::consolidate::ConsolidationState;
use crate::error::{FormfuseError, ReasoningError};
use crate::extract::{self, RawField};
use crate::inputs;
use crate::llm::{LlmClient, ReasoningProvider};
use crate::report::{RunReport, Stage};
use console::style;
use std::path::PathBuf;

/// What the user asked for on the command line, apart from settings.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pdf_files: Vec<PathBuf>,
    pub input_list: Option<PathBuf>,
    pub output: PathBuf,
    pub best_effort: bool,
}

pub async fn run(request: &RunRequest, settings: &RunSettings, report: &mut RunReport) -> Result<(), FormfuseError> {
    let paths = inputs::resolve_inputs(&request.pdf_files, request.input_list.as_deref(), report)?;
    println!("Processing {} PDF file(s)", paths.len());
    println!("Output: {}", request.output.display());

    println!("\n{}", style("[STEP 1] Extracting acroforms from PDFs...").bold());
    let fields = extract::extract_all(&paths, request.best_effort, report)?;
    if fields.is_empty() {
        report.warn(Stage::Extraction, "no fields extracted from any PDF, nothing written");
        return Ok(());
    }

    let Some(reasoning) = &settings.reasoning else {
        let rendered = assemble::render_extract_only(&fields)?;
        assemble::write_output(&request.output, &rendered)?;
        println!("{} {}", style("Raw extraction saved to").green(), request.output.display());
        return Ok(());
    };

    println!(
        "\n{} {}",
        style("[STEP 2] Consolidating fields with").bold(),
        style(format!("{} ({})", reasoning.model, reasoning.base_url)).cyan()
    );
    let client = LlmClient::new(reasoning)?;
    let state = consolidate_fields(&client, &fields, settings.batch_size, settings.on_failure, report).await?;

    println!("\n{}", style("[STEP 3] Saving output...").bold());
    let rendered = assemble::render(&state)?;
    assemble::write_output(&request.output, &rendered)?;
    println!(
        "{} {} fields to {}",
        style("Saved").green(),
        state.len(),
        request.output.display()
    );
    Ok(())
}

/// Plan batches and push them through the provider one at a time. Each
/// request sees the canonical state left by every batch before it.
pub async fn consolidate_fields<P>(
    provider: &P,
    fields: &[RawField],
    batch_size: usize,
    on_failure: FallbackPolicy,
    report: &mut RunReport,
) -> Result<ConsolidationState, FormfuseError>
where
    P: ReasoningProvider + ?Sized,
{
    let plan = BatchPlan::new(fields, batch_size)?;
    let mut state = ConsolidationState::new();
    tracing::info!("{} fields in {} batches of up to {}", fields.len(), plan.len(), plan.batch_size());

    for batch in plan.iter() {
        let context = state.context();
        report.reasoning_calls += 1;
        println!(
            "  {} ({} fields)",
            style(format!("Batch {}/{}", batch.index + 1, plan.len())).dim(),
            batch.fields.len()
        );

        let (proposal, invalid) = match provider.propose(&context, &batch).await {
            Ok(result) => result,
            Err(e) => {
                fall_back(&mut state, &plan, batch.index, e, on_failure, report)?;
                break;
            }
        };

        for e in invalid {
            report.warn(Stage::Validation, format!("batch {}: dropped {}", batch.index + 1, e));
        }
        let outcome = state.apply(batch.fields, proposal, report);
        tracing::info!(
            "Batch {}: {} new, {} merged, {} uncovered; {} canonical fields so far",
            batch.index + 1,
            outcome.created,
            outcome.merged,
            outcome.uncovered,
            state.len()
        );
    }

    report.canonical_fields = state.len();
    report.parent_questions = state.parent_question_count();
    report.groups = state.order_indices().len();
    Ok(state)
}

fn fall_back(
    state: &mut ConsolidationState,
    plan: &BatchPlan<'_>,
    failed: usize,
    err: ReasoningError,
    on_failure: FallbackPolicy,
    report: &mut RunReport,
) -> Result<(), FormfuseError> {
    match on_failure {
        FallbackPolicy::Abort => {
            tracing::error!("Batch {} failed: {}", failed + 1, err);
            Err(err.into())
        }
        FallbackPolicy::ExtractOnly => {
            let remainder = plan.remainder(failed);
            let added = state.add_unprocessed(remainder);
            report.warn(
                Stage::Reasoning,
                format!(
                    "batch {} failed ({}); {} remaining fields written unprocessed",
                    failed + 1,
                    err,
                    added
                ),
            );
            Ok(())
        }
    }
}
