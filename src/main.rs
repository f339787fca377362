use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod assemble;
mod batch;
mod config;
mod consolidate;
mod error;
mod extract;
mod inputs;
mod llm;
mod ops;
mod report;

use config::{Config, FallbackPolicy, LlmProvider, Overrides};
use error::ConfigError;
use report::RunReport;

#[derive(Parser)]
#[command(name = "formfuse")]
#[command(version)]
#[command(about = "Merge AcroForm fields from many PDFs into one questionnaire", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract fields from PDFs and consolidate them
    Run {
        /// PDF files or directories to process
        pdf_files: Vec<PathBuf>,

        /// File listing one PDF path per line (# starts a comment)
        #[arg(long)]
        input_list: Option<PathBuf>,

        #[arg(short, long, default_value = config::DEFAULT_OUTPUT)]
        output: PathBuf,

        /// API key for the reasoning service (defaults to the provider's env var)
        #[arg(long)]
        api_key: Option<String>,

        /// Fields per reasoning request
        #[arg(long, allow_negative_numbers = true)]
        batch_size: Option<i64>,

        /// Only extract, write raw fields without consolidation
        #[arg(long)]
        extract_only: bool,

        /// Skip unreadable PDFs instead of failing
        #[arg(long)]
        best_effort: bool,

        /// What to do when a batch fails after all retries
        #[arg(long, value_enum)]
        on_failure: Option<FallbackPolicy>,

        #[arg(long, value_enum)]
        provider: Option<LlmProvider>,

        #[arg(long)]
        model: Option<String>,
    },
    /// Show or update saved defaults
    Config {
        #[arg(long, value_enum)]
        provider: Option<LlmProvider>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long, allow_negative_numbers = true)]
        batch_size: Option<i64>,

        #[arg(long, value_enum)]
        on_failure: Option<FallbackPolicy>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let app_dir = Config::get_app_data_dir();
    let file_appender = tracing_appender::rolling::never(app_dir, "formfuse.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let stderr_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(tracing_subscriber::EnvFilter::new("debug,lopdf=info,hyper=info,reqwest=info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
        .init();

    match cli.command {
        Commands::Run {
            pdf_files,
            input_list,
            output,
            api_key,
            batch_size,
            extract_only,
            best_effort,
            on_failure,
            provider,
            model,
        } => {
            let overrides = Overrides { api_key, batch_size, provider, model, on_failure, extract_only };
            // Settings and credentials are checked before any PDF is opened.
            let settings = Config::load().resolve(&overrides)?;
            let request = ops::RunRequest { pdf_files, input_list, output, best_effort };

            let mut report = RunReport::new();
            let result = ops::run(&request, &settings, &mut report).await;
            report.print_summary(settings.reasoning.is_none());

            if let Err(e) = result {
                tracing::error!("Run failed: {}", e);
                drop(_guard);
                std::process::exit(1);
            }
        }
        Commands::Config { provider, model, batch_size, on_failure } => {
            let mut config = Config::load();
            let changed = provider.is_some() || model.is_some() || batch_size.is_some() || on_failure.is_some();

            if let Some(size) = batch_size {
                if size < 1 {
                    return Err(ConfigError::InvalidBatchSize(size).into());
                }
                config.batch_size = Some(size);
            }
            if let Some(p) = provider {
                config.llm_provider = p;
            }
            if let Some(m) = model {
                config.model = Some(m);
            }
            if let Some(policy) = on_failure {
                config.on_failure = policy;
            }

            if changed {
                config.save()?;
                println!("Saved to {}", Config::config_path().display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
