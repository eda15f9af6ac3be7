use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use intake_forms::config;
use intake_forms::pipeline::extraction::{
    CancellationToken, ExtractionReport, RunStatus, SchedulerEvent, SectionScheduler,
};
use intake_forms::pipeline::llm::OllamaClient;
use intake_forms::{DocumentProcessor, PipelineConfig};

#[derive(Parser, Debug)]
#[command(
    name = "intake-forms",
    version,
    about = "Fill a medical intake form from a visit transcript, section by section"
)]
struct Cli {
    /// Intake form document (PDF or page image)
    document: PathBuf,

    /// Plain-text visit transcript
    #[arg(long, short)]
    transcript: PathBuf,

    /// JSON pipeline config; missing keys take defaults
    #[arg(long, short, env = "INTAKE_FORMS_CONFIG")]
    config: Option<PathBuf>,

    /// Report path (defaults to ~/.intake-forms/runs/<document>-<run>.json)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Maximum sections extracted concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Text-generation model
    #[arg(long)]
    model: Option<String>,

    /// Score the merged result against the transcript
    #[arg(long, default_value_t = false)]
    evaluate: bool,

    /// JSON weight table for evaluation (`{"path": weight}`)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Do not attach grounding crops to model calls
    #[arg(long, default_value_t = false)]
    no_images: bool,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if self.evaluate {
            config.evaluate = true;
        }
        if let Some(weights) = &self.weights {
            config.weights_path = Some(weights.clone());
        }
        if self.no_images {
            config.include_images = false;
            config.partition_with_images = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    intake_forms::init_tracing();
    let cli = Cli::parse();
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let mut pipeline_config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    cli.apply(&mut pipeline_config);
    pipeline_config.validate()?;

    let transcript = std::fs::read_to_string(&cli.transcript)
        .with_context(|| format!("failed to read transcript {}", cli.transcript.display()))?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, remaining sections will be skipped");
                token.cancel();
            }
        });
    }

    let document = cli.document.clone();
    let report = tokio::task::spawn_blocking(move || -> Result<ExtractionReport> {
        preflight(&mut pipeline_config)?;
        let processor = DocumentProcessor::from_config(pipeline_config)?;
        let scheduler = SectionScheduler::new(processor.config().max_workers)
            .with_cancellation(token)
            .with_progress(|event| {
                if let SchedulerEvent::SectionFinished {
                    section_id,
                    success,
                    completed,
                    total,
                } = event
                {
                    tracing::info!(section_id, success, "Section {completed}/{total} done");
                }
            });
        Ok(processor.process_with_scheduler(&document, &transcript, &scheduler)?)
    })
    .await
    .context("pipeline task aborted")??;

    let output = cli.output.unwrap_or_else(|| {
        config::default_output_dir().join(format!("{}-{}.json", report.document_key, report.run_id))
    });
    report.write_json(&output)?;

    println!(
        "{}: {} of {} sections extracted -> {}",
        report.document_key,
        report.succeeded,
        report.succeeded + report.failed,
        output.display()
    );
    if let Some(evaluation) = &report.evaluation {
        println!(
            "quality {:.1} ({:?}){}",
            evaluation.overall_score,
            evaluation.confidence,
            if evaluation.review_recommended {
                ", review recommended"
            } else {
                ""
            }
        );
    }

    if report.status() == RunStatus::Failed {
        bail!("no section could be extracted");
    }
    Ok(())
}

/// Confirm Ollama is reachable and resolve the configured model to an
/// installed one before any document work starts.
fn preflight(config: &mut PipelineConfig) -> Result<()> {
    let client = OllamaClient::new(&config.ollama_url, config.timeout_secs)?;
    let model = client
        .find_best_model(&config.model)
        .with_context(|| format!("model '{}' is not available at {}", config.model, config.ollama_url))?;
    if model != config.model {
        tracing::info!(requested = %config.model, resolved = %model, "Using installed model");
        config.model = model;
    }
    Ok(())
}
