use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ai_client::{ChatModel, Claude, OpenAi};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use persona_lab::config::LlmProvider;
use persona_lab::{
    load_comparison_file, load_config, AppConfig, FileConfig, LlmGenerator, LlmOracle,
    LlmRefiner, LlmRepairer, ProgressEvent, ProgressSink, RoundController, RunConfig, RunLog,
    RunRequest, TracingSink,
};

#[derive(Parser)]
#[command(
    name = "persona-lab",
    about = "Generate candidates, test them against simulated personas, refine the winners"
)]
struct Cli {
    /// Path to config TOML file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Text file describing what to generate candidates for
    #[arg(long)]
    context: PathBuf,

    /// JSON file with `user_personas`, `titles` and optional `extra_titles`
    #[arg(long)]
    comparison: PathBuf,

    /// Where to write the ranked final candidates
    #[arg(long, default_value = "persona-lab-results.json")]
    output: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Forwards to both the log and the persisted run timeline.
struct Fanout {
    tracing: TracingSink,
    log: Arc<RunLog>,
}

impl ProgressSink for Fanout {
    fn emit(&self, event: &ProgressEvent) {
        self.tracing.emit(event);
        self.log.emit(event);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("persona_lab=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("persona-lab starting...");

    let app = AppConfig::from_env()?;
    app.log_redacted();

    let file_config = match &cli.config {
        Some(path) => {
            info!(config = %path.display(), "Loading config");
            load_config(path)?
        }
        None => FileConfig::default(),
    };

    let comparison = load_comparison_file(&cli.comparison)?;
    let context = std::fs::read_to_string(&cli.context)
        .with_context(|| format!("Failed to read context file: {}", cli.context.display()))?;

    let mut run_config = RunConfig::from_file(&file_config)?;
    if file_config.run.use_extra_candidates {
        run_config = run_config.with_extra_candidates(comparison.extra_titles.clone());
    }

    let request = RunRequest::new(context, comparison.pool()?, comparison.personas()?);

    let models = &file_config.models;
    let judge = chat_model(
        &app,
        &models.judge,
        Some(models.judge_temperature),
        run_config.oracle_timeout,
    )?;
    let generation = chat_model(&app, &models.generation, None, run_config.generation_timeout)?;
    let refinement = chat_model(&app, &models.refinement, None, run_config.refinement_timeout)?;

    let repairer = Arc::new(LlmRepairer::new(generation.clone()));
    let mut generator = LlmGenerator::new(generation)
        .with_style_summary(models.style_summary)
        .with_repairer(repairer.clone());
    let mut refiner = LlmRefiner::new(refinement).with_repairer(repairer);
    if let Some(instructions) = &models.instructions {
        generator = generator.with_instructions(instructions.clone());
        refiner = refiner.with_instructions(instructions.clone());
    }
    let oracle = LlmOracle::new(judge, file_config.evaluation.response_parsing);

    let run_log = Arc::new(RunLog::new(request.run_id.clone()));
    let sink = Arc::new(Fanout {
        tracing: TracingSink,
        log: run_log.clone(),
    });

    let cancelled = Arc::new(AtomicBool::new(false));
    let ctrl_c_flag = cancelled.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight calls and stopping");
            ctrl_c_flag.store(true, Ordering::SeqCst);
        }
    });

    let controller = RoundController::new(
        Arc::new(generator),
        Arc::new(refiner),
        Arc::new(oracle),
        run_config,
        sink,
    )?
    .with_cancellation(cancelled);

    let result = controller.run(request).await;

    if let Err(e) = run_log.save() {
        warn!(error = %e, "Failed to save run log");
    }

    let outcome = result?;
    std::fs::write(&cli.output, serde_json::to_string_pretty(&outcome)?)
        .with_context(|| format!("Failed to write results: {}", cli.output.display()))?;

    for (rank, finalist) in outcome.candidates.iter().enumerate() {
        let percentage = finalist
            .percentage()
            .map(|p| format!("{p:.1}"))
            .unwrap_or_else(|| "unscored".to_string());
        info!(
            rank = rank + 1,
            percentage = %percentage,
            candidate = finalist.candidate.payload.as_str(),
            "Finalist"
        );
    }
    info!(
        output = %cli.output.display(),
        candidates = outcome.candidates.len(),
        "Run complete"
    );

    Ok(())
}

fn chat_model(
    app: &AppConfig,
    model: &str,
    temperature: Option<f32>,
    timeout: Duration,
) -> Result<Arc<dyn ChatModel>> {
    let model: Arc<dyn ChatModel> = match app.provider {
        LlmProvider::OpenAi => {
            let key = app
                .openai_api_key
                .as_deref()
                .context("OPENAI_API_KEY is not set")?;
            let mut client = OpenAi::new(key, model)
                .with_temperature(temperature)
                .with_request_timeout(timeout);
            if let Some(base) = &app.openai_api_base {
                client = client.with_base_url(base.clone());
            }
            Arc::new(client)
        }
        LlmProvider::Anthropic => {
            let key = app
                .anthropic_api_key
                .as_deref()
                .context("ANTHROPIC_API_KEY is not set")?;
            Arc::new(
                Claude::new(key, model)
                    .with_temperature(temperature)
                    .with_request_timeout(timeout),
            )
        }
    };
    Ok(model)
}
