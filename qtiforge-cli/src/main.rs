use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use qtiforge_core::cache::FileCache;
use qtiforge_core::collaborators::{
    FileFeedbackSource, HttpModelClient, ModelClient, ModelFeedbackSource, ModelVisualAnalysis, PrecomputedAnalysis,
    RetryingModelClient,
};
use qtiforge_core::qti::{self, AnswerKey};
use qtiforge_core::retry::RetryPolicy;
use qtiforge_core::segmentation::SegmentationHints;
use qtiforge_core::storage::{AssetStorage, FileStorage, HttpStorage, RetryingStorage};
use qtiforge_core::{ExamProcessor, PipelineConfig, RunOptions};

#[derive(Parser)]
#[command(name = "qtiforge")]
#[command(about = "Split exam PDFs into questions and write QTI 3.0 items")]
struct Cli {
    /// Path to custom config file (YAML format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug details (decision traces, uploads)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert an exam PDF into one question.xml per question
    Convert(ConvertArgs),
    /// Rewrite the correct response of existing items from an answer key
    UpdateAnswers {
        /// Output tree written by `convert`
        #[arg(short, long)]
        dir: PathBuf,
        /// Answer key JSON: {"<question number>": "<letter>"}
        #[arg(short, long)]
        answer_key: PathBuf,
    },
    /// Repair known mojibake in existing items
    FixEncoding {
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Report leftover suspect byte sequences in existing items
    ScanEncoding {
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Print the effective configuration as YAML
    ShowConfig,
}

#[derive(Args)]
struct ConvertArgs {
    /// Path to the exam PDF
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory (one subdirectory per question)
    #[arg(short, long)]
    output: PathBuf,

    /// Answer key JSON: {"<question number>": "<letter>"}
    #[arg(short, long)]
    answer_key: Option<PathBuf>,

    /// Segmentation hints JSON; may be given more than once
    #[arg(long)]
    hints: Vec<PathBuf>,

    /// Corrected segmentation.json from an earlier run (skips segmentation)
    #[arg(long)]
    reentry: Option<PathBuf>,

    /// Layout XHTML from an OCR tool, used instead of the PDF text layer
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Directory containing libpdfium (defaults to system library lookup)
    #[arg(long, env = "PDFIUM_DYNAMIC_LIB_PATH")]
    pdfium_dir: Option<PathBuf>,

    /// Local directory for rendered images (default: <output>/assets)
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Public URL prefix the assets directory is served from
    #[arg(long)]
    assets_base_url: Option<String>,

    /// Upload images with HTTP PUT under this base URL instead of a local directory
    #[arg(long)]
    storage_url: Option<String>,

    #[arg(long, env = "QTIFORGE_STORAGE_TOKEN", hide_env_values = true)]
    storage_token: Option<String>,

    /// JSON model endpoint used for long-exam segmentation and, with
    /// --model-analysis / --model-feedback, for visual analysis and feedback
    #[arg(long)]
    model_endpoint: Option<String>,

    #[arg(long, env = "QTIFORGE_MODEL_KEY", hide_env_values = true)]
    model_key: Option<String>,

    /// Ask the model for per-question visual analysis
    #[arg(long)]
    model_analysis: bool,

    /// Ask the model for per-choice feedback
    #[arg(long)]
    model_feedback: bool,

    /// Precomputed visual analysis: <dir>/<Qn>.json
    #[arg(long)]
    visual_analysis_dir: Option<PathBuf>,

    /// Precomputed feedback JSON: {"Q1": {"A": "..."}}
    #[arg(long)]
    feedback: Option<PathBuf>,

    /// Segmentation cache directory
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Skip cache and force fresh segmentation
    #[arg(long)]
    skip_cache: bool,

    /// Network timeout for storage and model calls, in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Enable detailed profiling of all pipeline steps
    #[arg(long)]
    profile: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = PipelineConfig::load_with_fallback(cli.config.as_deref());
    if let Some(path) = &cli.config {
        log::info!("📋 Loaded config from: {}", path.display());
    }

    match cli.command {
        Command::Convert(args) => convert(args, config),
        Command::UpdateAnswers { dir, answer_key } => {
            let key = AnswerKey::load(&answer_key)?;
            log::info!("🔑 {} answers loaded from {}", key.len(), answer_key.display());
            let summary = qti::update_tree(&dir, &key)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.failed.is_empty() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::FixEncoding { dir } => {
            let summary = qti::fix_tree(&dir)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::ScanEncoding { dir } => {
            let findings = qti::scan_tree(&dir)?;
            for (path, suspects) in &findings {
                for suspect in suspects {
                    println!("{}:{}: {:?} in \"{}\"", path.display(), suspect.offset, suspect.sequence, suspect.context);
                }
            }
            if findings.is_empty() {
                println!("✅ No suspect sequences found");
            }
            Ok(())
        }
        Command::ShowConfig => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn convert(args: ConvertArgs, config: PipelineConfig) -> Result<()> {
    if !args.input.exists() {
        anyhow::bail!("input PDF not found at {}", args.input.display());
    }
    let timeout = Duration::from_secs(args.timeout_secs);
    let policy = RetryPolicy::from_config(&config.retry);

    let storage = create_storage(&args, policy.clone(), timeout)?;
    log::info!("📦 Storing images via {}", storage.name());

    let model: Option<Arc<dyn ModelClient>> = args.model_endpoint.as_deref().map(|endpoint| {
        let client = HttpModelClient::new(endpoint, args.model_key.clone(), timeout);
        Arc::new(RetryingModelClient::new(client, policy)) as Arc<dyn ModelClient>
    });

    let mut processor = create_processor(&args, storage, config)?
        .with_cache(Box::new(FileCache::new(&args.cache_dir)?));
    if let Some(model) = &model {
        processor = processor.with_model(Arc::clone(model));
    }

    if let Some(dir) = &args.visual_analysis_dir {
        processor = processor.with_visual_analysis(Box::new(PrecomputedAnalysis::new(dir)));
    } else if args.model_analysis {
        let model = model.clone().context("--model-analysis needs --model-endpoint")?;
        processor = processor.with_visual_analysis(Box::new(ModelVisualAnalysis::new(model)));
    }

    if let Some(path) = &args.feedback {
        processor = processor.with_feedback(Box::new(FileFeedbackSource::load(path)?));
    } else if args.model_feedback {
        let model = model.clone().context("--model-feedback needs --model-endpoint")?;
        processor = processor.with_feedback(Box::new(ModelFeedbackSource::new(model)));
    }

    let hints = if args.hints.is_empty() {
        None
    } else {
        let loaded = args
            .hints
            .iter()
            .map(|path| SegmentationHints::load(path))
            .collect::<Result<Vec<_>>>()?;
        Some(SegmentationHints::merge(loaded))
    };
    let answer_key = args.answer_key.as_deref().map(AnswerKey::load).transpose()?;

    let options = RunOptions {
        output_dir: args.output.clone(),
        hints,
        reentry: args.reentry.clone(),
        answer_key,
        skip_cache: args.skip_cache,
        profile: args.profile,
    };

    let summary = processor.process(&args.input, &options)?;
    println!(
        "✅ {} written, {} failed, {} quarantined, {} skipped → {}",
        summary.counts.succeeded,
        summary.counts.failed,
        summary.counts.quarantined,
        summary.counts.skipped,
        args.output.display()
    );
    if summary.halted.is_some() {
        std::process::exit(2);
    }
    Ok(())
}

fn create_storage(args: &ConvertArgs, policy: RetryPolicy, timeout: Duration) -> Result<Arc<dyn AssetStorage>> {
    if let Some(url) = &args.storage_url {
        let inner = HttpStorage::new(url, args.storage_token.clone(), timeout);
        return Ok(Arc::new(RetryingStorage::new(inner, policy)));
    }
    let dir = args.assets_dir.clone().unwrap_or_else(|| args.output.join("assets"));
    let inner = FileStorage::new(&dir, args.assets_base_url.clone())
        .with_context(|| format!("opening assets directory {}", dir.display()))?;
    Ok(Arc::new(RetryingStorage::new(inner, policy)))
}

#[cfg(feature = "pdfium-backend")]
fn create_processor(args: &ConvertArgs, storage: Arc<dyn AssetStorage>, config: PipelineConfig) -> Result<ExamProcessor> {
    use qtiforge_core::PdfPreprocessor;

    let mut preprocessor = PdfPreprocessor::new_with_pdfium(
        args.pdfium_dir.as_deref(),
        config.spatial_clustering.clone(),
        config.rendering.scale,
    )?;
    if let Some(layout) = &args.layout {
        preprocessor = preprocessor.with_layout_override(layout.clone());
    }
    log::info!("🔧 PDF backend: {}", preprocessor.backend_name());
    ExamProcessor::new_with_dependencies(Box::new(preprocessor), storage, config)
}

#[cfg(not(feature = "pdfium-backend"))]
fn create_processor(_args: &ConvertArgs, _storage: Arc<dyn AssetStorage>, _config: PipelineConfig) -> Result<ExamProcessor> {
    anyhow::bail!("this build has no PDF backend; rebuild with --features pdfium-backend")
}
