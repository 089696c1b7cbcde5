// atelier - CLI for interactive-style image generation sessions

use anyhow::Context;
use atelier::backend::{ModelVersion, StableDiffusionBackend};
use atelier::generation::{
    DiskImageStore, GenerationMode, GenerationSession, HistoryEntry, ModeState, TracingNotifier,
};
use atelier::AtelierConfig;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate images with Stable Diffusion (txt2img, img2img, inpaint, upscale)", long_about = None)]
struct Args {
    /// Text prompt describing the image to generate
    #[arg(short, long, required_unless_present = "list_samplers")]
    prompt: Option<String>,

    /// What to keep out of the image
    #[arg(short = 'n', long)]
    negative_prompt: Option<String>,

    /// Generation mode
    #[arg(long, value_enum, default_value = "txt2img")]
    mode: ModeArg,

    /// Second mode to run afterwards; img2img and inpaint pick up the first result
    #[arg(long, value_enum)]
    then: Option<ModeArg>,

    /// Init image for img2img, inpaint and upscale
    #[arg(short, long)]
    init_image: Option<PathBuf>,

    /// Inpaint mask (white = repaint)
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Denoising strength for conditioned modes
    #[arg(long)]
    strength: Option<f64>,

    /// Upscale factor for upscale mode
    #[arg(long)]
    upscale_factor: Option<f64>,

    /// Image width (must be multiple of 8)
    #[arg(short, long)]
    width: Option<u32>,

    /// Image height (must be multiple of 8)
    #[arg(long)]
    height: Option<u32>,

    /// Number of inference steps
    #[arg(long)]
    steps: Option<u32>,

    /// Classifier-free guidance scale
    #[arg(long)]
    cfg_scale: Option<f64>,

    /// Sampler name (euler_a, dpmpp_2m, "DPM++ 2M Karras", ...)
    #[arg(long)]
    sampler: Option<String>,

    /// Scheduler variant (normal, karras, exponential, sgm_uniform, simple, ddim_uniform)
    #[arg(long)]
    scheduler: Option<String>,

    #[arg(long)]
    clip_skip: Option<u32>,

    /// Random seed for reproducibility
    #[arg(short, long)]
    seed: Option<u64>,

    /// Images per request
    #[arg(short, long)]
    batch: Option<u32>,

    /// Model variant to use (defaults to the configured one)
    #[arg(short, long, value_enum)]
    model: Option<ModelArg>,

    /// Output directory (overrides the config file)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/atelier/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force CPU usage (default: use GPU if available)
    #[arg(long)]
    cpu: bool,

    /// Write the session history as JSON when done
    #[arg(long)]
    history: Option<PathBuf>,

    /// Print known sampler and scheduler names and exit
    #[arg(long)]
    list_samplers: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Txt2img,
    Img2img,
    Inpaint,
    Upscale,
}

impl From<ModeArg> for GenerationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Txt2img => GenerationMode::Txt2Img,
            ModeArg::Img2img => GenerationMode::Img2Img,
            ModeArg::Inpaint => GenerationMode::Inpaint,
            ModeArg::Upscale => GenerationMode::Upscale,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModelArg {
    /// Stable Diffusion v1.5
    SdV15,
    /// Stable Diffusion v2.1
    SdV21,
    /// Stable Diffusion XL
    SdXl,
    /// SDXL Turbo
    SdTurbo,
}

impl From<ModelArg> for ModelVersion {
    fn from(model: ModelArg) -> Self {
        match model {
            ModelArg::SdV15 => ModelVersion::V1_5,
            ModelArg::SdV21 => ModelVersion::V2_1,
            ModelArg::SdXl => ModelVersion::Xl,
            ModelArg::SdTurbo => ModelVersion::Turbo,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may carry HF_TOKEN for gated repos
    let _ = dotenvy::dotenv();

    // The hf-hub crate looks for HUGGING_FACE_HUB_TOKEN, not HF_TOKEN
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if std::env::var("HUGGING_FACE_HUB_TOKEN").is_err() {
            std::env::set_var("HUGGING_FACE_HUB_TOKEN", &token);
        }
    }

    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("atelier={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AtelierConfig::load(args.config.as_deref())?;

    if args.list_samplers {
        let catalog = atelier::SchedulerCatalog::new();
        println!("Samplers:");
        for name in catalog.sampler_names() {
            println!("  {}", name);
        }
        println!("Schedulers:");
        for name in catalog.variant_names() {
            println!("  {}", name);
        }
        return Ok(());
    }

    let version: ModelVersion = args.model.map(Into::into).unwrap_or(config.model.version);
    let use_cpu = args.cpu || config.model.use_cpu;
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.paths.output_dir.clone());

    tracing::info!("Starting atelier");
    tracing::info!("Model: {}", version);
    tracing::info!("Output: {}", output_dir.display());

    let backend = tokio::task::spawn_blocking(move || StableDiffusionBackend::load(version, use_cpu))
        .await
        .context("model loading task failed")??;
    let backend = Arc::new(backend);

    let state = ModeState::new(GenerationMode::Txt2Img, config.initial_params(version.architecture()))
        .with_default_strength(config.generation.default_strength);

    let session = GenerationSession::new(state, backend.clone(), backend, Arc::new(TracingNotifier))
        .with_store(Arc::new(DiskImageStore::new(output_dir)))
        .with_base_scheduler_config(version.base_scheduler_config());

    apply_overrides(&session, &args);

    let params = session.params();
    if !session.catalog().is_known_sampler(&params.sampler) {
        tracing::warn!(
            "Sampler '{}' is not recognised, the default integrator will be used (see --list-samplers)",
            params.sampler
        );
    }
    if !session.catalog().is_known_variant(&params.scheduler) {
        tracing::warn!(
            "Scheduler '{}' is not recognised, no overrides will be applied",
            params.scheduler
        );
    }

    if let Some(path) = &args.init_image {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read init image: {}", path.display()))?;
        session.upload_init_image(&bytes)?;
    }
    if let Some(path) = &args.mask {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read mask: {}", path.display()))?;
        session.upload_mask(&bytes)?;
    }

    let mode: GenerationMode = args.mode.into();
    session.transition(mode);
    report(session.generate().await?);

    if let Some(then) = args.then {
        session.transition(then.into());
        report(session.generate().await?);
    }

    if let Some(path) = &args.history {
        session.export_history(path)?;
    }

    Ok(())
}

fn apply_overrides(session: &GenerationSession, args: &Args) {
    session.update_params(|params| {
        if let Some(prompt) = &args.prompt {
            params.prompt = prompt.clone();
        }
        if let Some(negative) = &args.negative_prompt {
            params.negative_prompt = negative.clone();
        }
        if let Some(width) = args.width {
            params.width = width;
        }
        if let Some(height) = args.height {
            params.height = height;
        }
        if let Some(steps) = args.steps {
            params.steps = steps;
        }
        if let Some(cfg_scale) = args.cfg_scale {
            params.cfg_scale = cfg_scale;
        }
        if let Some(sampler) = &args.sampler {
            params.sampler = sampler.clone();
        }
        if let Some(scheduler) = &args.scheduler {
            params.scheduler = scheduler.clone();
        }
        if let Some(clip_skip) = args.clip_skip {
            params.clip_skip = clip_skip;
        }
        if let Some(batch) = args.batch {
            params.batch_size = batch;
        }
        if let Some(factor) = args.upscale_factor {
            params.upscale_factor = factor;
        }
        if args.strength.is_some() {
            params.strength = args.strength;
        }
        params.seed = args.seed;
    });
}

fn report(entry: Option<HistoryEntry>) {
    let Some(entry) = entry else {
        println!("No images were produced");
        return;
    };
    for saved in &entry.artifacts {
        println!("Image saved to: {}", saved.image_path.display());
    }
    println!("Seed: {}", entry.seed);
}
