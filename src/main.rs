use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lama_worker::config::Config;
use lama_worker::model::{self, Inpainter, LoadedModel};
use lama_worker::pipeline::InpaintPipeline;
use lama_worker::resource_manager::{ResourceLimits, ResourceManager};
use lama_worker::{checkpoint, metrics, server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "lama-worker", version, about = "LaMa inpainting worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load the model and serve HTTP jobs (default)
    Serve,

    /// Download, repair and warm up the model, then exit
    Preload,

    /// Wrap a bare state dict archive under `state_dict.*`
    WrapCkpt {
        /// Source checkpoint
        src: PathBuf,
        /// Destination checkpoint
        dst: PathBuf,
    },

    /// Run a single job event and print the response envelope
    Handle {
        /// Event JSON file (reads stdin when omitted)
        #[arg(long)]
        event: Option<PathBuf>,
    },
}

fn build_pipeline(config: &Config, loaded: &LoadedModel) -> Result<Arc<InpaintPipeline>> {
    let resources = Arc::new(ResourceManager::new(ResourceLimits {
        max_concurrent_jobs: config.limits.max_concurrent_jobs,
        max_payload_bytes: config.limits.max_body_bytes,
    }));

    let pipeline = InpaintPipeline::new(
        loaded.inpainter.clone(),
        resources,
        config.model.max_size,
        Duration::from_secs(config.limits.fetch_timeout_secs),
    )?;
    Ok(Arc::new(pipeline))
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(
        model_dir = %config.model.model_dir.display(),
        device = %config.model.device,
        max_size = config.model.max_size,
        "Starting inpainting worker..."
    );

    let loaded = model::load(&config.model)
        .await
        .context("Failed to load model")?;
    let pipeline = build_pipeline(&config, &loaded)?;

    let state = server::AppState::new(pipeline, Some(loaded.checkpoint));
    let app = server::router(state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    server::serve(listener, app).await
}

async fn preload(mut config: Config) -> Result<()> {
    // Warm up strictly below instead of the lenient pass inside load()
    let warmup = std::mem::replace(&mut config.model.warmup, false);
    let loaded = model::load(&config.model).await?;
    if warmup {
        let inpainter = loaded.inpainter.clone();
        tokio::task::spawn_blocking(move || model::warm_up(inpainter.as_ref()))
            .await
            .context("Warm-up task failed")??;
    }
    tracing::info!(
        model = loaded.inpainter.name(),
        checkpoint = %loaded.checkpoint.path.display(),
        "✅ Model preloaded"
    );
    Ok(())
}

async fn handle(config: Config, event: Option<PathBuf>) -> Result<()> {
    let raw = match event {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read event file {}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let loaded = model::load(&config.model).await?;
    let pipeline = build_pipeline(&config, &loaded)?;
    pipeline.resources().check_payload_size(raw.len())?;

    let event: serde_json::Value = if raw.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&raw).context("Event is not valid JSON")?
    };

    let response = pipeline.handle(event).await;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    // ONNX Runtime logs every graph transform at info
                    .add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    metrics::init_metrics();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(Config::load()?).await,
        Command::Preload => {
            if let Err(e) = preload(Config::load()?).await {
                tracing::error!("❌ Preload failed: {:#}", e);
                std::process::exit(1);
            }
            Ok(())
        }
        Command::WrapCkpt { src, dst } => {
            let report = checkpoint::wrap_file(&src, &dst)
                .with_context(|| format!("Failed to wrap {}", src.display()))?;
            tracing::info!(
                dst = %dst.display(),
                tensors = report.tensors,
                sha256 = %report.sha256,
                "Wrapped checkpoint"
            );
            Ok(())
        }
        Command::Handle { event } => handle(Config::load()?, event).await,
    }
}
