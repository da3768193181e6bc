//! Inpainting network
//!
//! The generator runs as an ONNX export through ONNX Runtime. Everything
//! above this module talks to the [`Inpainter`] trait, so tests and
//! alternative backends can stand in for the real session.
//!
//! The session reads its weights from the ONNX graph alone. [`load`] still
//! requires the safetensors checkpoint, downloading and repairing it when
//! needed, and reports it in `/health`; its tensors are not loaded into the
//! session.

use ndarray::{Array4, Ix4};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use rand::Rng;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointReport};
use crate::config::{Device, Manifest, ModelConfig};
use crate::error::{InpaintError, Result};

/// Side length of the dummy batch used for warm-up
pub const WARMUP_SIZE: usize = 64;

/// A pretrained "fill the hole" network.
///
/// `image` is `[1, 3, H, W]` in `[0, 1]`, `mask` is `[1, 1, H, W]` with
/// 1.0 marking the hole. Returns the inpainted `[1, 3, H, W]` image.
pub trait Inpainter: Send + Sync {
    fn inpaint(&self, image: Array4<f32>, mask: Array4<f32>) -> Result<Array4<f32>>;

    fn name(&self) -> &str;

    fn device(&self) -> Device;
}

/// ONNX Runtime backed inpainter
pub struct OnnxInpainter {
    session: Mutex<Session>,
    manifest: Manifest,
    device: Device,
}

fn model_err<E: std::fmt::Display>(err: E) -> InpaintError {
    InpaintError::Model(err.to_string())
}

fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
        #[cfg(feature = "cuda")]
        Device::Cuda => vec![
            ort::execution_providers::CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        #[cfg(not(feature = "cuda"))]
        Device::Cuda => {
            warn!("DEVICE=cuda but built without the `cuda` feature, falling back to CPU");
            vec![CPUExecutionProvider::default().build()]
        }
    }
}

impl OnnxInpainter {
    /// Build a session for the generator graph at `graph_path`.
    pub fn load(graph_path: &Path, config: &ModelConfig, manifest: Manifest) -> Result<Self> {
        if !graph_path.exists() {
            return Err(InpaintError::Model(format!(
                "model graph not found at {}",
                graph_path.display()
            )));
        }

        let start = Instant::now();
        let session = Session::builder()
            .map_err(model_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_err)?
            .with_intra_threads(config.intra_threads)
            .map_err(model_err)?
            .with_execution_providers(execution_providers(config.device))
            .map_err(model_err)?
            .commit_from_file(graph_path)
            .map_err(model_err)?;

        let elapsed = start.elapsed();
        crate::metrics::MODEL_LOAD_SECONDS.set(elapsed.as_secs_f64());
        info!(
            graph = %graph_path.display(),
            model = %manifest.name,
            device = %config.device,
            load_ms = elapsed.as_millis() as u64,
            "Model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            manifest,
            device: config.device,
        })
    }
}

impl Inpainter for OnnxInpainter {
    fn inpaint(&self, image: Array4<f32>, mask: Array4<f32>) -> Result<Array4<f32>> {
        let image = Tensor::from_array(image).map_err(model_err)?;
        let mask = Tensor::from_array(mask).map_err(model_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| InpaintError::Model("session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![
                self.manifest.image_input.as_str() => &image,
                self.manifest.mask_input.as_str() => &mask,
            ])
            .map_err(model_err)?;

        let output_name = self.manifest.output.as_str();
        let output = outputs.get(output_name).ok_or_else(|| {
            InpaintError::Model(format!("model has no output named '{}'", output_name))
        })?;

        let view = output.try_extract_array::<f32>().map_err(model_err)?;
        let inpainted = view
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| InpaintError::Model(format!("unexpected output rank: {}", e)))?;
        Ok(inpainted)
    }

    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn device(&self) -> Device {
        self.device
    }
}

/// Run one dummy forward pass so the first real request does not pay for
/// lazy kernel initialisation.
pub fn warm_up(inpainter: &dyn Inpainter) -> Result<()> {
    let mut rng = rand::rng();
    let image = Array4::from_shape_fn((1, 3, WARMUP_SIZE, WARMUP_SIZE), |_| rng.random::<f32>());
    let mask = Array4::<f32>::ones((1, 1, WARMUP_SIZE, WARMUP_SIZE));

    let start = Instant::now();
    let output = inpainter.inpaint(image, mask)?;
    debug!(shape = ?output.shape(), "Warm-up output");
    info!(
        warmup_ms = start.elapsed().as_millis() as u64,
        "Model warmed up and ready"
    );
    Ok(())
}

/// Warm up, logging instead of failing.
pub fn warm_up_lenient(inpainter: &dyn Inpainter) {
    if let Err(e) = warm_up(inpainter) {
        warn!(error = %e, "Could not warm up model; continuing without warm-up");
    }
}

/// A ready-to-serve model and the checkpoint it was prepared from
pub struct LoadedModel {
    pub inpainter: Arc<dyn Inpainter>,
    pub checkpoint: CheckpointReport,
}

/// Prepare the checkpoint, build the session and (optionally) warm it up.
pub async fn load(config: &ModelConfig) -> Result<LoadedModel> {
    let manifest = Manifest::load_or_default(&config.manifest_path())
        .map_err(|e| InpaintError::Config(e.to_string()))?;

    let checkpoint = checkpoint::prepare(
        &config.checkpoint_path(),
        config.model_url.as_deref(),
        Duration::from_secs(config.checkpoint_timeout_secs),
    )
    .await?;

    let config = config.clone();
    tokio::task::spawn_blocking(move || -> Result<LoadedModel> {
        let inpainter = OnnxInpainter::load(&config.graph_path(), &config, manifest)?;
        if config.warmup {
            warm_up_lenient(&inpainter);
        }
        Ok(LoadedModel {
            inpainter: Arc::new(inpainter),
            checkpoint,
        })
    })
    .await
    .map_err(|e| InpaintError::Internal(format!("model load task failed: {}", e)))?
}
