//! Request handler: decode -> resize -> normalize -> model -> denormalize -> encode.
//!
//! `handle` never fails; every error is folded into the `{"status": "error"}`
//! envelope so the HTTP layer can always answer 200 with a JSON body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, Instrument};

use crate::config::Device;
use crate::error::{InpaintError, Result};
use crate::metrics::Timer;
use crate::model::Inpainter;
use crate::postprocess::{self, Feather};
use crate::preprocess;
use crate::resource_manager::ResourceManager;
use crate::source::{self, ImageSource, SourceLoader};
use crate::tensor;

fn default_blur_radius() -> f32 {
    5.0
}

fn default_feather_amount() -> f32 {
    0.1
}

/// The `input` object of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InpaintRequest {
    /// Base64, data URL, http(s) URL or local path
    pub image: String,
    /// Same encodings as `image`; any non-zero pixel marks the hole
    pub mask: String,
    /// Lowers the worker's MAX_SIZE for this request
    #[serde(default)]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub blur_edges: bool,
    #[serde(default = "default_blur_radius")]
    pub blur_radius: f32,
    #[serde(default = "default_feather_amount")]
    pub feather_amount: f32,
}

impl InpaintRequest {
    fn feather(&self) -> Option<Feather> {
        self.blur_edges.then_some(Feather {
            radius: self.blur_radius.max(0.0),
            amount: self.feather_amount.clamp(0.0, 1.0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub input_size: (u32, u32),
    pub output_size: (u32, u32),
    pub device: Device,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_processing: Option<Feather>,
}

/// Response envelope, tagged by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InpaintResponse {
    Ok {
        image_base64: String,
        metadata: ResponseMetadata,
    },
    Error {
        message: String,
    },
}

impl InpaintResponse {
    pub fn error(message: impl Into<String>) -> Self {
        InpaintResponse::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, InpaintResponse::Ok { .. })
    }
}

/// Everything one job needs after decoding
struct DecodedJob {
    image: image::RgbImage,
    mask: image::GrayImage,
}

pub struct InpaintPipeline {
    inpainter: Arc<dyn Inpainter>,
    loader: SourceLoader,
    resources: Arc<ResourceManager>,
    max_size: u32,
}

impl InpaintPipeline {
    pub fn new(
        inpainter: Arc<dyn Inpainter>,
        resources: Arc<ResourceManager>,
        max_size: u32,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            inpainter,
            loader: SourceLoader::new(fetch_timeout)?,
            resources,
            max_size,
        })
    }

    pub fn model_name(&self) -> &str {
        self.inpainter.name()
    }

    pub fn device(&self) -> Device {
        self.inpainter.device()
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Handle a job event of the form `{"id": ..., "input": {...}}`.
    pub async fn handle(&self, event: Value) -> InpaintResponse {
        let job_id = event
            .get("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!("job", job_id = %job_id);

        async {
            let total = Timer::new();
            match self.run(event).await {
                Ok(response) => {
                    info!(total_ms = total.observe_stage("total"), "Job completed");
                    response
                }
                Err(e) => {
                    error!(error = %e, "Job failed");
                    InpaintResponse::error(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, event: Value) -> Result<InpaintResponse> {
        let input = match event {
            Value::Object(mut map) => map.remove("input").unwrap_or(Value::Object(Default::default())),
            _ => return Err(InpaintError::InvalidInput("event must be a JSON object".to_string())),
        };
        let request: InpaintRequest = serde_json::from_value(input)
            .map_err(|e| InpaintError::InvalidInput(e.to_string()))?;

        let timer = Timer::new();
        let decoded = self.decode(&request).await?;
        info!(
            decode_ms = timer.observe_stage("decode"),
            input_size = ?decoded.image.dimensions(),
            "Decoded input"
        );

        // A request may narrow the worker cap, never widen it
        let max_size = request.max_size.map_or(self.max_size, |m| m.min(self.max_size));
        let feather = request.feather();
        let inpainter = self.inpainter.clone();
        let span = tracing::Span::current();

        let _slot = self.resources.acquire_job_slot().await?;
        let (image_base64, input_size, output_size) = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            process(inpainter.as_ref(), decoded, max_size, feather)
        })
        .await
        .map_err(|e| InpaintError::Internal(format!("inference task failed: {}", e)))??;

        Ok(InpaintResponse::Ok {
            image_base64,
            metadata: ResponseMetadata {
                input_size,
                output_size,
                device: self.inpainter.device(),
                model: self.inpainter.name().to_string(),
                mask_processing: feather,
            },
        })
    }

    async fn decode(&self, request: &InpaintRequest) -> Result<DecodedJob> {
        let image_source = ImageSource::parse(&request.image);
        let mask_source = ImageSource::parse(&request.mask);
        debug!(image = image_source.kind(), mask = mask_source.kind(), "Loading job inputs");

        let (image_bytes, mask_bytes) = tokio::try_join!(
            self.loader.load_bytes(&image_source),
            self.loader.load_bytes(&mask_source),
        )?;

        tokio::task::spawn_blocking(move || -> Result<DecodedJob> {
            let image = source::decode_image(&image_bytes)?;
            let mask = source::decode_mask(&mask_bytes, image.dimensions())?;
            Ok(DecodedJob { image, mask })
        })
        .await
        .map_err(|e| InpaintError::Internal(format!("decode task failed: {}", e)))?
    }
}

/// CPU-bound part of a job; returns (base64 PNG, input size, output size).
fn process(
    inpainter: &dyn Inpainter,
    job: DecodedJob,
    max_size: u32,
    feather: Option<Feather>,
) -> Result<(String, (u32, u32), (u32, u32))> {
    let timer = Timer::new();
    let prepared = preprocess::resize_pair(job.image, job.mask, max_size)?;
    timer.observe_stage("resize");

    let image_t = tensor::image_to_tensor(&prepared.image);
    let mask_t = tensor::mask_to_tensor(&prepared.mask);

    let timer = Timer::new();
    let output = inpainter.inpaint(image_t, mask_t)?;
    info!(inference_ms = timer.observe_stage("inference"), "Forward pass done");

    let timer = Timer::new();
    let mut result = tensor::tensor_to_image(&output)?;
    if result.dimensions() != prepared.image.dimensions() {
        return Err(InpaintError::Model(format!(
            "model returned {:?} for input {:?}",
            result.dimensions(),
            prepared.image.dimensions()
        )));
    }
    if let Some(feather) = feather {
        result = postprocess::feather_blend(&prepared.image, &result, &prepared.mask, feather)?;
    }

    let encoded = postprocess::encode_png_base64(&result)?;
    timer.observe_stage("encode");

    Ok((encoded, prepared.original_size, result.dimensions()))
}
