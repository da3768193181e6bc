pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod resource_manager;
pub mod retry;
pub mod server;
pub mod source;
pub mod tensor;

// Re-export commonly used types for easier testing
pub use crate::checkpoint::{CheckpointLayout, CheckpointReport};
pub use crate::config::{Config, Device, Manifest, ModelConfig};
pub use crate::error::{InpaintError, Result};
pub use crate::model::{Inpainter, LoadedModel, OnnxInpainter};
pub use crate::pipeline::{InpaintPipeline, InpaintRequest, InpaintResponse, ResponseMetadata};
pub use crate::postprocess::Feather;
pub use crate::resource_manager::{ResourceLimits, ResourceManager};
pub use crate::server::AppState;
