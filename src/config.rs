use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::preprocess::SIZE_MULTIPLE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub checkpoint: String,
    pub graph: String,
    pub model_url: Option<String>, // checkpoint download source when missing locally
    pub device: Device,
    pub max_size: u32,
    pub intra_threads: usize,
    pub warmup: bool,
    pub checkpoint_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_concurrent_jobs: usize,
    pub max_body_bytes: usize,
    pub fetch_timeout_secs: u64,
}

/// Execution device for the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            other => Err(anyhow!("Unknown DEVICE '{}': expected 'cpu' or 'cuda'", other)),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ModelConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.model_dir.join("models").join(&self.checkpoint)
    }

    pub fn graph_path(&self) -> PathBuf {
        self.model_dir.join("models").join(&self.graph)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.model_dir.join("config.yaml")
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = parse_or("PORT", 8080u16);

        let model_dir = env::var("MODEL_DIR").unwrap_or_else(|_| "/app/local-model".to_string());
        let checkpoint =
            env::var("MODEL_CKPT").unwrap_or_else(|_| "best_genpref.safetensors".to_string());
        let graph = env::var("MODEL_GRAPH").unwrap_or_else(|_| "lama.onnx".to_string());

        // Empty MODEL_URL means "never download"
        let model_url = env::var("MODEL_URL").ok().filter(|u| !u.trim().is_empty());

        let device = env::var("DEVICE")
            .unwrap_or_else(|_| "cpu".to_string())
            .parse::<Device>()?;

        let max_size = parse_or("MAX_SIZE", 768u32);
        if max_size < SIZE_MULTIPLE {
            return Err(anyhow!(
                "MAX_SIZE must be at least {}, got {}",
                SIZE_MULTIPLE,
                max_size
            ));
        }

        let default_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let model = ModelConfig {
            model_dir: PathBuf::from(model_dir),
            checkpoint,
            graph,
            model_url,
            device,
            max_size,
            intra_threads: parse_or("INTRA_THREADS", default_threads).max(1),
            warmup: parse_or("WARMUP", true),
            checkpoint_timeout_secs: parse_or("CHECKPOINT_TIMEOUT_SECS", 300u64),
        };

        let limits = LimitsConfig {
            max_concurrent_jobs: parse_or("MAX_CONCURRENT_JOBS", 1usize).max(1),
            max_body_bytes: parse_or("MAX_BODY_BYTES", 50 * 1024 * 1024usize),
            fetch_timeout_secs: parse_or("FETCH_TIMEOUT_SECS", 60u64),
        };

        Ok(Self {
            api_host,
            api_port,
            model,
            limits,
        })
    }
}

/// Model manifest read from `MODEL_DIR/config.yaml`.
///
/// Only the inference-relevant keys are read; anything else in the file
/// (training sections, visualizer settings) is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Manifest {
    pub name: String,
    pub image_input: String,
    pub mask_input: String,
    pub output: String,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            name: "lama_large_512px_anime_manga".to_string(),
            image_input: "image".to_string(),
            mask_input: "mask".to_string(),
            output: "inpainted".to_string(),
        }
    }
}

impl Manifest {
    /// Load the manifest, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No model manifest, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read manifest {}: {}", path.display(), e))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Root {
            #[serde(default)]
            model: Option<Manifest>,
        }

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        // Either a top-level `model:` section or a flat document
        let root: Root = serde_yaml::from_str(raw)
            .map_err(|e| anyhow!("Invalid model manifest: {}", e))?;
        match root.model {
            Some(m) => Ok(m),
            None => serde_yaml::from_str::<Option<Manifest>>(raw)
                .map(Option::unwrap_or_default)
                .map_err(|e| anyhow!("Invalid model manifest: {}", e)),
        }
    }
}
