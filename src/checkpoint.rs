//! Checkpoint preparation
//!
//! Checkpoints are safetensors archives. The loader expects every tensor
//! under a `state_dict.` envelope, with generator weights at
//! `state_dict.generator.*`; exports taken straight from a training run
//! store them as `gen_state_dict.*` instead (a "raw" generator state dict).
//! Such archives are rewritten once, on first load, and persisted.
//!
//! Inference itself runs from the ONNX graph (see [`crate::model`]); the
//! checkpoint is prepared, verified and reported, but its tensors are not
//! fed to the session.

use safetensors::SafeTensors;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{InpaintError, Result};
use crate::retry::{RetryExecutor, RetryStrategy};

pub const GENERATOR_PREFIX: &str = "generator.";
pub const RAW_GENERATOR_PREFIX: &str = "gen_state_dict.";
pub const STATE_DICT_PREFIX: &str = "state_dict.";

/// Tensor-name layout of a checkpoint archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLayout {
    /// Raw generator state dict (`gen_state_dict.*`)
    GeneratorStateDict,
    /// Already in the loader's layout (`state_dict.*`)
    Wrapped,
    /// Plain tensor names with no wrapper
    Raw,
    /// Not a safetensors archive
    Foreign,
}

impl CheckpointLayout {
    pub fn detect(bytes: &[u8]) -> Self {
        match SafeTensors::deserialize(bytes) {
            Ok(tensors) => Self::from_names(tensors.names().into_iter().map(|n| n.as_str())),
            Err(_) => CheckpointLayout::Foreign,
        }
    }

    fn from_names<'a>(names: impl Iterator<Item = &'a str>) -> Self {
        let mut wrapped = false;
        for name in names {
            if name.starts_with(RAW_GENERATOR_PREFIX) {
                return CheckpointLayout::GeneratorStateDict;
            }
            if name.starts_with(STATE_DICT_PREFIX) {
                wrapped = true;
            }
        }
        if wrapped {
            CheckpointLayout::Wrapped
        } else {
            CheckpointLayout::Raw
        }
    }
}

/// Summary of a checkpoint on disk
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    pub path: PathBuf,
    pub layout: CheckpointLayout,
    pub tensors: usize,
    pub size_bytes: u64,
    pub sha256: String,
    pub repaired: bool,
}

impl CheckpointReport {
    fn from_bytes(path: &Path, bytes: &[u8], repaired: bool) -> Self {
        let tensors = SafeTensors::deserialize(bytes)
            .map(|t| t.len())
            .unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            layout: CheckpointLayout::detect(bytes),
            tensors,
            size_bytes: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
            repaired,
        }
    }
}

/// Rename every tensor through `rename`, dropping those it rejects.
fn rewrite(bytes: &[u8], rename: impl Fn(&str) -> Option<String>) -> Result<Vec<u8>> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let info: Option<HashMap<String, String>> = metadata.metadata().clone();

    let renamed: Vec<(String, safetensors::tensor::TensorView<'_>)> = tensors
        .tensors()
        .into_iter()
        .filter_map(|(name, view)| rename(&name).map(|new_name| (new_name, view)))
        .collect();

    if renamed.is_empty() {
        return Err(InpaintError::Checkpoint(
            "checkpoint has no tensors left after rewriting".to_string(),
        ));
    }

    Ok(safetensors::serialize(renamed, &info)?)
}

/// Rewrap a raw generator state dict into the `state_dict.generator.*` layout.
///
/// Returns `None` when the archive needs no change. Tensors outside the
/// generator state dict (discriminator, optimizer state) are dropped.
pub fn repair(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    if CheckpointLayout::detect(bytes) != CheckpointLayout::GeneratorStateDict {
        return Ok(None);
    }
    let repaired = rewrite(bytes, |name| {
        name.strip_prefix(RAW_GENERATOR_PREFIX)
            .map(|rest| format!("{}{}{}", STATE_DICT_PREFIX, GENERATOR_PREFIX, rest))
    })?;
    Ok(Some(repaired))
}

/// Offline wrapping: put every tensor of an unwrapped archive under `state_dict.*`.
pub fn wrap(bytes: &[u8]) -> Result<Vec<u8>> {
    match CheckpointLayout::detect(bytes) {
        CheckpointLayout::Wrapped => Ok(bytes.to_vec()),
        CheckpointLayout::Foreign => Err(InpaintError::Checkpoint(
            "not a safetensors archive".to_string(),
        )),
        CheckpointLayout::GeneratorStateDict | CheckpointLayout::Raw => {
            rewrite(bytes, |name| Some(format!("{}{}", STATE_DICT_PREFIX, name)))
        }
    }
}

/// Wrap the archive at `src` and write it to `dst`.
pub fn wrap_file(src: &Path, dst: &Path) -> Result<CheckpointReport> {
    let bytes = std::fs::read(src)?;
    let wrapped = wrap(&bytes)?;
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(dst);
    std::fs::write(&tmp, &wrapped)?;
    std::fs::rename(&tmp, dst)?;
    Ok(CheckpointReport::from_bytes(dst, &wrapped, false))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Make sure a checkpoint exists at `path`, downloading it from `url` if needed.
///
/// The download lands in `<path>.tmp`, is repaired when it is a raw
/// generator state dict, and is then renamed into place. If the repair fails
/// the original download is kept as is.
pub async fn ensure_checkpoint(path: &Path, url: Option<&str>, timeout: Duration) -> Result<()> {
    if path.exists() {
        debug!(path = %path.display(), "Checkpoint already present");
        return Ok(());
    }

    let url = url.ok_or_else(|| {
        InpaintError::Checkpoint(format!(
            "Checkpoint not found at {} and MODEL_URL is not set",
            path.display()
        ))
    })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!(url = %url, path = %path.display(), "Downloading checkpoint");
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| InpaintError::Internal(format!("Failed to build HTTP client: {}", e)))?;

    let executor = RetryExecutor::new(RetryStrategy {
        max_attempts: 3,
        base_delay_ms: 1000,
        max_delay_ms: 8000,
    });
    let bytes = executor.execute(|| download(&client, url)).await?;
    info!(size = bytes.len(), "Checkpoint downloaded");

    persist_download(path, &bytes, repair).await
}

/// Write a fresh download to `path` through `<path>.tmp`, repaired by `fix`
/// when it applies. A failed repair keeps the download as fetched.
async fn persist_download(
    path: &Path,
    bytes: &[u8],
    fix: fn(&[u8]) -> Result<Option<Vec<u8>>>,
) -> Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes).await?;

    match fix(bytes) {
        Ok(Some(repaired)) => {
            tokio::fs::write(&tmp, &repaired).await?;
            crate::metrics::CHECKPOINT_REPAIRS.inc();
            info!("Wrapped raw generator state dict into state_dict.generator.* layout");
        }
        Ok(None) => debug!("Downloaded checkpoint already in expected layout"),
        Err(e) => warn!(error = %e, "Checkpoint repair failed, keeping original download"),
    }

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if status.is_client_error() {
        // 4xx will not fix itself on retry
        return Err(InpaintError::Checkpoint(format!("GET {} returned {}", url, status)));
    }
    if !status.is_success() {
        return Err(InpaintError::Fetch(format!("GET {} returned {}", url, status)));
    }
    Ok(response.bytes().await?.to_vec())
}

/// Rewrite a checkpoint still in the raw generator layout, in place.
///
/// Write goes through a temp file and a rename so the final path never holds
/// a partial archive.
pub fn repair_in_place(path: &Path) -> Result<CheckpointReport> {
    let bytes = std::fs::read(path)?;
    match repair(&bytes)? {
        Some(repaired) => {
            let tmp = tmp_path(path);
            std::fs::write(&tmp, &repaired)?;
            std::fs::rename(&tmp, path)?;
            crate::metrics::CHECKPOINT_REPAIRS.inc();
            info!(path = %path.display(), "Repaired checkpoint layout in place");
            Ok(CheckpointReport::from_bytes(path, &repaired, true))
        }
        None => Ok(CheckpointReport::from_bytes(path, &bytes, false)),
    }
}

/// Summarize a checkpoint without modifying it.
pub fn inspect(path: &Path) -> Result<CheckpointReport> {
    let bytes = std::fs::read(path)?;
    Ok(CheckpointReport::from_bytes(path, &bytes, false))
}

/// Download (if needed) and repair the checkpoint, as done on every model load.
///
/// In-place repair errors are logged and ignored; the checkpoint is then
/// reported as found.
pub async fn prepare(path: &Path, url: Option<&str>, timeout: Duration) -> Result<CheckpointReport> {
    ensure_checkpoint(path, url, timeout).await?;

    let owned = path.to_path_buf();
    let report = tokio::task::spawn_blocking(move || match repair_in_place(&owned) {
        Ok(report) => Ok(report),
        Err(e) => {
            warn!(error = %e, "In-place checkpoint repair failed, leaving file untouched");
            inspect(&owned)
        }
    })
    .await
    .map_err(|e| InpaintError::Internal(format!("checkpoint task failed: {}", e)))??;

    info!(
        layout = ?report.layout,
        tensors = report.tensors,
        sha256 = %report.sha256,
        "Checkpoint ready"
    );
    Ok(report)
}
