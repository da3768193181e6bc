//! Resource Management Module
//!
//! Bounds the number of concurrent forward passes and the size of request
//! payloads. A large image at MAX_SIZE holds several hundred MB of
//! activations, so inference slots are scarce.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{InpaintError, Result};

/// Worker resource limits
#[derive(Debug, Clone, Serialize)]
pub struct ResourceLimits {
    /// Forward passes allowed to run at once
    pub max_concurrent_jobs: usize,
    /// Largest accepted request body in bytes
    pub max_payload_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            max_payload_bytes: 50 * 1024 * 1024, // 50MB
        }
    }
}

#[derive(Debug, Default)]
struct ResourceMetrics {
    jobs_in_flight: AtomicUsize,
    jobs_completed: AtomicU64,
}

/// Resource manager with automatic enforcement of limits
pub struct ResourceManager {
    limits: ResourceLimits,
    metrics: Arc<ResourceMetrics>,
    job_semaphore: Arc<Semaphore>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(limits.max_concurrent_jobs.max(1)));

        Self {
            limits,
            metrics: Arc::new(ResourceMetrics::default()),
            job_semaphore,
        }
    }

    /// Wait for an inference slot
    pub async fn acquire_job_slot(&self) -> Result<JobGuard> {
        let permit = self
            .job_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| InpaintError::Internal(format!("Failed to acquire job slot: {}", e)))?;

        Ok(self.guard(permit))
    }

    fn guard(&self, permit: OwnedSemaphorePermit) -> JobGuard {
        let in_flight = self.metrics.jobs_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::JOBS_IN_FLIGHT.set(in_flight as i64);
        JobGuard {
            _permit: permit,
            metrics: self.metrics.clone(),
        }
    }

    /// Check a payload against the size limit
    pub fn check_payload_size(&self, size: usize) -> Result<()> {
        if size > self.limits.max_payload_bytes {
            return Err(InpaintError::InvalidInput(format!(
                "Payload size {} bytes exceeds limit of {} bytes",
                size, self.limits.max_payload_bytes
            )));
        }
        Ok(())
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn get_stats(&self) -> ResourceStats {
        ResourceStats {
            jobs_in_flight: self.metrics.jobs_in_flight.load(Ordering::Relaxed),
            jobs_completed: self.metrics.jobs_completed.load(Ordering::Relaxed),
            max_concurrent_jobs: self.limits.max_concurrent_jobs,
        }
    }
}

/// RAII guard that releases the inference slot on drop
pub struct JobGuard {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<ResourceMetrics>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let in_flight = self.metrics.jobs_in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
        self.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::JOBS_IN_FLIGHT.set(in_flight as i64);
    }
}

/// Resource usage statistics
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub jobs_in_flight: usize,
    pub jobs_completed: u64,
    pub max_concurrent_jobs: usize,
}

impl ResourceStats {
    pub fn utilization_percent(&self) -> f64 {
        self.jobs_in_flight as f64 / self.max_concurrent_jobs.max(1) as f64 * 100.0
    }
}
