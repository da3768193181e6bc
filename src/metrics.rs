use lazy_static::lazy_static;
use prometheus::{Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("inpaint_requests_total", "Total number of inpaint requests by route and status"),
        &["route", "status"]
    ).unwrap();

    pub static ref JOBS_IN_FLIGHT: IntGauge = IntGauge::new(
        "inpaint_jobs_in_flight",
        "Forward passes currently running"
    ).unwrap();

    // Latency metrics (in seconds)
    pub static ref STAGE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "inpaint_stage_duration_seconds",
            "Pipeline stage latency in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["stage"]
    ).unwrap();

    // Model metrics
    pub static ref MODEL_LOAD_SECONDS: Gauge = Gauge::new(
        "model_load_seconds",
        "Time taken to build the inference session"
    ).unwrap();

    pub static ref CHECKPOINT_REPAIRS: IntCounter = IntCounter::new(
        "checkpoint_repairs_total",
        "Checkpoints rewritten from the raw generator layout"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry; safe to call more than once
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(REQUESTS.clone())).unwrap();
        REGISTRY.register(Box::new(JOBS_IN_FLIGHT.clone())).unwrap();
        REGISTRY.register(Box::new(STAGE_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(MODEL_LOAD_SECONDS.clone())).unwrap();
        REGISTRY.register(Box::new(CHECKPOINT_REPAIRS.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing pipeline stages
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record elapsed time under `stage` and return it in milliseconds
    pub fn observe_stage(&self, stage: &str) -> u64 {
        let elapsed = self.start.elapsed();
        STAGE_LATENCY
            .with_label_values(&[stage])
            .observe(elapsed.as_secs_f64());
        elapsed.as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
