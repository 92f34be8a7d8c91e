#![forbid(unsafe_code)]

//! Observability counters and gauges for the sampling engine, exported in
//! Prometheus text format. A process-wide default registry is initialized on
//! first use; engines may also carry their own registry so several instances
//! can coexist in one process (e.g. in tests).

use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("telemetry init failed: {0}")]
    Init(String),
}
pub type Result<T> = std::result::Result<T, Error>;

static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Typed collectors for every metric the engine exports.
#[derive(Clone)]
pub struct SamplerMetrics {
    registry: Registry,
    /// Units currently admitted to the reservoir.
    pub reservoir_size: IntGauge,
    /// Rollovers since engine start (or restore).
    pub window_count: IntGauge,
    /// Spans pushed downstream.
    pub sampled_spans_total: IntCounter,
    /// Traces currently buffered by the aggregator.
    pub trace_buffer_size: IntGauge,
    /// Spans across all buffered traces.
    pub trace_buffer_span_count: IntGauge,
    /// Traces dropped by the aggregator LRU.
    pub lru_evictions_total: IntCounter,
    /// Seconds since the last successful checkpoint save.
    pub checkpoint_age_seconds: Gauge,
    /// Checkpoint saves that failed.
    pub checkpoint_errors_total: IntCounter,
    /// Size of the checkpoint database file.
    pub db_size_bytes: IntGauge,
    /// Completed compaction runs.
    pub compactions_total: IntCounter,
    /// Successful restores from a checkpoint at startup.
    pub restore_success_total: IntCounter,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help).map_err(|e| Error::Init(e.to_string()))?;
    registry
        .register(Box::new(g.clone()))
        .map_err(|e| Error::Init(e.to_string()))?;
    Ok(g)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let g = Gauge::new(name, help).map_err(|e| Error::Init(e.to_string()))?;
    registry
        .register(Box::new(g.clone()))
        .map_err(|e| Error::Init(e.to_string()))?;
    Ok(g)
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help).map_err(|e| Error::Init(e.to_string()))?;
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| Error::Init(e.to_string()))?;
    Ok(c)
}

impl SamplerMetrics {
    /// Register all collectors in a fresh registry owned by this instance.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register all collectors in the process-wide default registry.
    /// Fails if another instance already registered there.
    pub fn global() -> Result<Self> {
        Self::with_registry(DEFAULT_REGISTRY.clone())
    }

    /// Register all collectors in the given registry.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        Ok(Self {
            reservoir_size: int_gauge(
                &registry,
                "reservoir_size",
                "Units currently admitted to the reservoir",
            )?,
            window_count: int_gauge(&registry, "window_count", "Window rollovers observed")?,
            sampled_spans_total: int_counter(
                &registry,
                "sampled_spans_total",
                "Spans pushed downstream",
            )?,
            trace_buffer_size: int_gauge(
                &registry,
                "trace_buffer_size",
                "Traces buffered by the aggregator",
            )?,
            trace_buffer_span_count: int_gauge(
                &registry,
                "trace_buffer_span_count",
                "Spans across all buffered traces",
            )?,
            lru_evictions_total: int_counter(
                &registry,
                "lru_evictions_total",
                "Traces dropped by the aggregator LRU",
            )?,
            checkpoint_age_seconds: gauge(
                &registry,
                "checkpoint_age_seconds",
                "Seconds since the last successful checkpoint",
            )?,
            checkpoint_errors_total: int_counter(
                &registry,
                "checkpoint_errors_total",
                "Checkpoint saves that failed",
            )?,
            db_size_bytes: int_gauge(
                &registry,
                "db_size_bytes",
                "Checkpoint database file size",
            )?,
            compactions_total: int_counter(
                &registry,
                "compactions_total",
                "Completed compaction runs",
            )?,
            restore_success_total: int_counter(
                &registry,
                "restore_success_total",
                "Successful checkpoint restores at startup",
            )?,
            registry,
        })
    }

    /// Dump every collector in Prometheus text format.
    pub fn render(&self) -> String {
        let mf = self.registry.gather();
        let enc = TextEncoder::new();
        let mut buf = Vec::new();
        enc.encode(&mf, &mut buf).ok();
        String::from_utf8(buf).unwrap_or_default()
    }
}
