#![forbid(unsafe_code)]

//! Sampler configuration handling. Parses a TOML file into a strongly-typed
//! structure and validates every constraint before the engine starts. All
//! durations are expressed in milliseconds on the wire and exposed as
//! [`std::time::Duration`] through helper methods.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::error::{Error, Result};

/// Primary configuration structure for one sampling engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Reservoir size K. Required, > 0.
    pub reservoir_capacity_k: usize,

    /// Flush cadence in milliseconds. Required, > 0.
    pub window_duration_ms: u64,

    /// Checkpoint database path. Empty disables persistence entirely;
    /// checkpointing and restore are then skipped.
    pub checkpoint_path: String,

    /// Checkpoint cadence in milliseconds. Must be > 0 when persistence
    /// is enabled.
    pub checkpoint_interval_ms: u64,

    /// Sample whole traces instead of individual spans.
    pub trace_aware: bool,

    /// Aggregator LRU bound. Must be > 0 in trace-aware mode.
    pub trace_buffer_max_size: usize,

    /// Quiescence threshold in milliseconds: a trace with no new span for
    /// this long is considered closed. Must be > 0 in trace-aware mode.
    pub trace_buffer_timeout_ms: u64,

    /// Optional 5-field cron expression scheduling database compaction.
    pub compaction_cron: Option<String>,

    /// Advisory size the compactor aims for, in bytes.
    pub compaction_target_size_bytes: Option<u64>,

    /// Treat a corrupt checkpoint as a fresh start instead of failing
    /// engine startup.
    pub reset_on_corrupt: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            reservoir_capacity_k: default_capacity(),
            window_duration_ms: default_window_ms(),
            checkpoint_path: String::new(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            trace_aware: true,
            trace_buffer_max_size: default_trace_buffer_max(),
            trace_buffer_timeout_ms: default_trace_buffer_timeout_ms(),
            compaction_cron: None,
            compaction_target_size_bytes: None,
            reset_on_corrupt: false,
        }
    }
}

fn default_capacity() -> usize {
    1000
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

fn default_trace_buffer_max() -> usize {
    10_000
}

fn default_trace_buffer_timeout_ms() -> u64 {
    10_000
}

impl SamplerConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str::<SamplerConfig>(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Flush cadence as a [`Duration`].
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// Checkpoint cadence as a [`Duration`].
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Quiescence threshold as a [`Duration`].
    pub fn trace_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.trace_buffer_timeout_ms)
    }

    /// Whether a checkpoint database is configured.
    pub fn persistence_enabled(&self) -> bool {
        !self.checkpoint_path.is_empty()
    }

    /// Check every constraint; the engine refuses to start on violation.
    pub fn validate(&self) -> Result<()> {
        if self.reservoir_capacity_k == 0 {
            return Err(Error::config("reservoir_capacity_k must be > 0"));
        }
        if self.window_duration_ms == 0 {
            return Err(Error::config("window_duration_ms must be > 0"));
        }
        if self.persistence_enabled() && self.checkpoint_interval_ms == 0 {
            return Err(Error::config(
                "checkpoint_interval_ms must be > 0 when checkpoint_path is set",
            ));
        }
        if self.trace_aware {
            if self.trace_buffer_max_size == 0 {
                return Err(Error::config(
                    "trace_buffer_max_size must be > 0 in trace-aware mode",
                ));
            }
            if self.trace_buffer_timeout_ms == 0 {
                return Err(Error::config(
                    "trace_buffer_timeout_ms must be > 0 in trace-aware mode",
                ));
            }
        }
        if let Some(expr) = &self.compaction_cron {
            if expr.split_whitespace().count() != 5 {
                return Err(Error::config(format!(
                    "compaction_cron must have 5 fields, got {expr:?}"
                )));
            }
        }
        if let Some(target) = self.compaction_target_size_bytes {
            if target == 0 {
                return Err(Error::config("compaction_target_size_bytes must be > 0"));
            }
        }
        Ok(())
    }
}
