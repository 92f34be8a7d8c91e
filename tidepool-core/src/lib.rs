#![forbid(unsafe_code)]

//! Core utilities for Tidepool.
//!
//! This crate intentionally stays lightweight and pure Rust.
//! Public modules export typed span ids, the in-memory span model,
//! basic error handling, the injectable clock, and configuration
//! helpers used across the workspace.
//!
//! Design goals:
//! - Small, dependency-minimized surface
//! - Clear, documented types with safe helpers
//! - Robust config loading with validation

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SamplerConfig;
pub use error::{Error, Result};
pub use types::{
    AttrValue, SampleKey, ScopeInfo, SpanEvent, SpanLink, SpanRecord, SpanStatus, SpanId,
    StatusCode, TraceEntry, TraceId,
};
