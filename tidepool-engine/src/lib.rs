#![forbid(unsafe_code)]

//! Engine assembly for the Tidepool sampling stage.
//!
//! [`Engine`] wires the reservoir, trace aggregator, window controller,
//! checkpoint store, and metrics together, runs the periodic scheduler
//! loops, and exposes the ingest/lifecycle surface. Spans go in through
//! [`Engine::ingest`]; bounded, uniformly sampled batches come out through
//! the configured [`SpanSink`] on every window rollover.

pub mod cron_schedule;
pub mod engine;
pub mod scheduler;
pub mod sink;

pub use cron_schedule::CompactionSchedule;
pub use engine::{Engine, EngineState};
pub use sink::{MemorySink, SpanSink};
