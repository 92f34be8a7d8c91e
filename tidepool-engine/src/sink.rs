#![forbid(unsafe_code)]

//! Downstream consumer of flushed batches. The engine invokes the sink from
//! one background task at a time; a failed export is logged and the batch is
//! dropped, never retried or spilled.

use async_trait::async_trait;
use parking_lot::Mutex;
use tidepool_core::{Result, SpanRecord};

/// Receives each flushed batch of sampled spans. In trace-aware mode the
/// batch holds whole traces flattened into their constituent spans.
#[async_trait]
pub trait SpanSink: Send + Sync {
    async fn export(&self, batch: Vec<SpanRecord>) -> Result<()>;
}

/// Sink that accumulates batches in memory. Used by tests and as a stand-in
/// while wiring the engine into a pipeline.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<SpanRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch received so far, in arrival order.
    pub fn batches(&self) -> Vec<Vec<SpanRecord>> {
        self.batches.lock().clone()
    }

    /// All received spans, flattened.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl SpanSink for MemorySink {
    async fn export(&self, batch: Vec<SpanRecord>) -> Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }
}
