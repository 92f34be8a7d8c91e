use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tidepool_core::{ManualClock, SamplerConfig, SpanId, SpanRecord, TraceId};
use tidepool_engine::{Engine, MemorySink};

fn span(trace: u8, span_n: u8) -> SpanRecord {
    SpanRecord::new(
        TraceId([trace; 16]),
        SpanId([span_n; 8]),
        format!("op-{span_n}"),
    )
}

/// Short real-time window: the scheduler rolls it over and hands the sink
/// exactly one batch holding a K-subset of everything offered.
#[tokio::test]
async fn window_rollover_flushes_one_batch() {
    let sink = Arc::new(MemorySink::new());
    let cfg = SamplerConfig {
        reservoir_capacity_k: 5,
        window_duration_ms: 300,
        trace_aware: false,
        ..SamplerConfig::default()
    };
    let engine = Engine::new(cfg, Arc::clone(&sink) as _).unwrap();
    engine.start().await.unwrap();

    let offered: Vec<SpanRecord> = (1..=6).map(|i| span(1, i)).collect();
    engine.ingest(offered.clone()).unwrap();

    // Window check period is 100ms; the 300ms window rolls within ~700ms.
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(sink.batch_count(), 1, "exactly one batch downstream");
    let batch = &sink.batches()[0];
    assert_eq!(batch.len(), 5, "a K-subset of the 6 offered spans");
    let offered_ids: HashSet<SpanId> = offered.iter().map(|s| s.span_id).collect();
    for s in batch {
        assert!(offered_ids.contains(&s.span_id));
    }
    assert_eq!(engine.metrics().reservoir_size.get(), 0);
    assert!(engine.metrics().window_count.get() >= 1);

    // The next span lands in a fresh window.
    engine.ingest(vec![span(1, 7)]).unwrap();
    assert_eq!(engine.metrics().reservoir_size.get(), 1);

    engine.stop(Duration::from_secs(5)).await.unwrap();
}

/// Trace-aware mode admits or rejects whole traces: a flushed batch never
/// holds a fragment of a trace.
#[tokio::test]
async fn trace_aware_flush_is_atomic_per_trace() {
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(ManualClock::new());
    let cfg = SamplerConfig {
        reservoir_capacity_k: 2,
        window_duration_ms: 10_000,
        trace_aware: true,
        trace_buffer_max_size: 100,
        trace_buffer_timeout_ms: 100,
        ..SamplerConfig::default()
    };
    let engine = Engine::with_clock(cfg, Arc::clone(&sink) as _, clock.clone()).unwrap();
    engine.start().await.unwrap();

    // T1 = {s1, s2}, T2 = {s3}, T3 = {s4, s5}, spread over 80ms.
    engine.ingest(vec![span(1, 1), span(1, 2)]).unwrap();
    clock.advance(Duration::from_millis(50));
    engine.ingest(vec![span(2, 3)]).unwrap();
    clock.advance(Duration::from_millis(30));
    engine.ingest(vec![span(3, 4), span(3, 5)]).unwrap();

    // Everything goes quiet; every trace passes the 100ms threshold.
    clock.advance(Duration::from_millis(300));
    // Real time for the sweep loop (50ms cadence) to harvest.
    tokio::time::sleep(Duration::from_millis(300)).await;

    engine.force_flush().await.unwrap();
    assert_eq!(sink.batch_count(), 1);
    let batch = &sink.batches()[0];

    let mut by_trace: HashMap<TraceId, HashSet<SpanId>> = HashMap::new();
    for s in batch {
        by_trace.entry(s.trace_id).or_default().insert(s.span_id);
    }
    assert_eq!(by_trace.len(), 2, "K=2 of the 3 closed traces");

    let full: HashMap<TraceId, HashSet<SpanId>> = HashMap::from([
        (
            TraceId([1; 16]),
            HashSet::from([SpanId([1; 8]), SpanId([2; 8])]),
        ),
        (TraceId([2; 16]), HashSet::from([SpanId([3; 8])])),
        (
            TraceId([3; 16]),
            HashSet::from([SpanId([4; 8]), SpanId([5; 8])]),
        ),
    ]);
    for (trace, spans) in &by_trace {
        assert_eq!(
            spans,
            full.get(trace).unwrap(),
            "trace {trace} flushed partially"
        );
    }

    engine.stop(Duration::from_secs(5)).await.unwrap();
}

/// Aggregator overflow: the least-recently-updated trace is dropped whole
/// and never reaches the reservoir.
#[tokio::test]
async fn lru_eviction_drops_oldest_trace_entirely() {
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(ManualClock::new());
    let cfg = SamplerConfig {
        reservoir_capacity_k: 10,
        window_duration_ms: 3_600_000,
        trace_aware: true,
        trace_buffer_max_size: 2,
        trace_buffer_timeout_ms: 10_000,
        ..SamplerConfig::default()
    };
    let engine = Engine::with_clock(cfg, Arc::clone(&sink) as _, clock.clone()).unwrap();
    engine.start().await.unwrap();

    engine.ingest(vec![span(1, 1)]).unwrap();
    clock.advance(Duration::from_millis(1));
    engine.ingest(vec![span(2, 2)]).unwrap();
    clock.advance(Duration::from_millis(1));
    engine.ingest(vec![span(3, 3)]).unwrap();

    assert_eq!(engine.metrics().lru_evictions_total.get(), 1);
    assert_eq!(engine.metrics().trace_buffer_size.get(), 2);

    // Stop drains the surviving traces through the sampler; T1 is gone.
    engine.stop(Duration::from_secs(5)).await.unwrap();
    let traces: HashSet<TraceId> = sink.spans().iter().map(|s| s.trace_id).collect();
    assert_eq!(
        traces,
        HashSet::from([TraceId([2; 16]), TraceId([3; 16])]),
        "evicted trace must never be sampled"
    );
}
