#![forbid(unsafe_code)]

//! The assembled sampling stage. One [`Engine`] owns a reservoir, an
//! optional trace aggregator, a window controller, an optional checkpoint
//! store, and the scheduler loops tying them together.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tidepool_checkpoint::{CheckpointRecord, CheckpointStore};
use tidepool_core::{
    Clock, Error, Result, SampleKey, SamplerConfig, SpanRecord, SystemClock, TraceEntry,
};
use tidepool_sampling::{Reservoir, TraceAggregator, WindowController};
use tidepool_telemetry::SamplerMetrics;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cron_schedule::CompactionSchedule;
use crate::scheduler::Scheduler;
use crate::sink::SpanSink;

/// Engine lifecycle. Ingest and flush are valid only in `Running`; start is
/// valid only in `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Floor for the window-check cadence.
const MIN_WINDOW_CHECK_PERIOD: Duration = Duration::from_millis(100);
/// Floor for the aggregator sweep cadence.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(50);

fn wall_to_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn nanos_to_wall(n: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(n)
}

struct Shared {
    config: SamplerConfig,
    clock: Arc<dyn Clock>,
    reservoir: Reservoir,
    aggregator: Option<TraceAggregator>,
    window: WindowController,
    store: Mutex<Option<Arc<CheckpointStore>>>,
    sink: Arc<dyn SpanSink>,
    metrics: SamplerMetrics,
    last_save_wall: Mutex<Option<SystemTime>>,
}

impl Shared {
    fn observe_buffers(&self) {
        self.metrics.reservoir_size.set(self.reservoir.len() as i64);
        if let Some(agg) = &self.aggregator {
            self.metrics.trace_buffer_size.set(agg.len() as i64);
            self.metrics
                .trace_buffer_span_count
                .set(agg.span_count() as i64);
        }
    }

    fn offer_trace(&self, entry: TraceEntry) {
        let key = SampleKey::Trace(entry.trace_id);
        self.reservoir.offer(key, entry.spans);
    }

    /// Drain the reservoir and push the batch downstream. A failed export
    /// drops the batch; there is no spill queue.
    async fn flush_once(&self) {
        let units = self.reservoir.snapshot_and_reset();
        self.metrics.reservoir_size.set(0);
        if units.is_empty() {
            return;
        }
        let batch: Vec<SpanRecord> = units.into_iter().flat_map(|(_, spans)| spans).collect();
        let count = batch.len();
        match self.sink.export(batch).await {
            Ok(()) => {
                self.metrics.sampled_spans_total.inc_by(count as u64);
                debug!(spans = count, "batch flushed downstream");
            }
            Err(e) => warn!(spans = count, error = %e, "downstream export failed, batch dropped"),
        }
    }

    /// Harvest quiescent traces and offer each to the reservoir.
    fn sweep_once(&self) {
        let Some(agg) = &self.aggregator else { return };
        let now = self.clock.monotonic();
        for entry in agg.harvest_closed(now) {
            debug!(trace_id = %entry.trace_id, spans = entry.span_count(), "trace closed");
            self.offer_trace(entry);
        }
        self.observe_buffers();
    }

    fn build_checkpoint(&self) -> CheckpointRecord {
        let window = self.window.current();
        CheckpointRecord {
            reservoir: self.reservoir.snapshot(),
            window_id: window.id,
            window_start_unix_nanos: wall_to_nanos(window.start),
            window_end_unix_nanos: wall_to_nanos(window.end),
            rollover_count: window.rollover_count,
        }
    }

    /// Copy the state under the component locks, then save outside them so
    /// IO never blocks ingestion. Errors are counted, never fatal.
    async fn checkpoint_once(&self) {
        let Some(store) = self.store.lock().clone() else {
            return;
        };
        let record = self.build_checkpoint();
        let saved = tokio::task::spawn_blocking(move || {
            let result = store.save(&record);
            (store, result)
        })
        .await;
        match saved {
            Ok((store, Ok(()))) => {
                *self.last_save_wall.lock() = Some(self.clock.wall());
                self.metrics.checkpoint_age_seconds.set(0.0);
                self.metrics.db_size_bytes.set(store.size_bytes() as i64);
            }
            Ok((_, Err(e))) => {
                self.metrics.checkpoint_errors_total.inc();
                warn!(error = %e, "checkpoint save failed, retrying next period");
            }
            Err(e) => {
                self.metrics.checkpoint_errors_total.inc();
                warn!(error = %e, "checkpoint task failed");
            }
        }
    }

    fn update_checkpoint_age(&self) {
        if let Some(at) = *self.last_save_wall.lock() {
            if let Ok(age) = self.clock.wall().duration_since(at) {
                self.metrics.checkpoint_age_seconds.set(age.as_secs_f64());
            }
        }
    }

    async fn compact_once(&self) {
        let Some(store) = self.store.lock().clone() else {
            return;
        };
        let target = self.config.compaction_target_size_bytes;
        let compacted = tokio::task::spawn_blocking(move || {
            let result = store.compact(target);
            (store, result)
        })
        .await;
        match compacted {
            Ok((store, Ok(()))) => {
                self.metrics.compactions_total.inc();
                self.metrics.db_size_bytes.set(store.size_bytes() as i64);
            }
            Ok((_, Err(e))) => {
                self.metrics.checkpoint_errors_total.inc();
                warn!(error = %e, "compaction failed");
            }
            Err(e) => {
                self.metrics.checkpoint_errors_total.inc();
                warn!(error = %e, "compaction task failed");
            }
        }
    }
}

/// Span-processing stage: consumes spans, forwards a bounded, statistically
/// unbiased subsample downstream on a fixed wall-clock cadence.
pub struct Engine {
    shared: Arc<Shared>,
    state: Mutex<EngineState>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Engine {
    /// Build an engine with the system clock.
    pub fn new(config: SamplerConfig, sink: Arc<dyn SpanSink>) -> Result<Self> {
        Self::with_clock(config, sink, Arc::new(SystemClock::new()))
    }

    /// Build an engine with an injected clock (tests drive quiescence and
    /// rollover without sleeping).
    pub fn with_clock(
        config: SamplerConfig,
        sink: Arc<dyn SpanSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics =
            SamplerMetrics::new().map_err(|e| Error::config(format!("metrics: {e}")))?;

        let aggregator = if config.trace_aware {
            let max = NonZeroUsize::new(config.trace_buffer_max_size)
                .ok_or_else(|| Error::config("trace_buffer_max_size must be > 0"))?;
            let agg = TraceAggregator::new(max, config.trace_buffer_timeout());
            let evictions = metrics.lru_evictions_total.clone();
            agg.set_eviction_callback(move |entry| {
                warn!(trace_id = %entry.trace_id, spans = entry.span_count(), "trace buffer full, evicting");
                evictions.inc();
            });
            Some(agg)
        } else {
            None
        };

        let window = WindowController::new(config.window_duration(), clock.wall());
        let reservoir = Reservoir::new(config.reservoir_capacity_k);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                reservoir,
                aggregator,
                window,
                store: Mutex::new(None),
                sink,
                metrics,
                last_save_wall: Mutex::new(None),
            }),
            state: Mutex::new(EngineState::Created),
            scheduler: Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Metrics for this engine instance.
    pub fn metrics(&self) -> &SamplerMetrics {
        &self.shared.metrics
    }

    /// Open the checkpoint store, restore persisted state, and start the
    /// scheduler loops. Valid only in `Created`; on failure the engine
    /// returns to `Created`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut st = self.state.lock();
            if *st != EngineState::Created {
                return Err(Error::lifecycle(format!(
                    "start requires Created, state is {:?}",
                    *st
                )));
            }
            *st = EngineState::Starting;
        }
        match self.start_inner().await {
            Ok(()) => {
                *self.state.lock() = EngineState::Running;
                info!("sampling engine running");
                Ok(())
            }
            Err(e) => {
                if let Some(store) = self.shared.store.lock().take() {
                    store.close();
                }
                *self.state.lock() = EngineState::Created;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        if self.shared.config.persistence_enabled() {
            self.open_and_restore()?;
        }
        self.spawn_loops();
        Ok(())
    }

    fn open_and_restore(&self) -> Result<()> {
        let path = &self.shared.config.checkpoint_path;
        let reset = self.shared.config.reset_on_corrupt;
        let store = match CheckpointStore::open(path) {
            Ok(store) => store,
            Err(Error::CheckpointCorrupt(msg)) if reset => {
                warn!(%msg, "checkpoint database corrupt, resetting");
                std::fs::remove_file(path)?;
                CheckpointStore::open(path)?
            }
            Err(e) => return Err(e),
        };
        let store = Arc::new(store);

        match store.load() {
            Ok(record) => {
                self.shared.reservoir.restore(record.reservoir)?;
                self.shared.window.restore(
                    record.window_id,
                    nanos_to_wall(record.window_start_unix_nanos),
                    nanos_to_wall(record.window_end_unix_nanos),
                    record.rollover_count,
                );
                self.shared.metrics.restore_success_total.inc();
                self.shared
                    .metrics
                    .window_count
                    .set(record.rollover_count as i64);
                self.shared.observe_buffers();
                info!(
                    window_id = record.window_id,
                    units = self.shared.reservoir.len(),
                    "restored from checkpoint"
                );
            }
            Err(Error::CheckpointNotFound) => {
                info!("no checkpoint found, starting fresh");
            }
            Err(Error::CheckpointCorrupt(msg)) => {
                if reset {
                    warn!(%msg, "checkpoint record corrupt, starting fresh");
                } else {
                    store.close();
                    return Err(Error::CheckpointCorrupt(msg));
                }
            }
            Err(e) => {
                store.close();
                return Err(e);
            }
        }

        self.shared
            .metrics
            .db_size_bytes
            .set(store.size_bytes() as i64);
        *self.shared.store.lock() = Some(store);
        Ok(())
    }

    fn spawn_loops(&self) {
        let mut sched = Scheduler::new();

        // Window check: rollover hands the reservoir contents downstream.
        let period = (self.shared.config.window_duration() / 10).max(MIN_WINDOW_CHECK_PERIOD);
        let shared = Arc::clone(&self.shared);
        let mut sig = sched.shutdown_signal();
        sched.spawn("window-check", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = shared.clock.wall();
                        if shared.window.check_rollover(now) {
                            let rollovers = shared.window.current().rollover_count;
                            shared.metrics.window_count.set(rollovers as i64);
                            shared.flush_once().await;
                        }
                    }
                    _ = sig.changed() => break,
                }
            }
        });

        // Aggregator sweep: close quiescent traces into the reservoir.
        if self.shared.aggregator.is_some() {
            let period = (self.shared.config.trace_buffer_timeout() / 10).max(MIN_SWEEP_PERIOD);
            let shared = Arc::clone(&self.shared);
            let mut sig = sched.shutdown_signal();
            sched.spawn("aggregator-sweep", async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => shared.sweep_once(),
                        _ = sig.changed() => break,
                    }
                }
            });
        }

        if self.shared.store.lock().is_some() {
            // Periodic checkpoint.
            let period = self.shared.config.checkpoint_interval();
            let shared = Arc::clone(&self.shared);
            let mut sig = sched.shutdown_signal();
            sched.spawn("checkpoint", async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            shared.checkpoint_once().await;
                            shared.update_checkpoint_age();
                        }
                        _ = sig.changed() => break,
                    }
                }
            });

            // Compaction cron.
            if let Some(expr) = self.shared.config.compaction_cron.clone() {
                match CompactionSchedule::parse(&expr) {
                    Ok(schedule) => {
                        let shared = Arc::clone(&self.shared);
                        let mut sig = sched.shutdown_signal();
                        sched.spawn("compaction", async move {
                            loop {
                                let now = DateTime::<Utc>::from(shared.clock.wall());
                                let Some(next) = schedule.next_after(now) else {
                                    // Never fires again; park until shutdown.
                                    let _ = sig.changed().await;
                                    break;
                                };
                                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                                tokio::select! {
                                    _ = tokio::time::sleep(wait) => shared.compact_once().await,
                                    _ = sig.changed() => break,
                                }
                            }
                        });
                    }
                    // Unreachable when the config was validated.
                    Err(e) => warn!(error = %e, "compaction schedule not started"),
                }
            }
        }

        *self.scheduler.lock() = Some(sched);
    }

    /// Accept a batch of spans. Valid only in `Running`. Every span is
    /// validated before any is routed; a zero trace or span id rejects the
    /// whole batch with `InvalidSpan`.
    pub fn ingest(&self, spans: Vec<SpanRecord>) -> Result<()> {
        let st = self.state();
        if st != EngineState::Running {
            return Err(Error::lifecycle(format!(
                "ingest requires Running, state is {st:?}"
            )));
        }
        for span in &spans {
            span.validate()?;
        }
        let now = self.shared.clock.monotonic();
        for span in spans {
            match &self.shared.aggregator {
                Some(agg) => agg.add_span(span, now),
                None => {
                    let key = SampleKey::Span(span.span_id, span.trace_id);
                    self.shared.reservoir.offer(key, vec![span]);
                }
            }
        }
        self.shared.observe_buffers();
        Ok(())
    }

    /// Immediately drain the reservoir downstream, outside the window
    /// cadence. Intended for tests.
    pub async fn force_flush(&self) -> Result<()> {
        if self.state() != EngineState::Running {
            return Err(Error::lifecycle("force_flush requires Running"));
        }
        self.shared.flush_once().await;
        Ok(())
    }

    /// Graceful shutdown: drain the aggregator through the sampler, flush
    /// once, save a final checkpoint, stop the loops, and close the store.
    /// All bounded by `timeout`; residual work past the deadline is dropped.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        {
            let mut st = self.state.lock();
            if *st != EngineState::Running {
                return Err(Error::lifecycle(format!(
                    "stop requires Running, state is {:?}",
                    *st
                )));
            }
            *st = EngineState::Stopping;
        }
        let deadline = tokio::time::Instant::now() + timeout;

        if let Some(agg) = &self.shared.aggregator {
            for entry in agg.drain_all() {
                self.shared.offer_trace(entry);
            }
        }
        if tokio::time::timeout_at(deadline, self.shared.flush_once())
            .await
            .is_err()
        {
            warn!("stop deadline hit during final flush, residual data dropped");
        }
        if tokio::time::timeout_at(deadline, self.shared.checkpoint_once())
            .await
            .is_err()
        {
            warn!("stop deadline hit during final checkpoint");
        }

        let sched = self.scheduler.lock().take();
        if let Some(sched) = sched {
            sched.stop(deadline).await;
        }
        if let Some(store) = self.shared.store.lock().take() {
            store.close();
        }
        *self.state.lock() = EngineState::Stopped;
        info!("sampling engine stopped");
        Ok(())
    }

    /// Tear down without draining, flushing, or saving, releasing the store
    /// lock. Models an unclean process exit; test support.
    pub fn abandon(&self) {
        if let Some(sched) = self.scheduler.lock().take() {
            sched.abort();
        }
        if let Some(store) = self.shared.store.lock().take() {
            store.close();
        }
        *self.state.lock() = EngineState::Stopped;
    }
}
