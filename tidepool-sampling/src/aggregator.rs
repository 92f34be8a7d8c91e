#![forbid(unsafe_code)]

//! Per-trace span buffer. Spans are grouped by trace id until the trace goes
//! quiet for the configured timeout, at which point the whole group is
//! harvested as one closed trace. Memory is bounded by an LRU: when the map
//! is full, the least-recently-updated trace is evicted and dropped.
//!
//! Trace completion is approximated by quiescence. A trace that outlives the
//! timeout is harvested as multiple fragments; that is a documented trade-off
//! of the design, not a bug.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tidepool_core::{SpanRecord, TraceEntry, TraceId};
use tracing::debug;

type EvictionCallback = Box<dyn Fn(&TraceEntry) + Send + Sync>;

struct Inner {
    entries: LruCache<TraceId, TraceEntry>,
    span_total: usize,
    evictions: u64,
}

/// Groups incoming spans into traces and emits them on quiescence.
///
/// All state sits behind one exclusive lock. The eviction callback runs
/// synchronously after the lock is released and must not reenter the
/// aggregator.
pub struct TraceAggregator {
    inner: Mutex<Inner>,
    callback: Mutex<Option<EvictionCallback>>,
    timeout: Duration,
}

impl TraceAggregator {
    /// `max_size` bounds the number of buffered traces; `timeout` is the
    /// quiescence threshold applied by [`TraceAggregator::harvest_closed`].
    pub fn new(max_size: NonZeroUsize, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(max_size),
                span_total: 0,
                evictions: 0,
            }),
            callback: Mutex::new(None),
            timeout,
        }
    }

    /// Append one span to its trace, creating the entry on first sight and
    /// marking it most-recently-updated. `now` is a monotonic clock offset.
    pub fn add_span(&self, span: SpanRecord, now: Duration) {
        let evicted = {
            let mut g = self.inner.lock();
            let trace_id = span.trace_id;
            let mut evicted = None;
            if let Some(entry) = g.entries.get_mut(&trace_id) {
                entry.spans.push(span);
                entry.last_update = now;
            } else {
                if g.entries.len() == usize::from(g.entries.cap()) {
                    // Full: drop the least-recently-updated trace.
                    if let Some((_, old)) = g.entries.pop_lru() {
                        g.span_total -= old.span_count();
                        g.evictions += 1;
                        evicted = Some(old);
                    }
                }
                let mut entry = TraceEntry::new(trace_id, now);
                entry.spans.push(span);
                g.entries.put(trace_id, entry);
            }
            g.span_total += 1;
            evicted
        };
        if let Some(entry) = evicted {
            debug!(trace_id = %entry.trace_id, spans = entry.span_count(), "trace evicted");
            if let Some(cb) = self.callback.lock().as_ref() {
                cb(&entry);
            }
        }
    }

    /// Remove and return every trace quiet for longer than the timeout.
    pub fn harvest_closed(&self, now: Duration) -> Vec<TraceEntry> {
        let mut g = self.inner.lock();
        let closed: Vec<TraceId> = g
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_update) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        closed
            .into_iter()
            .filter_map(|id| {
                let entry = g.entries.pop(&id)?;
                g.span_total -= entry.span_count();
                Some(entry)
            })
            .collect()
    }

    /// Remove and return every buffered trace regardless of quiescence.
    /// Used on shutdown to flush partial traces through the sampler.
    pub fn drain_all(&self) -> Vec<TraceEntry> {
        let mut g = self.inner.lock();
        let mut out = Vec::with_capacity(g.entries.len());
        while let Some((_, entry)) = g.entries.pop_lru() {
            out.push(entry);
        }
        g.span_total = 0;
        out
    }

    /// Install the eviction callback. It is invoked synchronously per
    /// eviction and must not call back into the aggregator.
    pub fn set_eviction_callback<F>(&self, f: F)
    where
        F: Fn(&TraceEntry) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Box::new(f));
    }

    /// Number of buffered traces.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when no trace is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total spans across all buffered traces.
    pub fn span_count(&self) -> usize {
        self.inner.lock().span_total
    }

    /// Evictions since construction.
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tidepool_core::SpanId;

    fn span(trace: u8, span_n: u8) -> SpanRecord {
        SpanRecord::new(
            TraceId([trace; 16]),
            SpanId([span_n; 8]),
            format!("op-{span_n}"),
        )
    }

    fn agg(cap: usize, timeout_ms: u64) -> TraceAggregator {
        TraceAggregator::new(
            NonZeroUsize::new(cap).unwrap(),
            Duration::from_millis(timeout_ms),
        )
    }

    #[test]
    fn groups_spans_by_trace() {
        let a = agg(8, 100);
        a.add_span(span(1, 1), Duration::ZERO);
        a.add_span(span(1, 2), Duration::from_millis(1));
        a.add_span(span(2, 3), Duration::from_millis(2));
        assert_eq!(a.len(), 2);
        assert_eq!(a.span_count(), 3);
    }

    #[test]
    fn harvest_respects_quiescence() {
        let a = agg(8, 100);
        a.add_span(span(1, 1), Duration::ZERO);
        a.add_span(span(2, 2), Duration::from_millis(90));

        // Trace 1 is quiet for 150ms, trace 2 only for 60ms.
        let closed = a.harvest_closed(Duration::from_millis(150));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].trace_id, TraceId([1; 16]));
        assert_eq!(a.len(), 1);
        assert_eq!(a.span_count(), 1);
    }

    #[test]
    fn new_span_resets_quiescence() {
        let a = agg(8, 100);
        a.add_span(span(1, 1), Duration::ZERO);
        a.add_span(span(1, 2), Duration::from_millis(80));
        // 120ms after the first span but only 40ms after the second.
        assert!(a.harvest_closed(Duration::from_millis(120)).is_empty());
        let closed = a.harvest_closed(Duration::from_millis(200));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].span_count(), 2);
    }

    #[test]
    fn lru_eviction_drops_oldest() {
        let a = agg(2, 10_000);
        let evicted = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&evicted);
        a.set_eviction_callback(move |entry| {
            assert_eq!(entry.trace_id, TraceId([1; 16]));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        a.add_span(span(1, 1), Duration::ZERO);
        a.add_span(span(2, 2), Duration::from_millis(1));
        a.add_span(span(3, 3), Duration::from_millis(2));

        assert_eq!(a.len(), 2);
        assert_eq!(a.evictions(), 1);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        // The survivors are exactly traces 2 and 3.
        let mut ids: Vec<TraceId> = a.drain_all().into_iter().map(|e| e.trace_id).collect();
        ids.sort();
        assert_eq!(ids, vec![TraceId([2; 16]), TraceId([3; 16])]);
    }

    #[test]
    fn touching_a_trace_protects_it_from_eviction() {
        let a = agg(2, 10_000);
        a.add_span(span(1, 1), Duration::ZERO);
        a.add_span(span(2, 2), Duration::from_millis(1));
        // Trace 1 becomes most-recently-updated again.
        a.add_span(span(1, 3), Duration::from_millis(2));
        a.add_span(span(3, 4), Duration::from_millis(3));

        let mut ids: Vec<TraceId> = a.drain_all().into_iter().map(|e| e.trace_id).collect();
        ids.sort();
        assert_eq!(ids, vec![TraceId([1; 16]), TraceId([3; 16])]);
    }

    #[test]
    fn drain_all_empties_counters() {
        let a = agg(4, 100);
        a.add_span(span(1, 1), Duration::ZERO);
        a.add_span(span(2, 2), Duration::ZERO);
        let drained = a.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(a.len(), 0);
        assert_eq!(a.span_count(), 0);
    }
}
