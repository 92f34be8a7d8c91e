#![forbid(unsafe_code)]

//! Uniform reservoir sampling (Vitter's Algorithm R) over keyed units.
//!
//! A unit is a whole trace in trace-aware mode or a single span otherwise;
//! either way it is a `Vec<SpanRecord>` addressed by a [`SampleKey`]. The
//! reservoir keeps at most K units per window and gives each of the n units
//! observed in that window an inclusion probability of K/n.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tidepool_core::{Error, Result, SampleKey, SpanRecord};
use tracing::debug;

/// A copy of the reservoir state, taken under the lock. This is what gets
/// checkpointed and what `restore` installs.
#[derive(Debug, Clone)]
pub struct ReservoirSnapshot {
    pub capacity: usize,
    /// Units observed in the current window.
    pub observed: u64,
    /// PRNG seed; survives checkpointing so restored processors stay
    /// independent of wall-clock at restart.
    pub seed: u64,
    /// Admitted units in insertion order.
    pub slots: Vec<(SampleKey, Vec<SpanRecord>)>,
}

struct Inner {
    capacity: usize,
    observed: u64,
    seed: u64,
    rng: ChaCha8Rng,
    slots: HashMap<SampleKey, Vec<SpanRecord>>,
    /// Keys in admission order; position j is the slot Algorithm R replaces.
    order: Vec<SampleKey>,
}

impl Inner {
    fn check_invariants(&self) -> Result<()> {
        if self.slots.len() != self.order.len() {
            return Err(Error::invalid_checkpoint(format!(
                "slot map has {} entries but order vector has {}",
                self.slots.len(),
                self.order.len()
            )));
        }
        for key in &self.order {
            if !self.slots.contains_key(key) {
                return Err(Error::invalid_checkpoint(format!(
                    "order vector references missing key {key}"
                )));
            }
        }
        let expect = (self.observed as usize).min(self.capacity);
        if self.slots.len() != expect {
            return Err(Error::invalid_checkpoint(format!(
                "{} slots held, expected min(observed={}, capacity={})",
                self.slots.len(),
                self.observed,
                self.capacity
            )));
        }
        Ok(())
    }
}

/// Fixed-capacity uniform sample over a stream of unknown length.
///
/// Thread-safe; all state sits behind one exclusive lock and snapshots are
/// taken by copy, so `snapshot_and_reset` is atomic with respect to `offer`.
pub struct Reservoir {
    inner: Mutex<Inner>,
}

impl Reservoir {
    /// Create an empty reservoir with capacity `k`, seeded from OS entropy.
    pub fn new(k: usize) -> Self {
        Self::with_seed(k, rand::random::<u64>())
    }

    /// Create an empty reservoir with a fixed seed (deterministic sampling).
    pub fn with_seed(k: usize, seed: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: k,
                observed: 0,
                seed,
                rng: ChaCha8Rng::seed_from_u64(seed),
                slots: HashMap::with_capacity(k),
                order: Vec::with_capacity(k),
            }),
        }
    }

    /// Offer one unit. Returns whether the unit was admitted.
    ///
    /// Re-offering a key already present refreshes its payload without
    /// consuming the observation count or moving the slot.
    pub fn offer(&self, key: SampleKey, spans: Vec<SpanRecord>) -> bool {
        let mut g = self.inner.lock();
        if let Some(existing) = g.slots.get_mut(&key) {
            *existing = spans;
            return true;
        }
        g.observed += 1;
        if g.slots.len() < g.capacity {
            g.order.push(key);
            g.slots.insert(key, spans);
            return true;
        }
        let n = g.observed;
        let j = g.rng.gen_range(0..n) as usize;
        if j < g.capacity {
            let evicted = g.order[j];
            g.slots.remove(&evicted);
            g.order[j] = key;
            g.slots.insert(key, spans);
            true
        } else {
            false
        }
    }

    /// Atomically take every admitted unit and reset the window population
    /// to zero. The PRNG and its seed are kept.
    pub fn snapshot_and_reset(&self) -> Vec<(SampleKey, Vec<SpanRecord>)> {
        let mut g = self.inner.lock();
        let order = std::mem::take(&mut g.order);
        let mut slots = std::mem::take(&mut g.slots);
        g.observed = 0;
        let drained: Vec<_> = order
            .into_iter()
            .filter_map(|key| slots.remove(&key).map(|spans| (key, spans)))
            .collect();
        debug!(units = drained.len(), "reservoir drained");
        drained
    }

    /// Copy the full state under the lock, for checkpointing.
    pub fn snapshot(&self) -> ReservoirSnapshot {
        let g = self.inner.lock();
        ReservoirSnapshot {
            capacity: g.capacity,
            observed: g.observed,
            seed: g.seed,
            slots: g
                .order
                .iter()
                .filter_map(|key| g.slots.get(key).map(|spans| (*key, spans.clone())))
                .collect(),
        }
    }

    /// Install an externally provided state, e.g. from a checkpoint.
    ///
    /// Fails with `InvalidCheckpoint` when the snapshot breaks the reservoir
    /// invariants. The current capacity wins over the snapshot's.
    pub fn restore(&self, snapshot: ReservoirSnapshot) -> Result<()> {
        let mut g = self.inner.lock();
        if snapshot.slots.len() > g.capacity {
            return Err(Error::invalid_checkpoint(format!(
                "snapshot holds {} slots, capacity is {}",
                snapshot.slots.len(),
                g.capacity
            )));
        }
        let mut slots = HashMap::with_capacity(snapshot.slots.len());
        let mut order = Vec::with_capacity(snapshot.slots.len());
        for (key, spans) in snapshot.slots {
            if slots.insert(key, spans).is_some() {
                return Err(Error::invalid_checkpoint(format!("duplicate key {key}")));
            }
            order.push(key);
        }
        let restored = Inner {
            capacity: g.capacity,
            observed: snapshot.observed,
            seed: snapshot.seed,
            rng: ChaCha8Rng::seed_from_u64(snapshot.seed),
            slots,
            order,
        };
        restored.check_invariants()?;
        *g = restored;
        Ok(())
    }

    /// Number of admitted units.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// True when no unit is admitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity K.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Units observed in the current window.
    pub fn observed(&self) -> u64 {
        self.inner.lock().observed
    }

    /// Change K. Downscaling evicts randomly (shuffle-and-truncate) to the
    /// new size; future admissions proceed unbiased against the new K.
    pub fn set_capacity(&self, new: usize) {
        let mut g = self.inner.lock();
        if new < g.order.len() {
            // Fisher-Yates over the order vector, then truncate.
            for i in (1..g.order.len()).rev() {
                let j = g.rng.gen_range(0..=i);
                g.order.swap(i, j);
            }
            let dropped: Vec<SampleKey> = g.order.split_off(new);
            for key in dropped {
                g.slots.remove(&key);
            }
        }
        g.capacity = new;
    }
}
