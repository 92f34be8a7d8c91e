//! End-to-end persistence property: a reservoir snapshot that was saved,
//! loaded after a simulated crash, and restored yields the same multiset of
//! payloads the save captured.

use std::collections::BTreeMap;

use tidepool_checkpoint::{CheckpointRecord, CheckpointStore};
use tidepool_core::{AttrValue, SampleKey, SpanId, SpanRecord, TraceId};
use tidepool_sampling::Reservoir;

fn span(i: u64) -> SpanRecord {
    let mut t = [0u8; 16];
    t[..8].copy_from_slice(&i.to_le_bytes());
    t[15] = 1;
    let mut s = SpanRecord::new(TraceId(t), SpanId([i as u8 + 1; 8]), format!("op-{i}"));
    s.start_unix_nanos = 1_000 * i;
    s.end_unix_nanos = 1_000 * i + 500;
    s.attributes.push(("index".into(), AttrValue::I64(i as i64)));
    s
}

fn offer_all(reservoir: &Reservoir, n: u64) {
    for i in 0..n {
        let s = span(i);
        reservoir.offer(SampleKey::Trace(s.trace_id), vec![s]);
    }
}

fn payload_multiset(slots: &[(SampleKey, Vec<SpanRecord>)]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for (_, spans) in slots {
        for s in spans {
            *out.entry(format!("{}/{}", s.trace_id, s.name)).or_insert(0) += 1;
        }
    }
    out
}

#[test]
fn save_kill_load_restore_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ckpt.redb");

    let reservoir = Reservoir::with_seed(5, 4242);
    offer_all(&reservoir, 20);
    let captured = reservoir.snapshot();
    let expected = payload_multiset(&captured.slots);

    {
        let store = CheckpointStore::open(&path).unwrap();
        store
            .save(&CheckpointRecord {
                reservoir: captured,
                window_id: 77,
                window_start_unix_nanos: 1,
                window_end_unix_nanos: 2,
                rollover_count: 3,
            })
            .unwrap();
        // Simulated crash: the store is dropped without close().
    }

    let store = CheckpointStore::open(&path).unwrap();
    let record = store.load().unwrap();
    assert_eq!(record.window_id, 77);
    assert_eq!(record.rollover_count, 3);

    let restored = Reservoir::with_seed(5, 1);
    restored.restore(record.reservoir).unwrap();
    assert_eq!(restored.len(), 5);
    assert_eq!(restored.observed(), 20);

    let drained = restored.snapshot_and_reset();
    assert_eq!(payload_multiset(&drained), expected);
}

/// Successive saves within one window never regress: the observed count in
/// the stored record is monotonically non-decreasing.
#[test]
fn checkpoint_observed_count_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ckpt.redb");
    let store = CheckpointStore::open(&path).unwrap();
    let reservoir = Reservoir::with_seed(3, 7);

    let mut last_observed = 0;
    for step in 1..=6u64 {
        offer_all(&reservoir, step); // re-offers refresh, new keys count
        store
            .save(&CheckpointRecord {
                reservoir: reservoir.snapshot(),
                window_id: 1,
                window_start_unix_nanos: 0,
                window_end_unix_nanos: 0,
                rollover_count: 0,
            })
            .unwrap();
        let record = store.load().unwrap();
        assert!(record.reservoir.observed >= last_observed);
        last_observed = record.reservoir.observed;
    }
    assert_eq!(last_observed, 6);
    store.close();
}

/// The restored PRNG seed equals the saved one, so two processes restored
/// from the same checkpoint make identical sampling decisions.
#[test]
fn restored_processors_replay_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ckpt.redb");

    let original = Reservoir::with_seed(4, 31337);
    offer_all(&original, 10);
    {
        let store = CheckpointStore::open(&path).unwrap();
        store
            .save(&CheckpointRecord {
                reservoir: original.snapshot(),
                window_id: 0,
                window_start_unix_nanos: 0,
                window_end_unix_nanos: 0,
                rollover_count: 0,
            })
            .unwrap();
        store.close();
    }

    let store = CheckpointStore::open(&path).unwrap();
    let a = Reservoir::with_seed(4, 0);
    let b = Reservoir::with_seed(4, 0);
    a.restore(store.load().unwrap().reservoir).unwrap();
    b.restore(store.load().unwrap().reservoir).unwrap();
    for i in 10..60 {
        let s = span(i);
        let key = SampleKey::Trace(s.trace_id);
        assert_eq!(
            a.offer(key, vec![s.clone()]),
            b.offer(key, vec![s]),
            "divergence at unit {i}"
        );
    }
    store.close();
}
