use std::time::Duration;

use tidepool_core::{
    AttrValue, Clock, ManualClock, SamplerConfig, SampleKey, SpanId, SpanRecord, TraceId,
};

#[test]
fn ids_reject_zero_and_display_hex() -> Result<(), Box<dyn std::error::Error>> {
    assert!(TraceId::new([0u8; 16]).is_err());
    assert!(SpanId::new([0u8; 8]).is_err());
    let t = TraceId::new([0x0f; 16])?;
    assert_eq!(t.to_string(), "0f".repeat(16));
    Ok(())
}

#[test]
fn span_record_invariants() {
    let mut span = SpanRecord::new(TraceId([1; 16]), SpanId([2; 8]), "GET /");
    span.start_unix_nanos = 100;
    span.end_unix_nanos = 250;
    span.attributes
        .push(("http.method".into(), AttrValue::Str("GET".into())));
    assert!(span.validate().is_ok());
    assert_eq!(span.duration_nanos(), 150);

    span.end_unix_nanos = 50;
    assert!(span.validate().is_err());
}

#[test]
fn sample_key_lengths_distinguish_modes() -> Result<(), Box<dyn std::error::Error>> {
    let trace_key = SampleKey::Trace(TraceId([5; 16]));
    let span_key = SampleKey::Span(SpanId([6; 8]), TraceId([5; 16]));
    assert_eq!(trace_key.to_bytes().len(), 16);
    assert_eq!(span_key.to_bytes().len(), 24);
    assert_eq!(SampleKey::from_bytes(&span_key.to_bytes())?, span_key);
    Ok(())
}

#[test]
fn config_default_is_valid_and_loads_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = SamplerConfig::default();
    cfg.validate()?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sampler.toml");
    std::fs::write(
        &path,
        "reservoir_capacity_k = 100\n\
         window_duration_ms = 60000\n\
         checkpoint_path = \"/var/lib/tidepool/ckpt.redb\"\n\
         checkpoint_interval_ms = 10000\n\
         compaction_cron = \"0 3 * * *\"\n",
    )?;
    let loaded = SamplerConfig::from_file(&path)?;
    assert_eq!(loaded.reservoir_capacity_k, 100);
    assert!(loaded.persistence_enabled());
    assert_eq!(loaded.window_duration(), Duration::from_secs(60));
    Ok(())
}

#[test]
fn manual_clock_drives_both_time_axes() {
    let clock = ManualClock::new();
    let w0 = clock.wall();
    clock.advance(Duration::from_secs(2));
    assert_eq!(clock.monotonic(), Duration::from_secs(2));
    assert_eq!(clock.wall().duration_since(w0).unwrap(), Duration::from_secs(2));
}
