#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::{Error, Result};

/// 16-byte trace identifier. Constrained to non-zero in most contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    /// Create a trace id, rejecting the all-zero value.
    pub fn new(bytes: [u8; 16]) -> Result<Self> {
        if bytes == [0u8; 16] {
            return Err(Error::invalid_span("trace id must be non-zero"));
        }
        Ok(Self(bytes))
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True when every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// 8-byte span identifier. Constrained to non-zero in most contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    /// Create a span id, rejecting the all-zero value.
    pub fn new(bytes: [u8; 8]) -> Result<Self> {
        if bytes == [0u8; 8] {
            return Err(Error::invalid_span("span id must be non-zero"));
        }
        Ok(Self(bytes))
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// True when every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Tagged attribute value. Arrays and maps nest arbitrarily; consumers that
/// walk nested values must do so iteratively (see the checkpoint codec).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// UTF-8 string
    Str(String),
    /// Signed 64-bit integer
    I64(i64),
    /// IEEE-754 double
    F64(f64),
    /// Boolean
    Bool(bool),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Ordered sequence of values
    Array(Vec<AttrValue>),
    /// Ordered key/value pairs
    Map(Vec<(String, AttrValue)>),
}

/// One timestamped event attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nanos: u64,
    pub attributes: Vec<(String, AttrValue)>,
}

/// One link from a span to another span, possibly in another trace.
/// Identifier-level only; links never reference in-memory objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub attributes: Vec<(String, AttrValue)>,
}

/// Span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    /// Wire tag used by the checkpoint codec.
    pub fn as_u8(self) -> u8 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }

    /// Inverse of [`StatusCode::as_u8`].
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(StatusCode::Unset),
            1 => Ok(StatusCode::Ok),
            2 => Ok(StatusCode::Error),
            other => Err(Error::invalid_span(format!("unknown status code {other}"))),
        }
    }
}

/// Span status: a code plus a free-form message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    pub message: String,
}

/// Instrumentation scope metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub name: String,
    pub version: String,
}

/// In-memory representation of one span plus its resource/scope context.
///
/// Ownership transfers to the engine on ingest; components exchange spans by
/// value, never through shared mutable references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    /// Start timestamp, nanoseconds since the Unix epoch.
    pub start_unix_nanos: u64,
    /// End timestamp, nanoseconds since the Unix epoch. Always >= start.
    pub end_unix_nanos: u64,
    pub attributes: Vec<(String, AttrValue)>,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    pub status: SpanStatus,
    pub resource: Vec<(String, AttrValue)>,
    pub scope: ScopeInfo,
}

impl SpanRecord {
    /// Minimal record with the given ids and name; timestamps zeroed.
    pub fn new(trace_id: TraceId, span_id: SpanId, name: impl Into<String>) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            name: name.into(),
            start_unix_nanos: 0,
            end_unix_nanos: 0,
            attributes: Vec::new(),
            events: Vec::new(),
            links: Vec::new(),
            status: SpanStatus::default(),
            resource: Vec::new(),
            scope: ScopeInfo::default(),
        }
    }

    /// Enforce the record invariants: non-zero ids, end >= start, and unique
    /// attribute keys.
    pub fn validate(&self) -> Result<()> {
        if self.trace_id.is_zero() {
            return Err(Error::invalid_span("trace id must be non-zero"));
        }
        if self.span_id.is_zero() {
            return Err(Error::invalid_span("span id must be non-zero"));
        }
        if self.end_unix_nanos < self.start_unix_nanos {
            return Err(Error::invalid_span(format!(
                "span {} ends before it starts",
                self.span_id
            )));
        }
        let mut keys: Vec<&str> = self.attributes.iter().map(|(k, _)| k.as_str()).collect();
        keys.sort_unstable();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::invalid_span("duplicate attribute key"));
        }
        Ok(())
    }

    /// Span duration in nanoseconds.
    pub fn duration_nanos(&self) -> u64 {
        self.end_unix_nanos.saturating_sub(self.start_unix_nanos)
    }
}

/// One partially assembled trace inside the aggregator.
///
/// All contained spans share `trace_id`. `last_update` is a monotonic offset
/// taken from the injectable clock, not a wall timestamp.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub trace_id: TraceId,
    /// Spans in append order, not tree order.
    pub spans: Vec<SpanRecord>,
    pub last_update: Duration,
}

impl TraceEntry {
    pub fn new(trace_id: TraceId, now: Duration) -> Self {
        Self {
            trace_id,
            spans: Vec::new(),
            last_update: now,
        }
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }
}

/// Deterministic address of one reservoir slot.
///
/// Trace-aware sampling keys on the trace id alone; per-span sampling keys on
/// the span id concatenated with the trace id, so a span id reused under two
/// trace ids yields two distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleKey {
    /// Whole-trace unit (trace-aware mode).
    Trace(TraceId),
    /// Single-span unit: span id then trace id.
    Span(SpanId, TraceId),
}

impl SampleKey {
    /// Serialized form: 16 bytes for a trace key, 24 for a span key.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            SampleKey::Trace(t) => t.as_bytes().to_vec(),
            SampleKey::Span(s, t) => {
                let mut out = Vec::with_capacity(24);
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(t.as_bytes());
                out
            }
        }
    }

    /// Inverse of [`SampleKey::to_bytes`]; length decides the variant.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            16 => {
                let mut t = [0u8; 16];
                t.copy_from_slice(bytes);
                Ok(SampleKey::Trace(TraceId(t)))
            }
            24 => {
                let mut s = [0u8; 8];
                let mut t = [0u8; 16];
                s.copy_from_slice(&bytes[..8]);
                t.copy_from_slice(&bytes[8..]);
                Ok(SampleKey::Span(SpanId(s), TraceId(t)))
            }
            n => Err(Error::invalid_span(format!("sample key of {n} bytes"))),
        }
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleKey::Trace(t) => write!(f, "{t}"),
            SampleKey::Span(s, t) => write!(f, "{s}-{t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(b: u8) -> TraceId {
        TraceId([b; 16])
    }

    fn sid(b: u8) -> SpanId {
        SpanId([b; 8])
    }

    #[test]
    fn zero_ids_rejected() {
        assert!(TraceId::new([0u8; 16]).is_err());
        assert!(SpanId::new([0u8; 8]).is_err());
        assert!(TraceId::new([1u8; 16]).is_ok());
    }

    #[test]
    fn display_is_hex() {
        let t = TraceId::new([0xab; 16]).unwrap();
        assert_eq!(format!("{t}"), "ab".repeat(16));
        let s = SpanId::new([0x01; 8]).unwrap();
        assert_eq!(format!("{s}"), "01".repeat(8));
    }

    #[test]
    fn validate_end_before_start() {
        let mut span = SpanRecord::new(tid(1), sid(1), "op");
        span.start_unix_nanos = 10;
        span.end_unix_nanos = 5;
        assert!(span.validate().is_err());
        span.end_unix_nanos = 10;
        assert!(span.validate().is_ok());
    }

    #[test]
    fn validate_duplicate_attr_key() {
        let mut span = SpanRecord::new(tid(1), sid(1), "op");
        span.attributes.push(("k".into(), AttrValue::I64(1)));
        span.attributes.push(("k".into(), AttrValue::I64(2)));
        assert!(span.validate().is_err());
    }

    #[test]
    fn sample_key_roundtrip() {
        let k = SampleKey::Trace(tid(7));
        assert_eq!(SampleKey::from_bytes(&k.to_bytes()).unwrap(), k);
        let k = SampleKey::Span(sid(3), tid(9));
        let bytes = k.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(SampleKey::from_bytes(&bytes).unwrap(), k);
        assert!(SampleKey::from_bytes(&[0u8; 5]).is_err());
    }

    #[test]
    fn span_keys_distinct_across_traces() {
        let a = SampleKey::Span(sid(3), tid(1));
        let b = SampleKey::Span(sid(3), tid(2));
        assert_ne!(a.to_bytes(), b.to_bytes());
    }
}
