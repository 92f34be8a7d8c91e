#![forbid(unsafe_code)]

//! Bit-exact binary layout for checkpointed spans and reservoir snapshots.
//!
//! Everything is little-endian and length-prefixed. Each span record carries
//! a fixed header (magic, version, section flags, section sizes) followed by
//! the span, resource, and scope sections; nested attribute values are walked
//! with an explicit worklist in both directions so pathological nesting can
//! never blow the stack, and every declared length is validated against the
//! remaining payload before allocation.

use bytes::{BufMut, BytesMut};
use tidepool_core::{
    AttrValue, Error, Result, SampleKey, ScopeInfo, SpanEvent, SpanLink, SpanRecord, SpanStatus,
    SpanId, StatusCode, TraceId,
};
use tidepool_sampling::ReservoirSnapshot;

/// Record magic: `S P A N`.
pub const MAGIC: [u8; 4] = *b"SPAN";
/// Current record version.
pub const VERSION: u8 = 1;

const FLAG_SPAN: u32 = 1;
const FLAG_RESOURCE: u32 = 1 << 1;
const FLAG_SCOPE: u32 = 1 << 2;

const TAG_STR: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_MAP: u8 = 7;

/// Upper bound on TLV items decoded per span; caps memory on hostile input.
const MAX_TLV_ITEMS: u64 = 1 << 20;

/// Durable serialization of reservoir plus window state.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub reservoir: ReservoirSnapshot,
    pub window_id: i64,
    pub window_start_unix_nanos: u64,
    pub window_end_unix_nanos: u64,
    pub rollover_count: u64,
}

/// Checked sequential reader over a byte slice. Every accessor verifies the
/// remaining length first and fails with `CheckpointCorrupt` on underrun.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::corrupt(format!(
                "need {n} bytes, {} remain",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// u32 length prefix + raw bytes.
    fn get_len_bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.get_u32()? as usize;
        self.take(n)
    }

    fn get_string(&mut self) -> Result<String> {
        let raw = self.get_len_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::corrupt("string is not UTF-8"))
    }

    /// Declared element counts may never exceed the bytes left to parse;
    /// every element costs at least one byte on the wire.
    fn check_count(&self, n: u32) -> Result<()> {
        if n as usize > self.remaining() {
            return Err(Error::corrupt(format!(
                "declared count {n} exceeds {} remaining bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

fn put_str(dst: &mut BytesMut, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.extend_from_slice(s.as_bytes());
}

enum EncItem<'a> {
    Value(&'a AttrValue),
    Key(&'a str),
}

/// Serialize one value, iteratively. Containers write their tag and element
/// count up front, then queue children on the worklist.
fn put_attr_value(dst: &mut BytesMut, value: &AttrValue) {
    let mut work = vec![EncItem::Value(value)];
    while let Some(item) = work.pop() {
        match item {
            EncItem::Key(k) => put_str(dst, k),
            EncItem::Value(AttrValue::Str(s)) => {
                dst.put_u8(TAG_STR);
                put_str(dst, s);
            }
            EncItem::Value(AttrValue::I64(i)) => {
                dst.put_u8(TAG_I64);
                dst.put_i64_le(*i);
            }
            EncItem::Value(AttrValue::F64(f)) => {
                dst.put_u8(TAG_F64);
                dst.put_u64_le(f.to_bits());
            }
            EncItem::Value(AttrValue::Bool(b)) => {
                dst.put_u8(TAG_BOOL);
                dst.put_u8(u8::from(*b));
            }
            EncItem::Value(AttrValue::Bytes(b)) => {
                dst.put_u8(TAG_BYTES);
                dst.put_u32_le(b.len() as u32);
                dst.extend_from_slice(b);
            }
            EncItem::Value(AttrValue::Array(items)) => {
                dst.put_u8(TAG_ARRAY);
                dst.put_u32_le(items.len() as u32);
                for item in items.iter().rev() {
                    work.push(EncItem::Value(item));
                }
            }
            EncItem::Value(AttrValue::Map(entries)) => {
                dst.put_u8(TAG_MAP);
                dst.put_u32_le(entries.len() as u32);
                for (k, v) in entries.iter().rev() {
                    work.push(EncItem::Value(v));
                    work.push(EncItem::Key(k));
                }
            }
        }
    }
}

enum Frame {
    Array {
        remaining: u32,
        items: Vec<AttrValue>,
    },
    Map {
        remaining: u32,
        entries: Vec<(String, AttrValue)>,
        pending: Option<String>,
    },
}

/// Deserialize one value, iteratively, with an item budget.
fn get_attr_value(r: &mut Reader<'_>) -> Result<AttrValue> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut budget = MAX_TLV_ITEMS;
    loop {
        // A map frame reads its entry key before the value tag.
        if let Some(Frame::Map { pending, .. }) = stack.last_mut() {
            if pending.is_none() {
                *pending = Some(r.get_string()?);
            }
        }
        if budget == 0 {
            return Err(Error::corrupt("attribute item budget exhausted"));
        }
        budget -= 1;

        let tag = r.get_u8()?;
        let mut completed: Option<AttrValue> = match tag {
            TAG_STR => Some(AttrValue::Str(r.get_string()?)),
            TAG_I64 => Some(AttrValue::I64(r.get_i64()?)),
            TAG_F64 => Some(AttrValue::F64(r.get_f64()?)),
            TAG_BOOL => Some(AttrValue::Bool(r.get_u8()? != 0)),
            TAG_BYTES => Some(AttrValue::Bytes(r.get_len_bytes()?.to_vec())),
            TAG_ARRAY => {
                let n = r.get_u32()?;
                r.check_count(n)?;
                if n == 0 {
                    Some(AttrValue::Array(Vec::new()))
                } else {
                    stack.push(Frame::Array {
                        remaining: n,
                        items: Vec::new(),
                    });
                    None
                }
            }
            TAG_MAP => {
                let n = r.get_u32()?;
                r.check_count(n)?;
                if n == 0 {
                    Some(AttrValue::Map(Vec::new()))
                } else {
                    stack.push(Frame::Map {
                        remaining: n,
                        entries: Vec::new(),
                        pending: None,
                    });
                    None
                }
            }
            other => return Err(Error::corrupt(format!("unknown value tag {other}"))),
        };

        // Fold finished values into their parent container, popping frames
        // as containers fill up.
        while let Some(v) = completed.take() {
            let finished = match stack.last_mut() {
                None => return Ok(v),
                Some(Frame::Array { remaining, items }) => {
                    items.push(v);
                    *remaining -= 1;
                    *remaining == 0
                }
                Some(Frame::Map {
                    remaining,
                    entries,
                    pending,
                }) => {
                    let key = pending
                        .take()
                        .ok_or_else(|| Error::corrupt("map value without key"))?;
                    entries.push((key, v));
                    *remaining -= 1;
                    *remaining == 0
                }
            };
            if finished {
                completed = match stack.pop() {
                    Some(Frame::Array { items, .. }) => Some(AttrValue::Array(items)),
                    Some(Frame::Map { entries, .. }) => Some(AttrValue::Map(entries)),
                    None => return Err(Error::corrupt("container stack underrun")),
                };
            }
        }
    }
}

fn put_attr_pairs(dst: &mut BytesMut, pairs: &[(String, AttrValue)]) {
    dst.put_u32_le(pairs.len() as u32);
    for (k, v) in pairs {
        put_str(dst, k);
        put_attr_value(dst, v);
    }
}

fn get_attr_pairs(r: &mut Reader<'_>) -> Result<Vec<(String, AttrValue)>> {
    let n = r.get_u32()?;
    r.check_count(n)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let key = r.get_string()?;
        let value = get_attr_value(r)?;
        out.push((key, value));
    }
    Ok(out)
}

fn put_span_section(dst: &mut BytesMut, span: &SpanRecord) {
    dst.extend_from_slice(span.trace_id.as_bytes());
    dst.extend_from_slice(span.span_id.as_bytes());
    match span.parent_span_id {
        Some(parent) => dst.extend_from_slice(parent.as_bytes()),
        None => dst.extend_from_slice(&[0u8; 8]),
    }
    put_str(dst, &span.name);
    dst.put_u64_le(span.start_unix_nanos);
    dst.put_u64_le(span.end_unix_nanos);
    put_attr_pairs(dst, &span.attributes);
    dst.put_u32_le(span.events.len() as u32);
    for event in &span.events {
        put_str(dst, &event.name);
        dst.put_u64_le(event.time_unix_nanos);
        put_attr_pairs(dst, &event.attributes);
    }
    dst.put_u32_le(span.links.len() as u32);
    for link in &span.links {
        dst.extend_from_slice(link.trace_id.as_bytes());
        dst.extend_from_slice(link.span_id.as_bytes());
        put_attr_pairs(dst, &link.attributes);
    }
    dst.put_u8(span.status.code.as_u8());
    put_str(dst, &span.status.message);
}

fn get_span_section(r: &mut Reader<'_>) -> Result<SpanRecord> {
    let mut trace = [0u8; 16];
    trace.copy_from_slice(r.take(16)?);
    let trace_id = TraceId::new(trace).map_err(|e| Error::corrupt(e.to_string()))?;
    let mut span = [0u8; 8];
    span.copy_from_slice(r.take(8)?);
    let span_id = SpanId::new(span).map_err(|e| Error::corrupt(e.to_string()))?;
    let mut parent = [0u8; 8];
    parent.copy_from_slice(r.take(8)?);
    let parent_span_id = if parent == [0u8; 8] {
        None
    } else {
        Some(SpanId(parent))
    };
    let name = r.get_string()?;
    let start_unix_nanos = r.get_u64()?;
    let end_unix_nanos = r.get_u64()?;
    let attributes = get_attr_pairs(r)?;

    let n_events = r.get_u32()?;
    r.check_count(n_events)?;
    let mut events = Vec::with_capacity(n_events as usize);
    for _ in 0..n_events {
        let name = r.get_string()?;
        let time_unix_nanos = r.get_u64()?;
        let attributes = get_attr_pairs(r)?;
        events.push(SpanEvent {
            name,
            time_unix_nanos,
            attributes,
        });
    }

    let n_links = r.get_u32()?;
    r.check_count(n_links)?;
    let mut links = Vec::with_capacity(n_links as usize);
    for _ in 0..n_links {
        let mut lt = [0u8; 16];
        lt.copy_from_slice(r.take(16)?);
        let mut ls = [0u8; 8];
        ls.copy_from_slice(r.take(8)?);
        let attributes = get_attr_pairs(r)?;
        links.push(SpanLink {
            trace_id: TraceId(lt),
            span_id: SpanId(ls),
            attributes,
        });
    }

    let code = StatusCode::from_u8(r.get_u8()?).map_err(|e| Error::corrupt(e.to_string()))?;
    let message = r.get_string()?;

    Ok(SpanRecord {
        trace_id,
        span_id,
        parent_span_id,
        name,
        start_unix_nanos,
        end_unix_nanos,
        attributes,
        events,
        links,
        status: SpanStatus { code, message },
        resource: Vec::new(),
        scope: ScopeInfo::default(),
    })
}

/// Append one span record (header + sections) to `dst`.
pub fn encode_span(span: &SpanRecord, dst: &mut BytesMut) {
    let mut span_section = BytesMut::new();
    put_span_section(&mut span_section, span);

    let mut resource_section = BytesMut::new();
    if !span.resource.is_empty() {
        put_attr_pairs(&mut resource_section, &span.resource);
    }

    let mut scope_section = BytesMut::new();
    if !span.scope.name.is_empty() || !span.scope.version.is_empty() {
        put_str(&mut scope_section, &span.scope.name);
        put_str(&mut scope_section, &span.scope.version);
    }

    let mut flags = FLAG_SPAN;
    if !resource_section.is_empty() {
        flags |= FLAG_RESOURCE;
    }
    if !scope_section.is_empty() {
        flags |= FLAG_SCOPE;
    }

    dst.extend_from_slice(&MAGIC);
    dst.put_u8(VERSION);
    // Three flag bytes, little-endian.
    dst.extend_from_slice(&flags.to_le_bytes()[..3]);
    dst.put_u32_le(span_section.len() as u32);
    dst.put_u32_le(resource_section.len() as u32);
    dst.put_u32_le(scope_section.len() as u32);
    dst.extend_from_slice(&span_section);
    dst.extend_from_slice(&resource_section);
    dst.extend_from_slice(&scope_section);
}

/// Parse one span record from the reader. Rejects magic/version mismatch and
/// section sizes larger than the remaining payload.
pub fn decode_span(r: &mut Reader<'_>) -> Result<SpanRecord> {
    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(Error::corrupt(format!("bad magic {magic:02x?}")));
    }
    let version = r.get_u8()?;
    if version != VERSION {
        return Err(Error::corrupt(format!("unsupported version {version}")));
    }
    let flag_bytes = r.take(3)?;
    let flags = u32::from_le_bytes([flag_bytes[0], flag_bytes[1], flag_bytes[2], 0]);
    let span_len = r.get_u32()? as usize;
    let resource_len = r.get_u32()? as usize;
    let scope_len = r.get_u32()? as usize;

    let total = span_len
        .checked_add(resource_len)
        .and_then(|n| n.checked_add(scope_len))
        .ok_or_else(|| Error::corrupt("section sizes overflow"))?;
    if total > r.remaining() {
        return Err(Error::corrupt(format!(
            "sections declare {total} bytes, {} remain",
            r.remaining()
        )));
    }
    if flags & FLAG_SPAN == 0 || span_len == 0 {
        return Err(Error::corrupt("span section missing"));
    }

    let mut span_reader = Reader::new(r.take(span_len)?);
    let mut span = get_span_section(&mut span_reader)?;
    if span_reader.remaining() != 0 {
        return Err(Error::corrupt("trailing bytes in span section"));
    }

    if flags & FLAG_RESOURCE != 0 && resource_len > 0 {
        let mut res_reader = Reader::new(r.take(resource_len)?);
        span.resource = get_attr_pairs(&mut res_reader)?;
        if res_reader.remaining() != 0 {
            return Err(Error::corrupt("trailing bytes in resource section"));
        }
    } else {
        r.take(resource_len)?;
    }

    if flags & FLAG_SCOPE != 0 && scope_len > 0 {
        let mut scope_reader = Reader::new(r.take(scope_len)?);
        span.scope = ScopeInfo {
            name: scope_reader.get_string()?,
            version: scope_reader.get_string()?,
        };
        if scope_reader.remaining() != 0 {
            return Err(Error::corrupt("trailing bytes in scope section"));
        }
    } else {
        r.take(scope_len)?;
    }

    Ok(span)
}

/// Serialize a full checkpoint record.
pub fn encode_checkpoint(record: &CheckpointRecord) -> Vec<u8> {
    let mut dst = BytesMut::new();
    dst.put_u32_le(record.reservoir.capacity as u32);
    dst.put_u64_le(record.reservoir.observed);
    dst.put_u64_le(record.reservoir.seed);
    dst.put_i64_le(record.window_id);
    dst.put_u64_le(record.window_start_unix_nanos);
    dst.put_u64_le(record.window_end_unix_nanos);
    dst.put_u64_le(record.rollover_count);
    dst.put_u32_le(record.reservoir.slots.len() as u32);
    for (key, spans) in &record.reservoir.slots {
        let key_bytes = key.to_bytes();
        dst.put_u8(key_bytes.len() as u8);
        dst.extend_from_slice(&key_bytes);
        dst.put_u32_le(spans.len() as u32);
        for span in spans {
            encode_span(span, &mut dst);
        }
    }
    dst.to_vec()
}

/// Parse a full checkpoint record; the inverse of [`encode_checkpoint`].
pub fn decode_checkpoint(bytes: &[u8]) -> Result<CheckpointRecord> {
    let mut r = Reader::new(bytes);
    let capacity = r.get_u32()? as usize;
    let observed = r.get_u64()?;
    let seed = r.get_u64()?;
    let window_id = r.get_i64()?;
    let window_start_unix_nanos = r.get_u64()?;
    let window_end_unix_nanos = r.get_u64()?;
    let rollover_count = r.get_u64()?;
    let slot_count = r.get_u32()?;
    r.check_count(slot_count)?;

    let mut slots = Vec::with_capacity(slot_count as usize);
    for _ in 0..slot_count {
        let key_len = r.get_u8()? as usize;
        let key = SampleKey::from_bytes(r.take(key_len)?)
            .map_err(|e| Error::corrupt(e.to_string()))?;
        let span_count = r.get_u32()?;
        r.check_count(span_count)?;
        let mut spans = Vec::with_capacity(span_count as usize);
        for _ in 0..span_count {
            spans.push(decode_span(&mut r)?);
        }
        slots.push((key, spans));
    }
    if r.remaining() != 0 {
        return Err(Error::corrupt("trailing bytes after checkpoint record"));
    }

    Ok(CheckpointRecord {
        reservoir: ReservoirSnapshot {
            capacity,
            observed,
            seed,
            slots,
        },
        window_id,
        window_start_unix_nanos,
        window_end_unix_nanos,
        rollover_count,
    })
}
