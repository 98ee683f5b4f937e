//! Trace-context carriers stamped onto every job envelope (§4.8, §6).
//!
//! These are deliberately independent of any particular tracing backend: the envelope only
//! needs to carry lower-hex trace/span identifiers of the expected width so a consumer can
//! re-root a span as a child of the producer's span. [`crate::observability::tracing`] is what
//! actually talks to `tracing`/OpenTelemetry.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QueueError, Result};

const TRACE_ID_HEX_LEN: usize = 32;
const SPAN_ID_HEX_LEN: usize = 16;

fn is_lower_hex(s: &str, expected_len: usize) -> bool {
    s.len() == expected_len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// 128-bit trace identifier, canonical lower-hex, 32 characters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn parse(hex: &str) -> Result<Self> {
        if !is_lower_hex(hex, TRACE_ID_HEX_LEN) {
            return Err(QueueError::InvalidInput(format!(
                "invalid trace_id: {hex}"
            )));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| QueueError::InvalidInput(format!("invalid trace_id: {hex}")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// 64-bit span identifier, canonical lower-hex, 16 characters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn parse(hex: &str) -> Result<Self> {
        if !is_lower_hex(hex, SPAN_ID_HEX_LEN) {
            return Err(QueueError::InvalidInput(format!(
                "invalid span_id: {hex}"
            )));
        }
        let mut bytes = [0u8; 8];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| QueueError::InvalidInput(format!("invalid span_id: {hex}")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Either both fields are present and valid, or both are absent — the envelope invariant in §3.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
}

impl TraceContext {
    pub fn none() -> Self {
        Self::default()
    }

    /// Roots a fresh trace with a fresh span — the producer side of a new, untraced enqueue.
    pub fn new_root() -> Self {
        Self {
            trace_id: Some(TraceId::generate()),
            span_id: Some(SpanId::generate()),
        }
    }

    /// A child span within the same trace, as adopted by a dequeue re-rooting its own span.
    pub fn child_span(self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Some(SpanId::generate()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_some() == self.span_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let ctx = TraceContext::new_root();
        let trace_hex = ctx.trace_id.unwrap().to_string();
        let span_hex = ctx.span_id.unwrap().to_string();
        assert_eq!(trace_hex.len(), 32);
        assert_eq!(span_hex.len(), 16);
        assert_eq!(TraceId::parse(&trace_hex).unwrap(), ctx.trace_id.unwrap());
        assert_eq!(SpanId::parse(&span_hex).unwrap(), ctx.span_id.unwrap());
    }

    #[test]
    fn rejects_wrong_width_or_case() {
        assert!(TraceId::parse("deadBEEF").is_err());
        assert!(SpanId::parse("00").is_err());
    }

    #[test]
    fn child_span_keeps_trace_changes_span() {
        let root = TraceContext::new_root();
        let child = root.child_span();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn both_present_or_both_absent() {
        assert!(TraceContext::none().is_valid());
        assert!(TraceContext::new_root().is_valid());
        let half = TraceContext {
            trace_id: Some(TraceId::generate()),
            span_id: None,
        };
        assert!(!half.is_valid());
    }
}
