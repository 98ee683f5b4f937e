use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::model::ids::JobId;
use crate::model::priority::Priority;
use crate::model::trace::{SpanId, TraceContext, TraceId};

/// A reference to the job's actual payload. The envelope never embeds the payload bytes
/// themselves (§3: "payload interpretation is the consumer's responsibility") — it only carries
/// a locator plus a declared size so the runtime can enforce size limits without reading the
/// payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Opaque locator for the payload (content-addressed key, object-store URI, inline blob id).
    /// Named `file_path` to match the wire contract in §6, even though nothing requires the
    /// referent to be a filesystem path.
    pub file_path: String,
    pub file_size: u64,
}

impl PayloadRef {
    pub fn new(locator: impl Into<String>, size: u64) -> Self {
        Self {
            file_path: locator.into(),
            file_size: size,
        }
    }
}

mod hex_or_empty {
    use super::{SpanId, TraceId};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub trait HexId: Sized {
        fn to_hex(&self) -> String;
        fn from_hex(s: &str) -> Option<Self>;
    }

    impl HexId for TraceId {
        fn to_hex(&self) -> String {
            self.to_string()
        }
        fn from_hex(s: &str) -> Option<Self> {
            TraceId::parse(s).ok()
        }
    }

    impl HexId for SpanId {
        fn to_hex(&self) -> String {
            self.to_string()
        }
        fn from_hex(s: &str) -> Option<Self> {
            SpanId::parse(s).ok()
        }
    }

    pub fn serialize<S, T: HexId>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => v.to_hex().serialize(serializer),
            None => "".serialize(serializer),
        }
    }

    pub fn deserialize<'de, D, T: HexId>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            Ok(None)
        } else {
            Ok(T::from_hex(&raw))
        }
    }
}

/// The unit of work carried end-to-end through queue, processing list, and DLQ.
///
/// Field names on the wire follow §6 exactly (`file_path`/`file_size` for the payload
/// descriptor, `creation_time` for the timestamp) so producers and consumers speaking the JSON
/// contract directly stay interoperable with anything else implementing the same wire format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    #[serde(flatten)]
    pub payload: PayloadRef,
    pub priority: Priority,
    pub retries: u32,
    pub creation_time: DateTime<Utc>,
    #[serde(with = "hex_or_empty", default)]
    pub trace_id: Option<TraceId>,
    #[serde(with = "hex_or_empty", default)]
    pub span_id: Option<SpanId>,
    /// Idempotency reservation key this envelope was admitted under, if any. Not part of the
    /// public wire contract in §6 (it is consumed internally by Ack/Nack) but travels with the
    /// envelope so completion can Confirm/Release the right key.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub idempotency_key: Option<String>,
}

impl JobEnvelope {
    pub fn new(payload: PayloadRef, priority: Priority) -> Self {
        Self {
            id: JobId::new(),
            payload,
            priority,
            retries: 0,
            creation_time: Utc::now(),
            trace_id: None,
            span_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_trace(mut self, ctx: TraceContext) -> Self {
        self.trace_id = ctx.trace_id;
        self.span_id = ctx.span_id;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
        }
    }

    /// Checks the invariants in §3: non-empty id (enforced at construction via [`JobId`]),
    /// parseable timestamp (enforced by the type system), and trace fields both-or-neither.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(QueueError::InvalidInput("job id must not be empty".into()));
        }
        if self.trace_id.is_some() != self.span_id.is_some() {
            return Err(QueueError::InvalidInput(
                "trace_id and span_id must be both present or both absent".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip_is_bit_for_bit_on_reparse() {
        let env = JobEnvelope::new(PayloadRef::new("s3://bucket/key", 42), Priority::High)
            .with_trace(TraceContext::new_root());
        let json = serde_json::to_string(&env).unwrap();
        let back: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env.id, back.id);
        assert_eq!(env.payload.file_path, back.payload.file_path);
        assert_eq!(env.payload.file_size, back.payload.file_size);
        assert_eq!(env.priority, back.priority);
        assert_eq!(env.trace_id, back.trace_id);
        assert_eq!(env.span_id, back.span_id);
    }

    #[test]
    fn empty_trace_fields_serialize_as_empty_strings() {
        let env = JobEnvelope::new(PayloadRef::new("x", 0), Priority::Low);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["trace_id"], "");
        assert_eq!(json["span_id"], "");
    }

    #[test]
    fn validate_rejects_half_set_trace_context() {
        let mut env = JobEnvelope::new(PayloadRef::new("x", 0), Priority::Low);
        env.trace_id = Some(TraceId::generate());
        env.span_id = None;
        assert!(env.validate().is_err());
    }
}
