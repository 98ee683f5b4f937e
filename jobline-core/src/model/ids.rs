use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Stable job identifier. A `String` rather than a bare `Uuid` because the envelope's wire
/// contract (§6) treats it as an opaque stable string — producers are free to mint their own.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Mints a fresh, time-ordered identifier (UUIDv7 so lexical and creation order agree).
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates and wraps a caller-supplied identifier. Empty identifiers violate the job
    /// envelope invariant in §3.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(QueueError::InvalidInput(
                "job id must not be empty".into(),
            ));
        }
        Ok(Self(raw))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by `Dequeue`, binding a leased envelope to the processing-list key it now
/// lives on so `Ack`/`Nack` know exactly which list entry to remove.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
