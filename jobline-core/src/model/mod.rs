//! Wire types shared by every component: job envelopes, identifiers, priorities, and trace
//! context carriers (§3, §6).

pub mod ids;
pub mod job;
pub mod priority;
pub mod trace;

pub use ids::{JobId, ReservationId};
pub use job::{JobEnvelope, PayloadRef};
pub use priority::Priority;
pub use trace::{SpanId, TraceContext, TraceId};
