//! Redis-backed queue runtime: storage port, priority selection, backoff, rate limiting,
//! reaping, and the orchestrating [`runtime::QueueRuntime`] (§4.1, §4.3).

pub mod backoff;
pub mod priority;
pub mod rate_limit;
pub mod reaper;
pub mod runtime;
pub mod store;

pub use priority::{PrioritySelector, QueueSet};
pub use rate_limit::TokenBucket;
pub use reaper::{Reaper, ReaperConfig, WatchedLease};
pub use runtime::{Lease, NackDisposition, QueueRuntime, RuntimeConfig};
pub use store::{QueueStore, RedisQueueStore};
