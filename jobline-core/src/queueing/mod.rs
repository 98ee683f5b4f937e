//! Queueing-theory closed forms feeding the capacity planner (§4.5).

mod calculator;

pub use calculator::{CapacityResult, QueueModel, QueueingCalculator, QueueingResult};
