//! Automatic capacity planner: forecast-driven `GeneratePlan`/`ApplyPlan`, anomaly gating, and a
//! discrete-time `SimulateWhatIf` (§4.7).

mod anomaly;
#[allow(clippy::module_inception)]
mod planner;
mod plan;
mod simulator;

pub use anomaly::{AnomalyConfig, AnomalyVerdict};
pub use plan::{CapacityPlan, CostAnalysis, PlanId, ScalingStep};
pub use planner::{CapacityPlanner, PlanRequest, PlannerConfig};
pub use simulator::{
    SimTick, SimulationResult, SimulationSummary, Simulator, SpikeShape, TrafficPattern, ViolationPeriod,
    WhatIfScenario,
};
