//! Capacity-plan artifacts (§3 "Capacity plan", §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a generated [`CapacityPlan`] for a later [`super::planner::CapacityPlanner::apply_plan`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One scaling step of a multi-step plan (§4.7 step 7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScalingStep {
    pub scheduled_at: DateTime<Utc>,
    pub from_workers: u32,
    pub to_workers: u32,
    pub rationale: String,
    pub confidence: f64,
    pub cooldown_until: DateTime<Utc>,
}

/// Cost impact of applying a plan (§4.7 step 8).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub current_cost_per_hour: f64,
    pub projected_cost_per_hour: f64,
    pub delta_per_hour: f64,
    pub monthly_delta: f64,
    /// Expected cost of SLO violations avoided/incurred by the change, discounted by how likely
    /// the forecast is to be right (the plan's own confidence score).
    pub risk_adjusted_violation_cost: f64,
    /// Hours until the avoided violation cost offsets the added compute cost; `None` when the
    /// change has no added cost to pay back (scale-down, or zero delta).
    pub payback_period_hours: Option<f64>,
}

/// An artifact produced by [`super::planner::CapacityPlanner::generate_plan`] (§3, §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub id: PlanId,
    pub generated_at: DateTime<Utc>,
    pub current_workers: u32,
    pub target_workers: u32,
    pub steps: Vec<ScalingStep>,
    pub valid_until: DateTime<Utc>,
    pub confidence: f64,
    pub slo_achievable: bool,
    pub cost: CostAnalysis,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
}

impl CapacityPlan {
    /// Σ deltas across steps must equal `target - current` (§8 testable property).
    pub fn total_delta(&self) -> i64 {
        self.steps
            .iter()
            .map(|s| s.to_workers as i64 - s.from_workers as i64)
            .sum()
    }
}
