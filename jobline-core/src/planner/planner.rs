//! `GeneratePlan`/`ApplyPlan` workflow and planner state (§4.7).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::forecast::{ForecastModel, Forecaster, MetricsSnapshot};
use crate::planner::anomaly::{self, AnomalyConfig, AnomalyVerdict};
use crate::planner::plan::{CapacityPlan, CostAnalysis, PlanId, ScalingStep};
use crate::queueing::{QueueModel, QueueingCalculator};

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    pub max_step_size: u32,
    pub cooldown: Duration,
    /// Multiplicative headroom applied to the queueing-theory-derived worker count (§4.7 step 6).
    pub safety_margin: f64,
    pub target_utilization: f64,
    pub forecast_model: ForecastModel,
    pub forecast_horizon: usize,
    pub forecast_step: Duration,
    pub history_window: usize,
    pub anomaly: AnomalyConfig,
    pub cost_per_worker_hour: f64,
    pub violation_cost_per_hour: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 100,
            max_step_size: 3,
            cooldown: Duration::from_secs(60),
            safety_margin: 1.15,
            target_utilization: 0.95,
            forecast_model: ForecastModel::Ewma,
            forecast_horizon: 12,
            forecast_step: Duration::from_secs(300),
            history_window: 288,
            anomaly: AnomalyConfig::default(),
            cost_per_worker_hour: 0.10,
            violation_cost_per_hour: 50.0,
        }
    }
}

/// A request to (re)generate a plan (§4.7 step 1 "validate request").
#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub current_workers: u32,
    pub target_latency: Duration,
    /// Per-worker service rate (jobs/sec), i.e. `mu` in §4.5.
    pub service_rate: f64,
    /// Coefficient of variation squared of service time; `1.0` reduces to pure M/M/c.
    pub service_cv_squared: f64,
    pub current_metrics: MetricsSnapshot,
    pub force_regen: bool,
}

impl PlanRequest {
    fn validate(&self) -> Result<()> {
        if self.service_rate <= 0.0 {
            return Err(QueueError::InvalidInput("service_rate must be positive".into()));
        }
        if self.target_latency.is_zero() {
            return Err(QueueError::InvalidInput("target_latency must be positive".into()));
        }
        if self.current_metrics.arrival_rate < 0.0 {
            return Err(QueueError::InvalidInput("arrival_rate must be non-negative".into()));
        }
        Ok(())
    }
}

/// `GeneratePlan`/`ApplyPlan`/`SimulateWhatIf` owner (§4.7). Holds the cooldown window, last
/// plan, anomaly state, and a bounded ring of recent metrics — all the state the spec calls out
/// explicitly rather than deriving from an external store.
pub struct CapacityPlanner {
    config: PlannerConfig,
    cooldown_until: Option<DateTime<Utc>>,
    last_plan: Option<CapacityPlan>,
    last_anomaly: Option<AnomalyVerdict>,
    recent_history: VecDeque<MetricsSnapshot>,
    /// Bumped on every config change; plans embed it implicitly by virtue of being generated
    /// under a particular config, letting callers detect a stale plan against a live planner.
    config_version: u64,
}

impl CapacityPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            cooldown_until: None,
            last_plan: None,
            last_anomaly: None,
            recent_history: VecDeque::new(),
            config_version: 0,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    pub fn update_config(&mut self, config: PlannerConfig) {
        self.config = config;
        self.config_version += 1;
    }

    pub fn last_plan(&self) -> Option<&CapacityPlan> {
        self.last_plan.as_ref()
    }

    pub fn last_anomaly(&self) -> Option<&AnomalyVerdict> {
        self.last_anomaly.as_ref()
    }

    pub fn recent_history(&self) -> &VecDeque<MetricsSnapshot> {
        &self.recent_history
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now <= until)
    }

    /// §4.7's workflow, steps 1 through 9.
    pub fn generate_plan(&mut self, request: PlanRequest) -> Result<CapacityPlan> {
        let now = request.current_metrics.timestamp;
        request.validate()?;

        if !request.force_regen && self.in_cooldown(now) {
            let retry_after = self
                .cooldown_until
                .map(|until| (until - now).num_seconds().max(0) as u64)
                .unwrap_or(0);
            return Err(QueueError::CooldownActive {
                retry_after_secs: retry_after,
            });
        }

        let verdict = anomaly::detect(
            self.recent_history.make_contiguous(),
            &request.current_metrics,
            self.config.anomaly,
        );
        self.last_anomaly = Some(verdict.clone());
        if verdict.anomalous {
            return Err(QueueError::AnomalyDetected(
                verdict.reason.unwrap_or_else(|| "anomalous metrics".into()),
            ));
        }

        self.recent_history.push_back(request.current_metrics);
        while self.recent_history.len() > self.config.history_window {
            self.recent_history.pop_front();
        }

        let history: Vec<MetricsSnapshot> = self.recent_history.iter().copied().collect();
        let forecast = Forecaster::forecast(
            self.config.forecast_model,
            &history,
            self.config.forecast_horizon,
            ChronoDuration::from_std(self.config.forecast_step).unwrap_or(ChronoDuration::seconds(300)),
        );
        let peak_lambda = forecast
            .iter()
            .map(|p| p.arrival_rate)
            .fold(request.current_metrics.arrival_rate, f64::max);
        let forecast_confidence = forecast
            .iter()
            .map(|p| p.confidence)
            .fold(1.0_f64, f64::min);

        let (target_workers, confidence, slo_achievable) = self.required_capacity(
            peak_lambda,
            request.service_rate,
            request.service_cv_squared,
            request.target_latency,
            forecast_confidence,
        );

        let steps = self.build_steps(request.current_workers, target_workers, now);
        let cost = self.cost_impact(request.current_workers, target_workers, confidence);

        let mut recommendations = Vec::new();
        let mut warnings = Vec::new();
        if target_workers == self.config.max_workers {
            warnings.push("target worker count is pinned at the configured maximum".to_string());
        }
        if target_workers == self.config.min_workers && target_workers < request.current_workers {
            warnings.push("target worker count is pinned at the configured minimum".to_string());
        }
        if confidence < 0.5 {
            warnings.push(format!("low forecast confidence ({confidence:.2})"));
        }
        if steps.len() > 3 {
            warnings.push(format!("plan requires {} scaling steps", steps.len()));
        }
        if !slo_achievable {
            recommendations.push("no worker count within the configured maximum meets the SLO at peak forecast load; consider raising max_workers".to_string());
        } else if target_workers > request.current_workers {
            recommendations.push(format!("scale up to {target_workers} workers ahead of forecasted peak load"));
        } else if target_workers < request.current_workers {
            recommendations.push(format!("scale down to {target_workers} workers; forecast shows sustained headroom"));
        } else {
            recommendations.push("current worker count already meets forecasted demand".to_string());
        }

        let plan = CapacityPlan {
            id: PlanId::new(),
            generated_at: now,
            current_workers: request.current_workers,
            target_workers,
            steps,
            valid_until: now + ChronoDuration::from_std(self.config.forecast_step * self.config.forecast_horizon as u32)
                .unwrap_or(ChronoDuration::hours(1)),
            confidence,
            slo_achievable,
            cost,
            recommendations,
            warnings,
        };

        self.last_plan = Some(plan.clone());
        Ok(plan)
    }

    /// Records that `plan_id` was applied, extending the cooldown window from `now`. The actual
    /// scaling action (talking to an orchestrator) is delegated externally per §4.7's design
    /// note — this only updates planner-local bookkeeping.
    pub fn apply_plan(&mut self, plan_id: PlanId, now: DateTime<Utc>) -> Result<()> {
        match &self.last_plan {
            Some(plan) if plan.id == plan_id => {}
            Some(_) | None => {
                return Err(QueueError::NotFound(format!("plan {plan_id} is not the active plan")));
            }
        }
        self.cooldown_until = Some(now + ChronoDuration::from_std(self.config.cooldown).unwrap_or(ChronoDuration::zero()));
        Ok(())
    }

    /// Smallest worker count meeting both the SLO latency and the target utilization ceiling at
    /// `lambda`, capped at `max_workers` (§4.7 step 6).
    fn required_capacity(
        &self,
        lambda: f64,
        mu: f64,
        service_cv_squared: f64,
        target_latency: Duration,
        forecast_confidence: f64,
    ) -> (u32, f64, bool) {
        let mut found = None;
        for servers in 1..=self.config.max_workers.max(1) {
            let result = QueueingCalculator::evaluate(
                QueueModel::MGC {
                    servers,
                    service_cv_squared,
                },
                lambda,
                mu,
            );
            if result.stable
                && result.utilization <= self.config.target_utilization
                && result.mean_wait_in_system <= target_latency
            {
                found = Some((servers, result.confidence));
                break;
            }
        }

        let (raw_servers, queueing_confidence, slo_achievable) = match found {
            Some((servers, confidence)) => (servers, confidence, true),
            None => (self.config.max_workers.max(1), 0.2, false),
        };

        let with_margin = ((raw_servers as f64) * self.config.safety_margin).ceil() as u32;
        let clamped = with_margin.clamp(self.config.min_workers.max(1), self.config.max_workers.max(1));
        let combined_confidence = (queueing_confidence * forecast_confidence).clamp(0.1, 1.0);
        (clamped, combined_confidence, slo_achievable)
    }

    /// Builds the step sequence (§4.7 step 7): one step if `|Δ| ≤ max_step_size`, otherwise
    /// `ceil(|Δ| / max_step_size)` steps spaced one cooldown apart, with the last step absorbing
    /// any rounding residue.
    fn build_steps(&self, current: u32, target: u32, now: DateTime<Utc>) -> Vec<ScalingStep> {
        let delta = target as i64 - current as i64;
        if delta == 0 {
            return Vec::new();
        }

        let max_step = self.config.max_step_size.max(1) as i64;
        let magnitude = delta.abs();
        let step_count = if magnitude <= max_step {
            1
        } else {
            magnitude.div_ceil(max_step)
        };

        let cooldown = ChronoDuration::from_std(self.config.cooldown).unwrap_or(ChronoDuration::seconds(60));
        let direction = delta.signum();
        let mut steps = Vec::with_capacity(step_count as usize);
        let mut from = current as i64;
        let mut remaining = magnitude;

        for i in 0..step_count {
            let this_step = if i == step_count - 1 {
                remaining
            } else {
                max_step.min(remaining)
            };
            let to = from + direction * this_step;
            let scheduled_at = now + cooldown * i as i32;
            steps.push(ScalingStep {
                scheduled_at,
                from_workers: from as u32,
                to_workers: to as u32,
                rationale: if direction > 0 {
                    "forecasted demand exceeds current capacity".to_string()
                } else {
                    "forecasted demand sustained below current capacity".to_string()
                },
                confidence: 0.8,
                cooldown_until: scheduled_at + cooldown,
            });
            remaining -= this_step;
            from = to;
        }

        steps
    }

    fn cost_impact(&self, current: u32, target: u32, confidence: f64) -> CostAnalysis {
        let current_cost = current as f64 * self.config.cost_per_worker_hour;
        let projected_cost = target as f64 * self.config.cost_per_worker_hour;
        let delta = projected_cost - current_cost;
        let monthly_delta = delta * 24.0 * 30.0;

        // Scaling up avoids violation cost proportional to how much headroom it adds; scaling
        // down (or holding) has no avoided-violation benefit to weigh against its savings.
        let avoided_violation_cost = if target > current {
            self.config.violation_cost_per_hour * confidence * (target - current) as f64
        } else {
            0.0
        };

        let payback_period_hours = if delta > 0.0 && avoided_violation_cost > 0.0 {
            Some(delta / avoided_violation_cost * 24.0)
        } else {
            None
        };

        CostAnalysis {
            current_cost_per_hour: current_cost,
            projected_cost_per_hour: projected_cost,
            delta_per_hour: delta,
            monthly_delta,
            risk_adjusted_violation_cost: avoided_violation_cost,
            payback_period_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(now: DateTime<Utc>, rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: now,
            arrival_rate: rate,
            service_rate: 2.0,
            service_time_mean: 0.5,
            service_time_stddev: 0.1,
            backlog: 10,
            worker_count: 5,
            utilization: 0.7,
        }
    }

    #[test]
    fn cooldown_blocks_regeneration_unless_forced() {
        let mut planner = CapacityPlanner::new(PlannerConfig::default());
        let now = Utc::now();
        let request = PlanRequest {
            current_workers: 5,
            target_latency: Duration::from_secs(2),
            service_rate: 2.0,
            service_cv_squared: 1.0,
            current_metrics: metrics(now, 8.0),
            force_regen: false,
        };
        let plan = planner.generate_plan(request.clone()).unwrap();
        planner.apply_plan(plan.id, now).unwrap();

        let mut second = request.clone();
        second.current_metrics.timestamp = now + ChronoDuration::seconds(1);
        let err = planner.generate_plan(second).unwrap_err();
        assert!(matches!(err, QueueError::CooldownActive { .. }));
    }

    #[test]
    fn step_deltas_sum_to_target_minus_current() {
        let mut planner = CapacityPlanner::new(PlannerConfig {
            max_step_size: 3,
            cooldown: Duration::from_secs(60),
            ..PlannerConfig::default()
        });
        let now = Utc::now();
        let request = PlanRequest {
            current_workers: 5,
            target_latency: Duration::from_millis(50),
            service_rate: 2.0,
            service_cv_squared: 1.0,
            current_metrics: metrics(now, 20.0),
            force_regen: true,
        };
        let plan = planner.generate_plan(request).unwrap();
        assert_eq!(plan.total_delta(), plan.target_workers as i64 - plan.current_workers as i64);
        for step in &plan.steps {
            assert!(step.cooldown_until > step.scheduled_at);
        }
        if plan.steps.len() > 1 {
            for w in plan.steps.windows(2) {
                assert!(w[1].scheduled_at >= w[0].scheduled_at);
            }
        }
    }

    #[test]
    fn anomalous_metrics_are_rejected_without_a_plan() {
        let mut planner = CapacityPlanner::new(PlannerConfig::default());
        let now = Utc::now();
        for i in 0..10 {
            let mut h = metrics(now - ChronoDuration::minutes(10 - i), 10.0);
            h.timestamp = now - ChronoDuration::minutes(10 - i);
            planner.recent_history.push_back(h);
        }
        let request = PlanRequest {
            current_workers: 5,
            target_latency: Duration::from_secs(2),
            service_rate: 2.0,
            service_cv_squared: 1.0,
            current_metrics: metrics(now, 500.0),
            force_regen: true,
        };
        let err = planner.generate_plan(request).unwrap_err();
        assert!(matches!(err, QueueError::AnomalyDetected(_)));
    }
}
