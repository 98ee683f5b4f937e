//! `SimulateWhatIf`: a discrete-time simulator driven by a plain-data scenario (§4.7, §9
//! "planner ↔ simulator" design note — message passing, no back-reference to the planner).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Shape of a spiky traffic burst (§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpikeShape {
    Instant,
    Linear,
    Exponential,
    Bell,
}

/// Arrival-rate pattern driving the simulation (§4.7).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrafficPattern {
    Constant,
    Sinusoidal { amplitude: f64, period: Duration },
    Daily,
    Spiky { shape: SpikeShape, magnitude: f64, at_tick: usize },
}

/// A plain-data copy of the inputs the simulator needs — never a back-reference to the live
/// planner, per the planner/simulator message-passing design note.
#[derive(Clone, Debug)]
pub struct WhatIfScenario {
    pub base_arrival_rate: f64,
    pub service_rate: f64,
    pub starting_workers: u32,
    pub pattern: TrafficPattern,
    pub granularity: Duration,
    pub duration: Duration,
    pub slo_override: Option<Duration>,
    pub start: DateTime<Utc>,
    /// Deterministic seed for the Poisson-ish arrival/service noise.
    pub seed: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SimTick {
    pub timestamp: DateTime<Utc>,
    pub arrival_rate: f64,
    pub workers: u32,
    pub backlog: f64,
    pub latency: Duration,
    pub slo_met: bool,
}

#[derive(Clone, Debug)]
pub struct ViolationPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SimulationSummary {
    pub average_latency: Duration,
    pub max_latency: Duration,
    pub p95_latency: Duration,
    pub slo_achievement_rate: f64,
    pub violation_periods: Vec<ViolationPeriod>,
    pub total_cost: f64,
}

#[derive(Clone, Debug)]
pub struct SimulationResult {
    pub timeline: Vec<SimTick>,
    pub summary: SimulationSummary,
}

pub struct Simulator;

impl Simulator {
    /// Runs `scenario` tick by tick: evolves backlog (arrivals minus served capacity, with
    /// Poisson-like variation on both), derives latency from Little's Law (`W = L/λ`), checks
    /// SLO compliance, and accumulates contiguous violation periods and cost.
    pub fn run(scenario: &WhatIfScenario, cost_per_worker_hour: f64) -> SimulationResult {
        let ticks = (scenario.duration.as_secs_f64() / scenario.granularity.as_secs_f64().max(0.001))
            .ceil()
            .max(1.0) as usize;
        let slo = scenario.slo_override.unwrap_or(Duration::from_secs(2));
        let dt = scenario.granularity.as_secs_f64();

        let mut rng = StdRng::seed_from_u64(scenario.seed);
        let mut backlog = 0.0_f64;
        let mut timeline = Vec::with_capacity(ticks);
        let mut violation_periods = Vec::new();
        let mut open_violation: Option<DateTime<Utc>> = None;
        let mut total_cost = 0.0;

        for i in 0..ticks {
            let timestamp = scenario.start + scenario.granularity * i as i32;
            let lambda = arrival_rate_at(scenario, i, ticks);

            let arrivals = poisson_ish(&mut rng, lambda * dt);
            let capacity = scenario.starting_workers as f64 * scenario.service_rate * dt;
            let served = poisson_ish(&mut rng, capacity.min(backlog + arrivals));

            backlog = (backlog + arrivals - served).max(0.0);

            // Little's Law: W = L / λ. Guard against λ≈0 (empty system ⇒ zero wait).
            let latency_secs = if lambda > f64::EPSILON {
                backlog / lambda
            } else {
                0.0
            };
            let latency = Duration::from_secs_f64(latency_secs.max(0.0));
            let slo_met = latency <= slo;

            match (slo_met, open_violation) {
                (false, None) => open_violation = Some(timestamp),
                (true, Some(start)) => {
                    violation_periods.push(ViolationPeriod { start, end: timestamp });
                    open_violation = None;
                }
                _ => {}
            }

            total_cost += scenario.starting_workers as f64 * cost_per_worker_hour * (dt / 3600.0);

            timeline.push(SimTick {
                timestamp,
                arrival_rate: lambda,
                workers: scenario.starting_workers,
                backlog,
                latency,
                slo_met,
            });
        }

        if let Some(start) = open_violation {
            let end = timeline.last().map(|t| t.timestamp).unwrap_or(start);
            violation_periods.push(ViolationPeriod { start, end });
        }

        let summary = summarize(&timeline, &violation_periods, total_cost);
        SimulationResult { timeline, summary }
    }
}

fn arrival_rate_at(scenario: &WhatIfScenario, tick: usize, total_ticks: usize) -> f64 {
    let base = scenario.base_arrival_rate;
    match scenario.pattern {
        TrafficPattern::Constant => base,
        TrafficPattern::Sinusoidal { amplitude, period } => {
            let t = tick as f64 * scenario.granularity.as_secs_f64();
            let omega = std::f64::consts::TAU / period.as_secs_f64().max(1.0);
            (base + amplitude * (omega * t).sin()).max(0.0)
        }
        TrafficPattern::Daily => {
            let hour_of_day = (tick as f64 * scenario.granularity.as_secs_f64() / 3600.0) % 24.0;
            let factor = 1.0 + 0.5 * (std::f64::consts::TAU * (hour_of_day - 14.0) / 24.0).cos();
            (base * factor).max(0.0)
        }
        TrafficPattern::Spiky { shape, magnitude, at_tick } => {
            let distance = tick as i64 - at_tick as i64;
            let envelope = match shape {
                SpikeShape::Instant => {
                    if distance == 0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                SpikeShape::Linear => {
                    let width = (total_ticks / 10).max(1) as f64;
                    (1.0 - distance.unsigned_abs() as f64 / width).max(0.0)
                }
                SpikeShape::Exponential => {
                    if distance < 0 {
                        0.0
                    } else {
                        let decay = (total_ticks / 20).max(1) as f64;
                        (-distance as f64 / decay).exp()
                    }
                }
                SpikeShape::Bell => {
                    let width = (total_ticks / 15).max(1) as f64;
                    (-0.5 * (distance as f64 / width).powi(2)).exp()
                }
            };
            (base + magnitude * envelope).max(0.0)
        }
    }
}

/// Normal approximation to a Poisson draw (valid for the backlog/throughput magnitudes this
/// simulator deals with): `round(max(0, mean + sqrt(mean) * z))` with `z` from Box-Muller.
fn poisson_ish(rng: &mut StdRng, mean: f64) -> f64 {
    if mean <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    (mean + mean.sqrt() * z).max(0.0)
}

fn summarize(timeline: &[SimTick], violations: &[ViolationPeriod], total_cost: f64) -> SimulationSummary {
    if timeline.is_empty() {
        return SimulationSummary {
            average_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            p95_latency: Duration::ZERO,
            slo_achievement_rate: 1.0,
            violation_periods: violations.to_vec(),
            total_cost,
        };
    }

    let mut latencies: Vec<Duration> = timeline.iter().map(|t| t.latency).collect();
    latencies.sort();

    let total_secs: f64 = latencies.iter().map(|d| d.as_secs_f64()).sum();
    let average = Duration::from_secs_f64(total_secs / latencies.len() as f64);
    let max = *latencies.last().unwrap();
    let p95_idx = ((latencies.len() as f64 * 0.95).ceil() as usize).saturating_sub(1).min(latencies.len() - 1);
    let p95 = latencies[p95_idx];

    let met = timeline.iter().filter(|t| t.slo_met).count();
    let achievement_rate = met as f64 / timeline.len() as f64;

    SimulationSummary {
        average_latency: average,
        max_latency: max,
        p95_latency: p95,
        slo_achievement_rate: achievement_rate,
        violation_periods: violations.to_vec(),
        total_cost,
    }
}
