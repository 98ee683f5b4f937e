//! M/M/1, M/M/c (Erlang-C), and M/G/c (Pollaczek-Khinchin corrected) closed forms (§4.5).

use std::time::Duration;

/// Which closed form to evaluate. `MGC` carries the squared coefficient of variation of the
/// service-time distribution (`Cs²`); `1.0` reduces the correction to the M/M/c value exactly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QueueModel {
    MM1,
    MMC { servers: u32 },
    MGC { servers: u32, service_cv_squared: f64 },
}

/// A single evaluation of arrival rate `lambda` against service rate `mu` under `model`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueueingResult {
    pub utilization: f64,
    pub mean_queue_length: f64,
    pub mean_wait_in_queue: Duration,
    pub mean_wait_in_system: Duration,
    pub stable: bool,
    pub confidence: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapacityResult {
    pub servers: u32,
    pub result: QueueingResult,
    pub met_target: bool,
}

pub struct QueueingCalculator;

impl QueueingCalculator {
    /// Evaluates `model` at arrival rate `lambda` (jobs/sec) and service rate `mu` (jobs/sec per
    /// server). `ρ ≥ 1` is unstable: infinite wait/queue, utilization pinned at 1.0, confidence
    /// zero — per §4.5's explicit edge case.
    pub fn evaluate(model: QueueModel, lambda: f64, mu: f64) -> QueueingResult {
        match model {
            QueueModel::MM1 => Self::mm1(lambda, mu),
            QueueModel::MMC { servers } => Self::mmc(lambda, mu, servers),
            QueueModel::MGC {
                servers,
                service_cv_squared,
            } => Self::mgc(lambda, mu, servers, service_cv_squared),
        }
    }

    fn mm1(lambda: f64, mu: f64) -> QueueingResult {
        Self::mmc(lambda, mu, 1)
    }

    fn mmc(lambda: f64, mu: f64, servers: u32) -> QueueingResult {
        let c = servers.max(1) as f64;
        let rho = lambda / (c * mu);

        if rho >= 1.0 || !rho.is_finite() {
            return QueueingResult {
                utilization: 1.0,
                mean_queue_length: f64::INFINITY,
                mean_wait_in_queue: Duration::MAX,
                mean_wait_in_system: Duration::MAX,
                stable: false,
                confidence: 0.0,
            };
        }

        let c_usize = servers.max(1) as usize;
        // Memoized factorials 0..=c, computed once and reused by every term of the Erlang-C sum.
        let mut factorial = vec![1.0_f64; c_usize + 1];
        for k in 1..=c_usize {
            factorial[k] = factorial[k - 1] * k as f64;
        }

        let offered_load = c * rho; // = lambda / mu
        let mut sum_terms = 0.0;
        for k in 0..c_usize {
            sum_terms += offered_load.powi(k as i32) / factorial[k];
        }
        let erlang_term = offered_load.powi(c_usize as i32) / (factorial[c_usize] * (1.0 - rho));
        let p0 = 1.0 / (sum_terms + erlang_term);

        let lq = p0 * offered_load.powi(c_usize as i32) * rho / (factorial[c_usize] * (1.0 - rho).powi(2));
        let wq = lq / lambda;
        let w = wq + 1.0 / mu;

        QueueingResult {
            utilization: rho,
            mean_queue_length: lq,
            mean_wait_in_queue: Duration::from_secs_f64(wq.max(0.0)),
            mean_wait_in_system: Duration::from_secs_f64(w.max(0.0)),
            stable: true,
            confidence: confidence_for(rho, servers),
        }
    }

    fn mgc(lambda: f64, mu: f64, servers: u32, service_cv_squared: f64) -> QueueingResult {
        let base = Self::mmc(lambda, mu, servers);
        if !base.stable {
            return base;
        }
        // Pollaczek-Khinchin correction: Wq_MGC ≈ ((Cs²+1)/2) · Wq_MMC.
        let correction = (service_cv_squared.max(0.0) + 1.0) / 2.0;
        let wq = base.mean_wait_in_queue.as_secs_f64() * correction;
        let w = wq + 1.0 / mu;
        let lq = wq * lambda;

        QueueingResult {
            utilization: base.utilization,
            mean_queue_length: lq,
            mean_wait_in_queue: Duration::from_secs_f64(wq.max(0.0)),
            mean_wait_in_system: Duration::from_secs_f64(w.max(0.0)),
            stable: true,
            // M/G/c is an approximation of an approximation: shade confidence down a little
            // further from the M/M/c baseline, more so the further Cs² sits from 1 (exponential).
            confidence: (base.confidence * (1.0 - (service_cv_squared - 1.0).abs() * 0.1)).clamp(0.1, 1.0),
        }
    }

    /// Linear search for the smallest server count meeting `target_latency`, starting at `c=1`
    /// up to `max_servers` (the safety ceiling).
    pub fn calculate_capacity(
        model_at: impl Fn(u32) -> QueueModel,
        lambda: f64,
        mu: f64,
        target_latency: Duration,
        max_servers: u32,
    ) -> CapacityResult {
        let mut last = Self::evaluate(model_at(max_servers.max(1)), lambda, mu);
        for servers in 1..=max_servers.max(1) {
            let result = Self::evaluate(model_at(servers), lambda, mu);
            last = result;
            if result.stable && result.mean_wait_in_system <= target_latency {
                return CapacityResult {
                    servers,
                    result,
                    met_target: true,
                };
            }
        }
        CapacityResult {
            servers: max_servers.max(1),
            result: last,
            met_target: false,
        }
    }
}

/// Confidence score combining utilization headroom and server-count heuristics, clamped to
/// [0.1, 1.0] per §4.5.
fn confidence_for(rho: f64, servers: u32) -> f64 {
    let headroom = (1.0 - rho).clamp(0.0, 1.0);
    let server_bonus = (servers as f64).ln().max(0.0) * 0.05;
    (0.5 + headroom * 0.5 + server_bonus).clamp(0.1, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mm1_matches_textbook_formula() {
        // lambda=4, mu=5 => rho=0.8, Lq = rho^2/(1-rho) = 3.2, Wq = Lq/lambda = 0.8
        let result = QueueingCalculator::evaluate(QueueModel::MM1, 4.0, 5.0);
        assert!(result.stable);
        assert!((result.utilization - 0.8).abs() < 1e-9);
        assert!((result.mean_queue_length - 3.2).abs() < 1e-6);
        assert!((result.mean_wait_in_queue.as_secs_f64() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn unstable_when_rho_at_or_above_one() {
        let result = QueueingCalculator::evaluate(QueueModel::MM1, 10.0, 5.0);
        assert!(!result.stable);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.utilization, 1.0);
    }

    #[test]
    fn mmc_reduces_wait_as_servers_increase() {
        let two = QueueingCalculator::evaluate(QueueModel::MMC { servers: 2 }, 8.0, 5.0);
        let four = QueueingCalculator::evaluate(QueueModel::MMC { servers: 4 }, 8.0, 5.0);
        assert!(two.stable && four.stable);
        assert!(four.mean_wait_in_system < two.mean_wait_in_system);
    }

    #[test]
    fn mgc_with_cv_one_matches_mmc() {
        let mmc = QueueingCalculator::evaluate(QueueModel::MMC { servers: 3 }, 6.0, 3.0);
        let mgc = QueueingCalculator::evaluate(
            QueueModel::MGC {
                servers: 3,
                service_cv_squared: 1.0,
            },
            6.0,
            3.0,
        );
        assert!((mmc.mean_wait_in_queue.as_secs_f64() - mgc.mean_wait_in_queue.as_secs_f64()).abs() < 1e-6);
    }

    #[test]
    fn capacity_search_finds_smallest_c_meeting_target() {
        let target = Duration::from_millis(500);
        let capacity = QueueingCalculator::calculate_capacity(
            |c| QueueModel::MMC { servers: c },
            8.0,
            5.0,
            target,
            20,
        );
        assert!(capacity.met_target);
        assert!(capacity.result.mean_wait_in_system <= target);
        // One fewer server must fail the target, otherwise the search did not find the minimum.
        if capacity.servers > 1 {
            let previous = QueueingCalculator::evaluate(
                QueueModel::MMC {
                    servers: capacity.servers - 1,
                },
                8.0,
                5.0,
            );
            assert!(!previous.stable || previous.mean_wait_in_system > target);
        }
    }
}
