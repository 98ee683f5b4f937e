//! Anomaly gating on the planner's recent-metrics ring (§4.7 step 3).

use crate::forecast::MetricsSnapshot;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnomalyConfig {
    /// Z-score threshold beyond which the current arrival rate is treated as anomalous.
    pub z_score_threshold: f64,
    /// Ratio (current / recent-average) beyond which a sudden spike is treated as anomalous
    /// even if the sample count is too small for a meaningful z-score.
    pub spike_ratio_threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            z_score_threshold: 3.0,
            spike_ratio_threshold: 3.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnomalyVerdict {
    pub anomalous: bool,
    pub z_score: f64,
    pub spike_ratio: f64,
    pub reason: Option<String>,
}

/// Flags `current` as anomalous against `history` by z-score or sudden-spike ratio, whichever
/// fires first (§4.7: "z-score > threshold or sudden spike ratio > threshold").
pub fn detect(history: &[MetricsSnapshot], current: &MetricsSnapshot, config: AnomalyConfig) -> AnomalyVerdict {
    if history.len() < 2 {
        return AnomalyVerdict {
            anomalous: false,
            z_score: 0.0,
            spike_ratio: 1.0,
            reason: None,
        };
    }

    let rates: Vec<f64> = history.iter().map(|p| p.arrival_rate).collect();
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
    let stddev = variance.sqrt();

    let z_score = if stddev > f64::EPSILON {
        (current.arrival_rate - mean) / stddev
    } else {
        0.0
    };
    let spike_ratio = if mean > f64::EPSILON {
        current.arrival_rate / mean
    } else {
        1.0
    };

    let z_fires = z_score.abs() > config.z_score_threshold;
    let spike_fires = spike_ratio > config.spike_ratio_threshold;

    let reason = if z_fires {
        Some(format!(
            "arrival rate z-score {z_score:.2} exceeds threshold {:.2}",
            config.z_score_threshold
        ))
    } else if spike_fires {
        Some(format!(
            "arrival rate spike ratio {spike_ratio:.2}x exceeds threshold {:.2}x",
            config.spike_ratio_threshold
        ))
    } else {
        None
    };

    AnomalyVerdict {
        anomalous: z_fires || spike_fires,
        z_score,
        spike_ratio,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snap(rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            arrival_rate: rate,
            service_rate: 10.0,
            service_time_mean: 0.1,
            service_time_stddev: 0.02,
            backlog: 0,
            worker_count: 4,
            utilization: 0.5,
        }
    }

    #[test]
    fn stable_history_is_not_anomalous() {
        let history: Vec<_> = (0..20).map(|_| snap(10.0)).collect();
        let verdict = detect(&history, &snap(10.5), AnomalyConfig::default());
        assert!(!verdict.anomalous);
    }

    #[test]
    fn sudden_spike_is_flagged() {
        let history: Vec<_> = (0..20).map(|_| snap(10.0)).collect();
        let verdict = detect(&history, &snap(100.0), AnomalyConfig::default());
        assert!(verdict.anomalous);
        assert!(verdict.reason.is_some());
    }

    #[test]
    fn too_little_history_is_never_anomalous() {
        let verdict = detect(&[snap(10.0)], &snap(1000.0), AnomalyConfig::default());
        assert!(!verdict.anomalous);
    }
}
