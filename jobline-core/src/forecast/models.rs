//! EWMA, Linear (OLS), Holt-Winters, and Seasonal arrival-rate forecasters (§4.6).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// A single observed load sample (§3 "Metrics snapshot"), the unit the planner's bounded
/// recent-history ring accumulates and the forecaster consumes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub arrival_rate: f64,
    pub service_rate: f64,
    pub service_time_mean: f64,
    pub service_time_stddev: f64,
    pub backlog: u64,
    pub worker_count: u32,
    pub utilization: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForecastModel {
    Ewma,
    Linear,
    HoltWinters,
    Seasonal,
}

impl std::fmt::Display for ForecastModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ForecastModel::Ewma => "ewma",
            ForecastModel::Linear => "linear",
            ForecastModel::HoltWinters => "holt_winters",
            ForecastModel::Seasonal => "seasonal",
        };
        write!(f, "{name}")
    }
}

/// One forecasted point. Never negative — clamped to zero, with the clamp itself visible only
/// through `arrival_rate == 0.0 && lower_bound == 0.0` since the spec asks for a silent clamp,
/// not a separate flag.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Prediction {
    pub timestamp: DateTime<Utc>,
    pub arrival_rate: f64,
    pub confidence: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub model: ForecastModel,
}

const HOLT_WINTERS_SEASON_LEN: usize = 24;
const SEASONAL_MIN_POINTS: usize = 48;
const EWMA_ALPHA: f64 = 0.3;

pub struct Forecaster;

impl Forecaster {
    /// Forecasts `horizon` points spaced `step` apart, starting one `step` after the last
    /// observation. Falls back to EWMA when the requested model needs more history than is
    /// available (§4.6: Holt-Winters needs ≥24 points, Seasonal needs ≥48).
    pub fn forecast(
        model: ForecastModel,
        history: &[MetricsSnapshot],
        horizon: usize,
        step: ChronoDuration,
    ) -> Vec<Prediction> {
        if history.is_empty() {
            return Vec::new();
        }

        let effective_model = match model {
            ForecastModel::HoltWinters if history.len() < HOLT_WINTERS_SEASON_LEN => ForecastModel::Ewma,
            ForecastModel::Seasonal if history.len() < SEASONAL_MIN_POINTS => ForecastModel::Ewma,
            other => other,
        };

        let last_timestamp = history.last().map(|p| p.timestamp).unwrap_or_else(Utc::now);
        let rates: Vec<f64> = history.iter().map(|p| p.arrival_rate).collect();

        let raw = match effective_model {
            ForecastModel::Ewma => Self::ewma(&rates, horizon),
            ForecastModel::Linear => Self::linear(&rates, horizon),
            ForecastModel::HoltWinters => Self::holt_winters(&rates, horizon),
            ForecastModel::Seasonal => Self::seasonal(history, horizon, step),
        };

        raw.into_iter()
            .enumerate()
            .map(|(i, (value, spread))| {
                let clamped = value.max(0.0);
                let lower = (clamped - spread).max(0.0);
                let upper = clamped + spread;
                Prediction {
                    timestamp: last_timestamp + step * (i as i32 + 1),
                    arrival_rate: clamped,
                    confidence: confidence_for(effective_model, i, horizon),
                    lower_bound: lower,
                    upper_bound: upper,
                    model: effective_model,
                }
            })
            .collect()
    }

    /// Exponentially weighted moving average — the default model and the fallback for every
    /// other model when history is too short. Predicts flat forward at the smoothed level, with
    /// a spread that widens the further out the horizon reaches.
    fn ewma(rates: &[f64], horizon: usize) -> Vec<(f64, f64)> {
        let mut level = rates[0];
        for &r in &rates[1..] {
            level = EWMA_ALPHA * r + (1.0 - EWMA_ALPHA) * level;
        }
        let stddev = stddev(rates);
        (0..horizon).map(|i| (level, stddev * (1.0 + i as f64 * 0.1))).collect()
    }

    /// Ordinary least squares slope/intercept over the index, clamped so the projection never
    /// goes negative even if the trend is declining.
    fn linear(rates: &[f64], horizon: usize) -> Vec<(f64, f64)> {
        let n = rates.len() as f64;
        let xs: Vec<f64> = (0..rates.len()).map(|i| i as f64).collect();
        let x_mean = xs.iter().sum::<f64>() / n;
        let y_mean = rates.iter().sum::<f64>() / n;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (x, y) in xs.iter().zip(rates.iter()) {
            numerator += (x - x_mean) * (y - y_mean);
            denominator += (x - x_mean).powi(2);
        }
        let slope = if denominator.abs() < f64::EPSILON { 0.0 } else { numerator / denominator };
        let intercept = y_mean - slope * x_mean;
        let stddev = stddev(rates);

        (0..horizon)
            .map(|i| {
                let x = rates.len() as f64 + i as f64;
                (intercept + slope * x, stddev * (1.0 + i as f64 * 0.15))
            })
            .collect()
    }

    /// Holt-Winters with a 24-period season. Additive trend and seasonal components, updated
    /// once over the full history then projected forward.
    fn holt_winters(rates: &[f64], horizon: usize) -> Vec<(f64, f64)> {
        let season_len = HOLT_WINTERS_SEASON_LEN;
        let (alpha, beta, gamma) = (0.3, 0.1, 0.2);

        let seasons = rates.len() / season_len;
        let mut seasonal: Vec<f64> = (0..season_len)
            .map(|i| {
                let vals: Vec<f64> = (0..seasons).map(|s| rates[s * season_len + i]).collect();
                vals.iter().sum::<f64>() / vals.len().max(1) as f64
            })
            .collect();
        let season_mean = seasonal.iter().sum::<f64>() / season_len as f64;
        for s in seasonal.iter_mut() {
            *s -= season_mean;
        }

        let mut level = rates[..season_len].iter().sum::<f64>() / season_len as f64;
        let mut trend = (rates[season_len..season_len * 2].iter().sum::<f64>() / season_len as f64 - level)
            / season_len as f64;

        for (t, &r) in rates.iter().enumerate() {
            let s_idx = t % season_len;
            let last_level = level;
            level = alpha * (r - seasonal[s_idx]) + (1.0 - alpha) * (level + trend);
            trend = beta * (level - last_level) + (1.0 - beta) * trend;
            seasonal[s_idx] = gamma * (r - level) + (1.0 - gamma) * seasonal[s_idx];
        }

        let stddev = stddev(rates);
        (0..horizon)
            .map(|i| {
                let s_idx = i % season_len;
                let value = level + trend * (i as f64 + 1.0) + seasonal[s_idx];
                (value, stddev * (1.0 + i as f64 * 0.08))
            })
            .collect()
    }

    /// Daily (24-bucket, by hour-of-day) and weekly (7-bucket, by day-of-week) seasonal factors,
    /// each normalized to average 1.0, then a deseasonalize → trend-the-residual →
    /// reseasonalize-for-output pipeline so a trending series doesn't forecast flat forever.
    fn seasonal(history: &[MetricsSnapshot], horizon: usize, step: ChronoDuration) -> Vec<(f64, f64)> {
        use chrono::Datelike;
        use chrono::Timelike;

        let rates: Vec<f64> = history.iter().map(|p| p.arrival_rate).collect();
        let overall_mean = rates.iter().sum::<f64>() / rates.len() as f64;

        let mut hourly_sum = [0.0_f64; 24];
        let mut hourly_counts = [0u32; 24];
        let mut daily_sum = [0.0_f64; 7];
        let mut daily_counts = [0u32; 7];

        for point in history {
            let hour = point.timestamp.hour() as usize;
            hourly_sum[hour] += point.arrival_rate;
            hourly_counts[hour] += 1;

            let weekday = point.timestamp.weekday().num_days_from_monday() as usize;
            daily_sum[weekday] += point.arrival_rate;
            daily_counts[weekday] += 1;
        }

        let hourly_factor = normalized_seasonal_factors(&hourly_sum, &hourly_counts, overall_mean);
        let daily_factor = normalized_seasonal_factors(&daily_sum, &daily_counts, overall_mean);

        let residuals: Vec<f64> = history
            .iter()
            .map(|point| {
                let hour = point.timestamp.hour() as usize;
                let weekday = point.timestamp.weekday().num_days_from_monday() as usize;
                let seasonal_factor = hourly_factor[hour] * daily_factor[weekday];
                if seasonal_factor.abs() > f64::EPSILON {
                    point.arrival_rate / seasonal_factor
                } else {
                    point.arrival_rate
                }
            })
            .collect();

        // Trend the deseasonalized residual with the same OLS fit `linear` uses.
        let n = residuals.len() as f64;
        let xs: Vec<f64> = (0..residuals.len()).map(|i| i as f64).collect();
        let x_mean = xs.iter().sum::<f64>() / n;
        let y_mean = residuals.iter().sum::<f64>() / n;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (x, y) in xs.iter().zip(residuals.iter()) {
            numerator += (x - x_mean) * (y - y_mean);
            denominator += (x - x_mean).powi(2);
        }
        let slope = if denominator.abs() < f64::EPSILON { 0.0 } else { numerator / denominator };
        let intercept = y_mean - slope * x_mean;

        let stddev = stddev(&rates);
        let last_timestamp = history.last().unwrap().timestamp;

        (0..horizon)
            .map(|i| {
                let ts = last_timestamp + step * (i as i32 + 1);
                let hour = ts.hour() as usize;
                let weekday = ts.weekday().num_days_from_monday() as usize;
                let trended_residual = intercept + slope * (residuals.len() as f64 + i as f64);
                let value = trended_residual * hourly_factor[hour] * daily_factor[weekday];
                (value, stddev * (1.0 + i as f64 * 0.05))
            })
            .collect()
    }
}

/// Per-bucket average divided by the overall mean, then re-scaled so the factor array's own mean
/// is exactly 1.0 (spec: "normalizes so the daily pattern averages 1.0"). Empty buckets fall back
/// to the neutral factor of 1.0.
fn normalized_seasonal_factors<const N: usize>(sum: &[f64; N], counts: &[u32; N], overall_mean: f64) -> [f64; N] {
    let mut factor = [1.0_f64; N];
    if overall_mean.abs() > f64::EPSILON {
        for i in 0..N {
            if counts[i] > 0 {
                factor[i] = (sum[i] / counts[i] as f64) / overall_mean;
            }
        }
    }
    let factor_mean = factor.iter().sum::<f64>() / N as f64;
    if factor_mean.abs() > f64::EPSILON {
        for f in factor.iter_mut() {
            *f /= factor_mean;
        }
    }
    factor
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn confidence_for(model: ForecastModel, step_index: usize, horizon: usize) -> f64 {
    let base = match model {
        ForecastModel::Ewma => 0.7,
        ForecastModel::Linear => 0.65,
        ForecastModel::HoltWinters => 0.8,
        ForecastModel::Seasonal => 0.85,
    };
    let decay = step_index as f64 / horizon.max(1) as f64 * 0.3;
    (base - decay).clamp(0.1, 0.95)
}
