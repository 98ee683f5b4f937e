//! Arrival-rate forecasting models feeding the capacity planner's forecast step (§4.6).

mod models;

pub use models::{Forecaster, ForecastModel, MetricsSnapshot, Prediction};
