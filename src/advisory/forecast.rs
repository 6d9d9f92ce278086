// Trend forecasting of unit resource usage (advisory only)

use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::models::{Metric, Prediction, ResourceSample};
use crate::units::registry::Registry;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Least-squares line through a set of points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination of the fit, 0.0..=1.0
    pub r_squared: f64,
}

impl Trend {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit `y = intercept + slope * x`.
///
/// Returns None with fewer than two points or when every x is the same.
pub fn linear_trend(points: &[(f64, f64)]) -> Option<Trend> {
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in points {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx <= f64::EPSILON {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in points {
        let fitted = intercept + slope * x;
        ss_res += (y - fitted) * (y - fitted);
        ss_tot += (y - mean_y) * (y - mean_y);
    }
    // A flat series is explained perfectly by a flat line
    let r_squared = if ss_tot <= f64::EPSILON {
        1.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    Some(Trend {
        slope,
        intercept,
        r_squared,
    })
}

type SeriesKey = (String, Metric);

#[derive(Default)]
struct ForecastInner {
    windows: HashMap<SeriesKey, VecDeque<(DateTime<Utc>, f64)>>,
    predictions: HashMap<SeriesKey, Prediction>,
    alerted: HashMap<SeriesKey, bool>,
}

/// Extrapolates per-unit metric trends and warns ahead of limit breaches.
///
/// Predictions are published for the control surface and as events; they
/// never change unit state.
pub struct Forecaster {
    registry: Arc<Registry>,
    events: Arc<EventLog>,
    interval: Duration,
    window: usize,
    horizon: Duration,
    warn_fraction: f64,
    inner: Mutex<ForecastInner>,
}

impl Forecaster {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<EventLog>,
        interval: Duration,
        window: usize,
        horizon: Duration,
        warn_fraction: f64,
    ) -> Self {
        Self {
            registry,
            events,
            interval,
            window: window.max(2),
            horizon,
            warn_fraction,
            inner: Mutex::new(ForecastInner::default()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, ForecastInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a sample to the sliding windows of its unit
    pub fn record(&self, sample: &ResourceSample) {
        let mut inner = self.inner();
        for metric in Metric::ALL {
            let window = inner
                .windows
                .entry((sample.unit_id.clone(), metric))
                .or_default();
            window.push_back((sample.timestamp, sample.value(metric)));
            while window.len() > self.window {
                window.pop_front();
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let predictions = self.evaluate();
                    tracing::trace!("Forecast pass produced {} predictions", predictions.len());
                }
            }
        }
        tracing::debug!("Forecaster stopped");
    }

    /// Refit every series and return the fresh predictions
    pub fn evaluate(&self) -> Vec<Prediction> {
        let now = Utc::now();
        self.forget_inactive();
        let series: Vec<(SeriesKey, Vec<(DateTime<Utc>, f64)>)> = self
            .inner()
            .windows
            .iter()
            .map(|(key, window)| (key.clone(), window.iter().copied().collect()))
            .collect();

        let mut fresh = Vec::new();
        for ((unit, metric), points) in series {
            let Some(prediction) = self.forecast(&unit, metric, &points, now) else {
                continue;
            };
            let current = points.last().map(|(_, v)| *v).unwrap_or(0.0);
            self.check_alert(&unit, metric, current, &prediction);

            self.inner()
                .predictions
                .insert((unit, metric), prediction.clone());
            fresh.push(prediction);
        }
        fresh
    }

    fn forecast(
        &self,
        unit: &str,
        metric: Metric,
        points: &[(DateTime<Utc>, f64)],
        now: DateTime<Utc>,
    ) -> Option<Prediction> {
        let origin = points.first()?.0;
        let xy: Vec<(f64, f64)> = points
            .iter()
            .map(|(t, v)| (seconds_between(origin, *t), *v))
            .collect();
        let trend = linear_trend(&xy)?;

        let last_x = xy.last().map(|(x, _)| *x).unwrap_or(0.0);
        let target = last_x + self.horizon.as_secs_f64();
        Some(Prediction {
            unit_id: unit.to_string(),
            metric,
            predicted_value: trend.at(target).max(0.0),
            confidence: trend.r_squared,
            horizon_seconds: self.horizon.as_secs(),
            timestamp: now,
        })
    }

    // One advisory warning per episode of "projected to approach the limit"
    fn check_alert(&self, unit: &str, metric: Metric, current: f64, prediction: &Prediction) {
        let Ok(def) = self.registry.definition(unit) else {
            return;
        };
        let Some(limit) = def.limits.for_metric(metric) else {
            return;
        };

        let approaching = prediction.predicted_value >= limit * self.warn_fraction;
        let key = (unit.to_string(), metric);
        let fire = {
            let mut inner = self.inner();
            let alerted = inner.alerted.entry(key).or_insert(false);
            if !approaching {
                *alerted = false;
                false
            } else if current < limit && !*alerted {
                *alerted = true;
                true
            } else {
                false
            }
        };

        if fire {
            self.events.append(
                NewEvent::new(
                    EventKind::PredictionAlert,
                    Severity::Warning,
                    format!(
                        "{} projected to reach {:.1} of limit {:.1} within {}s (confidence {:.2})",
                        metric.label(),
                        prediction.predicted_value,
                        limit,
                        prediction.horizon_seconds,
                        prediction.confidence
                    ),
                )
                .unit(unit),
            );
        }
    }

    /// Latest prediction per unit metric
    pub fn predictions(&self) -> Vec<Prediction> {
        let mut predictions: Vec<Prediction> = self.inner().predictions.values().cloned().collect();
        predictions.sort_by(|a, b| {
            a.unit_id
                .cmp(&b.unit_id)
                .then_with(|| a.metric.label().cmp(b.metric.label()))
        });
        predictions
    }

    // Units without a live process keep no series or predictions
    fn forget_inactive(&self) {
        let inactive: Vec<String> = self
            .registry
            .definitions()
            .iter()
            .filter(|def| {
                !self
                    .registry
                    .state(&def.id)
                    .map(|s| s.status.is_live())
                    .unwrap_or(false)
            })
            .map(|def| def.id.clone())
            .collect();
        for unit in inactive {
            self.forget(&unit);
        }
    }

    /// Drop all series of a unit
    pub fn forget(&self, unit: &str) {
        let mut inner = self.inner();
        inner.windows.retain(|(id, _), _| id != unit);
        inner.predictions.retain(|(id, _), _| id != unit);
        inner.alerted.retain(|(id, _), _| id != unit);
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQuery;
    use crate::units::models::{ResourceLimits, UnitDefinition, UnitStatus};
    use chrono::Duration as ChronoDuration;

    fn forecaster(limit_mb: f64) -> (Forecaster, Arc<EventLog>, Arc<Registry>) {
        let def = UnitDefinition::new("cache", "/usr/bin/cache").limits(ResourceLimits {
            cpu_percent: None,
            memory_mb: Some(limit_mb),
        });
        let registry = Arc::new(Registry::new(vec![def]).unwrap());
        registry
            .update("cache", |s| s.status = UnitStatus::Running)
            .unwrap();
        let events = Arc::new(EventLog::new());
        let forecaster = Forecaster::new(
            registry.clone(),
            events.clone(),
            Duration::from_secs(15),
            30,
            Duration::from_secs(300),
            0.8,
        );
        (forecaster, events, registry)
    }

    fn sample(at: DateTime<Utc>, memory_mb: f64) -> ResourceSample {
        ResourceSample {
            unit_id: "cache".to_string(),
            timestamp: at,
            cpu_percent: 1.0,
            memory_mb,
        }
    }

    #[test]
    fn test_linear_trend_perfect_fit() {
        let points = vec![(0.0, 1.0), (1.0, 3.0), (2.0, 5.0), (3.0, 7.0)];
        let trend = linear_trend(&points).unwrap();

        assert!((trend.slope - 2.0).abs() < 1e-9);
        assert!((trend.intercept - 1.0).abs() < 1e-9);
        assert!((trend.r_squared - 1.0).abs() < 1e-9);
        assert!((trend.at(10.0) - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_trend_noisy_lowers_confidence() {
        let points = vec![(0.0, 1.0), (1.0, 9.0), (2.0, 2.0), (3.0, 8.0), (4.0, 3.0)];
        let trend = linear_trend(&points).unwrap();
        assert!(trend.r_squared < 0.5);
    }

    #[test]
    fn test_linear_trend_degenerate_input() {
        assert!(linear_trend(&[]).is_none());
        assert!(linear_trend(&[(1.0, 2.0)]).is_none());
        assert!(linear_trend(&[(1.0, 2.0), (1.0, 4.0)]).is_none());
    }

    #[test]
    fn test_rising_memory_alerts_once_per_episode() {
        let (forecaster, events, _) = forecaster(500.0);
        let start = Utc::now();
        // +1 MB/s, so 300s past the last sample (290MB) projects 590MB
        for i in 0..10 {
            forecaster.record(&sample(start + ChronoDuration::seconds(i * 10), 200.0 + i as f64 * 10.0));
        }

        let predictions = forecaster.evaluate();
        let memory = predictions
            .iter()
            .find(|p| p.metric == Metric::MemoryMb)
            .unwrap();
        assert!((memory.predicted_value - 590.0).abs() < 1e-6);
        assert!((memory.confidence - 1.0).abs() < 1e-9);
        assert_eq!(memory.horizon_seconds, 300);

        forecaster.evaluate();
        let alerts = events.query(&EventQuery {
            kind: Some(EventKind::PredictionAlert),
            ..Default::default()
        });
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].unit_id.as_deref(), Some("cache"));
    }

    #[test]
    fn test_flat_usage_does_not_alert() {
        let (forecaster, events, _) = forecaster(500.0);
        let start = Utc::now();
        for i in 0..5 {
            forecaster.record(&sample(start + ChronoDuration::seconds(i * 10), 100.0));
        }

        forecaster.evaluate();
        assert!(events.is_empty());
        assert_eq!(forecaster.predictions().len(), 2);
    }

    #[test]
    fn test_window_is_bounded_and_forget_clears() {
        let (forecaster, _, _) = forecaster(500.0);
        let start = Utc::now();
        for i in 0..100 {
            forecaster.record(&sample(start + ChronoDuration::seconds(i), 100.0));
        }
        assert_eq!(
            forecaster.inner().windows[&("cache".to_string(), Metric::MemoryMb)].len(),
            30
        );

        forecaster.evaluate();
        forecaster.forget("cache");
        assert!(forecaster.predictions().is_empty());
    }

    #[test]
    fn test_stopped_unit_loses_its_predictions() {
        let (forecaster, _, registry) = forecaster(500.0);
        let start = Utc::now();
        for i in 0..5 {
            forecaster.record(&sample(start + ChronoDuration::seconds(i * 10), 100.0 + i as f64));
        }
        assert_eq!(forecaster.evaluate().len(), 2);

        registry
            .update("cache", |s| s.status = UnitStatus::Stopped)
            .unwrap();
        assert!(forecaster.evaluate().is_empty());
        assert!(forecaster.predictions().is_empty());
    }
}
