//! Rolling (expanding-window) regime inference.
//!
//! The engine cold-starts a [`RegimeModel`] on a warm-up window and then, for
//! every later timestamp, refits on all data up to and including it. Each
//! refit warm-starts from the previous one, so the refits form a chain and run
//! sequentially. The posterior of the newest row is reported together with
//! its per-point log-likelihood under the model's
//! [`crate::regime_config::PointScoring`].

use crate::{
    errors::{RegimeError, RegimeResult},
    label_stabilizer::RegimeIdentity,
    math_utils::{argmax, mean, sample_std},
    preprocessing::ObservationMatrix,
    regime_config::{RegimeModelConfig, RollingConfig},
    regime_model::RegimeModel,
    regime_results::{change_points, PosteriorRecord, RegimeChangePoint},
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-length buffer of recent one-step costs (negative log-likelihoods).
///
/// Only monitors; nothing in it feeds back into estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct SurpriseMonitor {
    capacity: usize,
    costs: VecDeque<f64>,
}

impl SurpriseMonitor {
    /// Empty monitor keeping at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            costs: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.costs.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }

    /// Buffered costs, oldest first.
    pub fn costs(&self) -> Vec<f64> {
        self.costs.iter().copied().collect()
    }

    /// z-score of `log_likelihood`'s cost against the buffer, without
    /// recording it. `None` below two buffered values or for a flat buffer.
    pub fn surprise(&self, log_likelihood: f64) -> Option<f64> {
        if self.costs.len() < 2 {
            return None;
        }
        let costs = self.costs();
        let sd = sample_std(&costs);
        if sd <= f64::EPSILON {
            return None;
        }
        Some((-log_likelihood - mean(&costs)) / sd)
    }

    /// Score `log_likelihood` against the buffer, then record it.
    pub fn observe(&mut self, log_likelihood: f64) -> Option<f64> {
        let z = self.surprise(log_likelihood);
        if self.costs.len() == self.capacity {
            self.costs.pop_front();
        }
        self.costs.push_back(-log_likelihood);
        z
    }
}

/// A timestamp whose refit failed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SkippedWindow<T> {
    /// Timestamp of the newest row of the window
    pub timestamp: T,
    /// Row index of that timestamp
    pub index: usize,
    /// Error raised by the refit
    pub reason: String,
}

/// Output of a rolling run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RollingOutput<T> {
    /// Number of regimes used throughout the run
    pub k: usize,
    /// One record per successfully refitted timestamp
    pub records: Vec<PosteriorRecord<T>>,
    /// Timestamps whose refit failed
    pub skipped: Vec<SkippedWindow<T>>,
}

impl<T: Clone> RollingOutput<T> {
    /// Labels of the records, in order.
    pub fn labels(&self) -> Vec<RegimeIdentity> {
        self.records.iter().map(|r| r.label).collect()
    }

    /// Records where the label differs from the preceding record.
    pub fn change_points(&self) -> Vec<RegimeChangePoint<T>> {
        let timestamps: Vec<T> = self.records.iter().map(|r| r.timestamp.clone()).collect();
        change_points(&self.labels(), &timestamps)
    }
}

/// Expanding-window regime inference.
#[derive(Debug, Clone)]
pub struct RollingInferenceEngine {
    config: RollingConfig,
    model: RegimeModel,
    k: Option<usize>,
}

impl RollingInferenceEngine {
    /// Engine over a fresh model. With `k = None` the warm-up fit selects K
    /// and every later refit keeps it.
    pub fn new(
        model_config: RegimeModelConfig,
        config: RollingConfig,
        k: Option<usize>,
    ) -> RegimeResult<Self> {
        Self::from_model(RegimeModel::new(model_config)?, config, k)
    }

    /// Engine over an existing model. A fitted model is reset by the first run.
    pub fn from_model(
        model: RegimeModel,
        config: RollingConfig,
        k: Option<usize>,
    ) -> RegimeResult<Self> {
        config.validate()?;
        Ok(Self { config, model, k })
    }

    /// Rolling settings in use.
    pub fn config(&self) -> &RollingConfig {
        &self.config
    }

    /// The model after the most recent refit.
    pub fn model(&self) -> &RegimeModel {
        &self.model
    }

    /// Consume the engine, keeping the model.
    pub fn into_model(self) -> RegimeModel {
        self.model
    }

    /// Run over `x` with caller-supplied timestamps, one per row.
    ///
    /// Records start at row `warm_start_window`. A failing warm-up fit is
    /// fatal; a failing later refit is recorded in `skipped` and the chain
    /// continues from the last good parameters.
    pub fn run<T: Clone>(
        &mut self,
        x: &ObservationMatrix,
        timestamps: &[T],
    ) -> RegimeResult<RollingOutput<T>> {
        if timestamps.len() != x.num_rows() {
            return Err(RegimeError::DimensionMismatch {
                expected: x.num_rows(),
                actual: timestamps.len(),
            });
        }
        let warm_len = self.config.warm_start_window;
        if x.num_rows() < warm_len {
            return Err(RegimeError::InputShape {
                required: warm_len - 1,
                actual: x.num_rows(),
                states: self.k.unwrap_or(0),
            });
        }

        self.model.reset();
        let warm = x.prefix(warm_len);
        let k = self.model.fit(&warm, self.k)?.k;

        let mut monitor = SurpriseMonitor::new(self.config.surprise_buffer_len);
        let warm_points = self.model.point_scores(&warm)?;
        let seed_from = warm_points.len().saturating_sub(self.config.surprise_buffer_len);
        for &ll in &warm_points[seed_from..] {
            monitor.observe(ll);
        }

        let mut records: Vec<PosteriorRecord<T>> = Vec::with_capacity(x.num_rows() - warm_len);
        let mut skipped = Vec::new();

        for t in warm_len..x.num_rows() {
            let window = x.prefix(t + 1);
            let step = self
                .model
                .fit(&window, Some(k))
                .and_then(|_| self.model.filter_last(&window));

            let (posterior, log_likelihood) = match step {
                Ok(out) => out,
                Err(e) => {
                    log::warn!("Rolling refit at row {} skipped: {}", t, e);
                    skipped.push(SkippedWindow {
                        timestamp: timestamps[t].clone(),
                        index: t,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let label = RegimeIdentity::from_index(argmax(&posterior));
            let time_in_regime = match records.last() {
                Some(prev) if prev.label == label => prev.time_in_regime + 1,
                _ => 1,
            };
            let surprise = monitor.observe(log_likelihood);

            records.push(PosteriorRecord {
                timestamp: timestamps[t].clone(),
                posterior,
                label,
                time_in_regime,
                log_likelihood,
                surprise,
            });
        }

        log::debug!(
            "Rolling run: {} records, {} skipped, k = {}",
            records.len(),
            skipped.len(),
            k
        );
        Ok(RollingOutput {
            k,
            records,
            skipped,
        })
    }

    /// [`RollingInferenceEngine::run`] with row indices as timestamps.
    pub fn run_indexed(&mut self, x: &ObservationMatrix) -> RegimeResult<RollingOutput<usize>> {
        let timestamps: Vec<usize> = (0..x.num_rows()).collect();
        self.run(x, &timestamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn blocks(n: usize) -> ObservationMatrix {
        let rows = (0..n)
            .map(|t| {
                let level = if (t / 15) % 2 == 0 { -2.0 } else { 2.0 };
                let wiggle = ((t * 7) % 5) as f64 * 0.05;
                vec![level + wiggle, level - wiggle]
            })
            .collect();
        ObservationMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_surprise_monitor() {
        let mut monitor = SurpriseMonitor::new(3);
        assert_eq!(monitor.observe(-1.0), None);
        assert_eq!(monitor.observe(-2.0), None);
        // costs [1, 2]: mean 1.5, sd 0.7071
        let z = monitor.observe(-3.0).unwrap();
        assert_approx_eq!(z, 1.5 / 0.5f64.sqrt(), 1e-12);
        monitor.observe(-4.0);
        assert_eq!(monitor.costs(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_flat_buffer_has_no_surprise() {
        let mut monitor = SurpriseMonitor::new(4);
        monitor.observe(-1.0);
        monitor.observe(-1.0);
        assert_eq!(monitor.surprise(-5.0), None);
    }

    #[test]
    fn test_run_requires_warm_up_rows() {
        let mut engine = RollingInferenceEngine::new(
            RegimeModelConfig::seeded(1),
            RollingConfig::default(),
            Some(2),
        )
        .unwrap();
        assert!(matches!(
            engine.run_indexed(&blocks(10)),
            Err(RegimeError::InputShape { required: 23, .. })
        ));
        assert!(matches!(
            engine.run(&blocks(30), &[0u32; 5]),
            Err(RegimeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_rolling_records() {
        let x = blocks(60);
        let mut engine = RollingInferenceEngine::new(
            RegimeModelConfig::seeded(4),
            RollingConfig::default(),
            Some(2),
        )
        .unwrap();
        let out = engine.run_indexed(&x).unwrap();
        assert_eq!(out.k, 2);
        assert_eq!(out.records.len() + out.skipped.len(), 36);
        assert_eq!(out.records[0].timestamp, 24);

        for record in &out.records {
            assert_approx_eq!(record.posterior.iter().sum::<f64>(), 1.0, 1e-6);
            assert!(record.label.get() <= 2);
            assert!(record.log_likelihood.is_finite());
        }
        for pair in out.records.windows(2) {
            if pair[0].label == pair[1].label {
                assert_eq!(pair[1].time_in_regime, pair[0].time_in_regime + 1);
            } else {
                assert_eq!(pair[1].time_in_regime, 1);
            }
        }

        // the warm-up already holds both levels; blocks switch at 30 and 45
        assert_eq!(out.records[0].label.get(), 2);
        let changes = out.change_points();
        let at: Vec<usize> = changes.iter().map(|c| c.timestamp).collect();
        assert_eq!(at, vec![30, 45]);
        for change in &changes {
            let i = change.index;
            assert_ne!(out.records[i].label, out.records[i - 1].label);
        }
        assert_eq!(changes[0].to.get(), 1);
    }

    #[test]
    fn test_regime_first_seen_late_in_warm_up_is_left_again() {
        // level 3 appears only in the last rows of the warm-up window
        let rows = (0..70)
            .map(|t| {
                let level = if (20..40).contains(&t) { 3.0 } else { 0.0 };
                let wiggle = ((t * 7) % 5) as f64 * 0.05;
                vec![level + wiggle, level - wiggle]
            })
            .collect();
        let x = ObservationMatrix::from_rows(rows).unwrap();
        let mut engine = RollingInferenceEngine::new(
            RegimeModelConfig::seeded(4),
            RollingConfig::default(),
            Some(2),
        )
        .unwrap();
        let out = engine.run_indexed(&x).unwrap();
        assert!(out.skipped.is_empty());

        let at: Vec<usize> = out.change_points().iter().map(|c| c.timestamp).collect();
        assert_eq!(at, vec![40]);
        assert_eq!(out.records.last().unwrap().label.get(), 1);
        let transition = engine.model().transition_matrix().unwrap();
        assert!(transition[1][0] > 0.0);
    }
}
