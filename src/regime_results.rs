//! Result structures for regime detection.
//!
//! This module contains the records returned by fitting, decoding, state-count
//! selection and rolling inference, plus the helpers that derive change points
//! and per-regime statistics from a decoded label sequence.

use crate::{
    errors::NonConvergenceCondition,
    label_stabilizer::{LabelMapping, RegimeIdentity},
    model_selection::SelectionDiagnostics,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Outcome of one [`crate::regime_model::RegimeModel::fit`] call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitReport {
    /// Number of regimes fitted
    pub k: usize,
    /// EM iterations performed
    pub iterations: usize,
    /// Log-likelihood of the retained parameters, in the caller's units
    pub log_likelihood: f64,
    /// True when EM met its tolerance
    pub converged: bool,
    /// True when EM started from the previous fit's parameters
    pub warm_started: bool,
    /// Present when EM stopped at its iteration cap
    pub non_convergence: Option<NonConvergenceCondition>,
    /// How the raw EM states were mapped to stable identities
    pub label_mapping: LabelMapping,
    /// True when identities were renumbered from scratch
    pub identities_reset: bool,
}

/// Complete regime detection result for one series.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegimeDetectionResult {
    /// Number of regimes
    pub k: usize,
    /// Viterbi regime per row
    pub labels: Vec<RegimeIdentity>,
    /// Smoothed posterior per row, ordered by identity
    pub posteriors: Vec<Vec<f64>>,
    /// Rows where the decoded regime changes
    pub change_points: Vec<RegimeChangePoint<usize>>,
    /// Transition matrix in identity order
    pub transition_matrix: Vec<Vec<f64>>,
    /// Per-regime parameters and run statistics
    pub regime_statistics: Vec<RegimeStatistics>,
    /// Information criteria of the fit
    pub model_criteria: ModelCriteria,
    /// Report of the fit that produced this result
    pub fit_report: FitReport,
    /// State-count selection diagnostics when K was chosen automatically
    pub selection: Option<SelectionDiagnostics>,
}

/// Viterbi path and smoothed posteriors of a sequence.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecodeResult {
    /// Most likely regime at each timestamp
    pub labels: Vec<RegimeIdentity>,
    /// Smoothed posterior per timestamp, ordered by identity
    pub posteriors: Vec<Vec<f64>>,
    /// Total log-likelihood of the sequence
    pub log_likelihood: f64,
    /// Joint log-probability of the Viterbi path
    pub path_log_probability: f64,
}

impl DecodeResult {
    /// Indices where the label differs from the preceding one.
    pub fn change_points(&self) -> Vec<RegimeChangePoint<usize>> {
        let times: Vec<usize> = (0..self.labels.len()).collect();
        change_points(&self.labels, &times)
    }

    /// Consecutive-run counter per timestamp (1 on the first step of a run).
    pub fn time_in_regime(&self) -> Vec<usize> {
        time_in_regime(&self.labels)
    }
}

/// One timestamp of a rolling inference stream.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PosteriorRecord<T> {
    /// Caller-supplied timestamp
    pub timestamp: T,
    /// Posterior over identities 1..K at this timestamp, sums to one
    pub posterior: Vec<f64>,
    /// Identity with the largest posterior
    pub label: RegimeIdentity,
    /// Consecutive timestamps with this label, including this one
    pub time_in_regime: usize,
    /// Per-point log-likelihood of the newest observation
    pub log_likelihood: f64,
    /// z-score of the newest one-step cost against the recent buffer
    pub surprise: Option<f64>,
}

/// A label change between two consecutive timestamps.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegimeChangePoint<T> {
    /// Timestamp of the first observation in the new regime
    pub timestamp: T,
    /// Position of that observation in the sequence
    pub index: usize,
    /// Regime left
    pub from: RegimeIdentity,
    /// Regime entered
    pub to: RegimeIdentity,
    /// Length of the run that just ended
    pub previous_regime_duration: usize,
}

/// Model selection criteria.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelCriteria {
    /// Log-likelihood
    pub log_likelihood: f64,
    /// Akaike Information Criterion
    pub aic: f64,
    /// Bayesian Information Criterion
    pub bic: f64,
    /// Number of free parameters
    pub num_parameters: usize,
    /// Number of observations
    pub num_observations: usize,
}

impl ModelCriteria {
    /// Criteria for a K-state model in D dimensions.
    pub fn new(
        log_likelihood: f64,
        num_states: usize,
        dim: usize,
        num_observations: usize,
    ) -> Self {
        let num_parameters = num_free_parameters(num_states, dim);
        let p = num_parameters as f64;
        Self {
            log_likelihood,
            aic: -2.0 * log_likelihood + 2.0 * p,
            bic: -2.0 * log_likelihood + p * (num_observations as f64).ln(),
            num_parameters,
            num_observations,
        }
    }
}

/// Statistics of one regime.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegimeStatistics {
    /// Regime identity
    pub identity: RegimeIdentity,
    /// Emission mean in original feature units
    pub mean: Vec<f64>,
    /// Emission variances in original feature units
    pub variances: Vec<f64>,
    /// Probability of staying in this regime for one more step
    pub persistence_probability: f64,
    /// Expected run length implied by the persistence, `1 / (1 - p)`;
    /// `None` for an absorbing regime
    pub expected_duration: Option<f64>,
    /// Share of timestamps decoded as this regime
    pub occupancy: f64,
    /// Mean length of the decoded runs
    pub average_duration: f64,
    /// Number of decoded runs
    pub occurrence_count: usize,
    /// Total timestamps decoded as this regime
    pub total_duration: usize,
    /// First decoded timestamp, if any
    pub first_occurrence: Option<usize>,
    /// Last decoded timestamp, if any
    pub last_occurrence: Option<usize>,
}

/// Number of free parameters of a K-state Gaussian HMM in D dimensions:
/// `(K − 1) + K(K − 1) + 2·K·D`.
pub fn num_free_parameters(num_states: usize, dim: usize) -> usize {
    let initial_params = num_states.saturating_sub(1);
    let transition_params = num_states * num_states.saturating_sub(1);
    let emission_params = 2 * num_states * dim;

    initial_params + transition_params + emission_params
}

/// Timestamps where the label differs from the immediately preceding one.
pub fn change_points<T: Clone>(
    labels: &[RegimeIdentity],
    timestamps: &[T],
) -> Vec<RegimeChangePoint<T>> {
    let mut points = Vec::new();
    let mut run_start = 0;
    for i in 1..labels.len().min(timestamps.len()) {
        if labels[i] != labels[i - 1] {
            points.push(RegimeChangePoint {
                timestamp: timestamps[i].clone(),
                index: i,
                from: labels[i - 1],
                to: labels[i],
                previous_regime_duration: i - run_start,
            });
            run_start = i;
        }
    }
    points
}

/// Consecutive-run counter per timestamp.
pub fn time_in_regime(labels: &[RegimeIdentity]) -> Vec<usize> {
    let mut counters = Vec::with_capacity(labels.len());
    for (i, label) in labels.iter().enumerate() {
        let run = if i > 0 && labels[i - 1] == *label {
            counters[i - 1] + 1
        } else {
            1
        };
        counters.push(run);
    }
    counters
}

/// Occupancy and run statistics of one identity in a decoded sequence.
pub(crate) struct RunSummary {
    pub occupancy: f64,
    pub average_duration: f64,
    pub occurrence_count: usize,
    pub total_duration: usize,
    pub first_occurrence: Option<usize>,
    pub last_occurrence: Option<usize>,
}

pub(crate) fn summarize_runs(labels: &[RegimeIdentity], identity: RegimeIdentity) -> RunSummary {
    let mut occurrence_count = 0;
    let mut total_duration = 0;
    let mut first_occurrence = None;
    let mut last_occurrence = None;

    let mut i = 0;
    while i < labels.len() {
        if labels[i] == identity {
            first_occurrence.get_or_insert(i);
            let start = i;
            while i < labels.len() && labels[i] == identity {
                i += 1;
            }
            last_occurrence = Some(i - 1);
            total_duration += i - start;
            occurrence_count += 1;
        } else {
            i += 1;
        }
    }

    RunSummary {
        occupancy: if labels.is_empty() {
            0.0
        } else {
            total_duration as f64 / labels.len() as f64
        },
        average_duration: if occurrence_count > 0 {
            total_duration as f64 / occurrence_count as f64
        } else {
            0.0
        },
        occurrence_count,
        total_duration,
        first_occurrence,
        last_occurrence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(labels: &[usize]) -> Vec<RegimeIdentity> {
        labels
            .iter()
            .map(|&l| RegimeIdentity::new(l).unwrap())
            .collect()
    }

    #[test]
    fn test_parameter_count() {
        // 1 + 2 + 2*2*3
        assert_eq!(num_free_parameters(2, 3), 15);
        assert_eq!(num_free_parameters(1, 4), 8);
    }

    #[test]
    fn test_change_points_only_where_label_differs() {
        let labels = ids(&[1, 1, 2, 2, 2, 1, 3]);
        let stamps = vec!["a", "b", "c", "d", "e", "f", "g"];
        let points = change_points(&labels, &stamps);
        let at: Vec<&str> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(at, vec!["c", "f", "g"]);
        assert_eq!(points[0].previous_regime_duration, 2);
        assert_eq!(points[1].previous_regime_duration, 3);
        assert_eq!(points[2].from.get(), 1);
        assert_eq!(points[2].to.get(), 3);
    }

    #[test]
    fn test_time_in_regime_counter() {
        let labels = ids(&[2, 2, 2, 1, 1, 2]);
        assert_eq!(time_in_regime(&labels), vec![1, 2, 3, 1, 2, 1]);
        assert!(time_in_regime(&[]).is_empty());
    }

    #[test]
    fn test_run_summary() {
        let labels = ids(&[1, 1, 2, 1, 1, 1, 2]);
        let one = summarize_runs(&labels, RegimeIdentity::new(1).unwrap());
        assert_eq!(one.occurrence_count, 2);
        assert_eq!(one.total_duration, 5);
        assert_eq!(one.first_occurrence, Some(0));
        assert_eq!(one.last_occurrence, Some(5));
        assert!((one.average_duration - 2.5).abs() < 1e-12);

        let absent = summarize_runs(&labels, RegimeIdentity::new(3).unwrap());
        assert_eq!(absent.occurrence_count, 0);
        assert_eq!(absent.first_occurrence, None);
    }

    #[test]
    fn test_model_criteria() {
        let c = ModelCriteria::new(-100.0, 2, 1, 50);
        assert_eq!(c.num_parameters, 7);
        assert!((c.aic - 214.0).abs() < 1e-12);
        assert!((c.bic - (200.0 + 7.0 * 50f64.ln())).abs() < 1e-12);
    }
}
