//! Configuration structures for regime detection.
//!
//! This module contains the configuration of a [`crate::regime_model::RegimeModel`]
//! (EM budget, covariance structure, standardization), of the state-count
//! selector, of the label stabilizer and of the rolling inference engine.

use crate::{
    emission_models::CovarianceType,
    errors::{validate_parameter, RegimeError, RegimeResult},
    hmm_core::EmSettings,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration of a regime model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegimeModelConfig {
    /// Covariance structure of every regime
    pub covariance_type: CovarianceType,
    /// EM iteration cap
    pub n_iter: usize,
    /// EM convergence threshold on |ΔLL|
    pub tol: f64,
    /// Added to every variance in the M-step
    pub min_covar: f64,
    /// Rows must exceed `K * min_samples_per_state`
    pub min_samples_per_state: usize,
    /// Fit a z-score transform on each fit and apply it everywhere
    pub standardize: bool,
    /// Seed for the cluster initializer; `None` draws from OS entropy
    pub seed: Option<u64>,
    /// How single observations are scored out of sample
    pub point_scoring: PointScoring,
    /// Label stabilizer settings
    pub stabilizer: StabilizerConfig,
    /// State-count selection settings (used when `fit` is called without K)
    pub selection: SelectionConfig,
}

impl Default for RegimeModelConfig {
    fn default() -> Self {
        Self {
            covariance_type: CovarianceType::Diagonal,
            n_iter: 100,
            tol: 1e-6,
            min_covar: 1e-3,
            min_samples_per_state: 3,
            standardize: true,
            seed: None,
            point_scoring: PointScoring::default(),
            stabilizer: StabilizerConfig::default(),
            selection: SelectionConfig::default(),
        }
    }
}

impl RegimeModelConfig {
    /// Default configuration with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// Smaller selection range and EM budgets, for short inputs.
    pub fn light() -> Self {
        Self {
            n_iter: 50,
            selection: SelectionConfig {
                k_max: 4,
                bic_n_iter: 200,
                cv_n_iter: 100,
                ..SelectionConfig::default()
            },
            ..Self::default()
        }
    }

    /// Full covariances with the default budgets.
    pub fn full_covariance() -> Self {
        Self::default().with_covariance_type(CovarianceType::Full)
    }

    /// Builder-style covariance override.
    pub fn with_covariance_type(mut self, covariance_type: CovarianceType) -> Self {
        self.covariance_type = covariance_type;
        self
    }

    /// EM settings for a regular fit.
    pub fn em_settings(&self) -> EmSettings {
        EmSettings {
            n_iter: self.n_iter,
            tol: self.tol,
            min_covar: self.min_covar,
        }
    }

    /// Validate all fields.
    pub fn validate(&self) -> RegimeResult<()> {
        if self.n_iter == 0 {
            return Err(RegimeError::InvalidParameter {
                parameter: "n_iter".to_string(),
                value: 0.0,
                constraint: "at least one iteration".to_string(),
            });
        }
        validate_parameter(self.tol, 0.0, f64::MAX, "tol")?;
        validate_parameter(self.min_covar, 0.0, f64::MAX, "min_covar")?;
        self.stabilizer.validate()?;
        self.selection.validate()
    }
}

/// Per-observation log-likelihood used by CV folds, rolling surprise and the
/// validation adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PointScoring {
    /// Each row scored on its own under the start distribution:
    /// `ln Σ_j π_j · N(x_t | μ_j, Σ_j)`
    #[default]
    Independent,
    /// One-step predictive `ln p(x_t | x_<t)` after the preceding rows
    Predictive,
}

/// Label stabilizer settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StabilizerConfig {
    /// Weight of the mean distance against the covariance distance
    pub alpha: f64,
    /// Minimum assignment weight for a new regime to inherit an old identity.
    ///
    /// The assignment is hard, so matched pairs carry weight 1 and every value
    /// in [0, 1] accepts all matches. New identities are born only for regimes
    /// left unmatched when K grows.
    pub confident_match: f64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            confident_match: 0.9,
        }
    }
}

impl StabilizerConfig {
    /// Validate all fields.
    pub fn validate(&self) -> RegimeResult<()> {
        validate_parameter(self.alpha, 0.0, 1.0, "alpha")?;
        validate_parameter(self.confident_match, 0.0, 1.0, "confident_match")
    }
}

/// State-count selection settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelectionConfig {
    /// Smallest K considered
    pub k_min: usize,
    /// Largest K considered
    pub k_max: usize,
    /// Cap the BIC/CV search range at the silhouette elbow
    pub elbow_upper_bound: bool,
    /// Rows used for the BIC fits; `None` uses all rows
    pub bic_train_len: Option<usize>,
    /// EM iteration cap for BIC fits
    pub bic_n_iter: usize,
    /// EM tolerance for BIC fits
    pub bic_tol: f64,
    /// Length of the first CV training prefix; `None` uses half the rows
    pub initial_train: Option<usize>,
    /// Rows between consecutive CV fold starts
    pub step: usize,
    /// Rows scored by each CV fold
    pub test_horizon: usize,
    /// EM iteration cap for CV fold fits
    pub cv_n_iter: usize,
    /// EM tolerance for CV fold fits
    pub cv_tol: f64,
    /// A fold is degenerate when a decoded training state has fewer examples
    pub min_class_examples: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            k_min: 2,
            k_max: 6,
            elbow_upper_bound: true,
            bic_train_len: None,
            bic_n_iter: 1000,
            bic_tol: 1e-5,
            initial_train: None,
            step: 12,
            test_horizon: 12,
            cv_n_iter: 500,
            cv_tol: 1e-4,
            min_class_examples: 2,
        }
    }
}

impl SelectionConfig {
    /// Validate all fields.
    pub fn validate(&self) -> RegimeResult<()> {
        if self.k_min == 0 || self.k_min > self.k_max {
            return Err(RegimeError::InvalidParameter {
                parameter: "k_min".to_string(),
                value: self.k_min as f64,
                constraint: format!("[1, k_max = {}]", self.k_max),
            });
        }
        if self.step == 0 || self.test_horizon == 0 {
            return Err(RegimeError::InvalidParameter {
                parameter: "step/test_horizon".to_string(),
                value: self.step.min(self.test_horizon) as f64,
                constraint: "at least one row".to_string(),
            });
        }
        if self.bic_n_iter == 0 || self.cv_n_iter == 0 {
            return Err(RegimeError::InvalidParameter {
                parameter: "bic_n_iter/cv_n_iter".to_string(),
                value: 0.0,
                constraint: "at least one iteration".to_string(),
            });
        }
        validate_parameter(self.bic_tol, 0.0, f64::MAX, "bic_tol")?;
        validate_parameter(self.cv_tol, 0.0, f64::MAX, "cv_tol")
    }
}

/// Rolling inference settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RollingConfig {
    /// Length of the cold-start warm-up window
    pub warm_start_window: usize,
    /// Number of recent one-step log-likelihoods kept for surprise monitoring
    pub surprise_buffer_len: usize,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            warm_start_window: 24,
            surprise_buffer_len: 12,
        }
    }
}

impl RollingConfig {
    /// Validate all fields.
    pub fn validate(&self) -> RegimeResult<()> {
        if self.warm_start_window < 2 {
            return Err(RegimeError::InvalidParameter {
                parameter: "warm_start_window".to_string(),
                value: self.warm_start_window as f64,
                constraint: "at least two rows".to_string(),
            });
        }
        if self.surprise_buffer_len < 2 {
            return Err(RegimeError::InvalidParameter {
                parameter: "surprise_buffer_len".to_string(),
                value: self.surprise_buffer_len as f64,
                constraint: "at least two entries".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RegimeModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.n_iter, 100);
        assert_eq!(config.stabilizer.alpha, 0.7);
        assert_eq!(config.selection.test_horizon, 12);
        assert!(RollingConfig::default().validate().is_ok());
        assert!(RegimeModelConfig::light().validate().is_ok());
        assert_eq!(config.point_scoring, PointScoring::Independent);
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let mut config = RegimeModelConfig::seeded(1);
        config.stabilizer.alpha = 1.5;
        assert!(matches!(
            config.validate(),
            Err(RegimeError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_invalid_selection_range_rejected() {
        let config = SelectionConfig {
            k_min: 5,
            k_max: 3,
            ..SelectionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
