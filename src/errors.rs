//! Error types and validation functions for regime detection.
//!
//! This module provides the error taxonomy shared by every stage of the
//! pipeline (model fitting, state-count selection, label stabilization and
//! rolling inference), plus the input validation helpers used at API
//! boundaries.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for regime detection operations.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RegimeError {
    /// Too few observations for the requested number of states.
    #[error("Insufficient samples: need more than {required} observations for {states} states, got {actual}")]
    InputShape {
        /// Number of observations that must be exceeded
        required: usize,
        /// Actual number of observations provided
        actual: usize,
        /// Requested number of states
        states: usize,
    },

    /// Observation dimensionality differs from the model's fixed dimension.
    #[error("Dimension mismatch: model expects {expected} features, got {actual}")]
    DimensionMismatch {
        /// Feature count the model was fitted with
        expected: usize,
        /// Feature count provided
        actual: usize,
    },

    /// Invalid parameter value for a configuration field.
    #[error("Invalid parameter: {parameter} = {value}, expected {constraint}")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value provided
        value: f64,
        /// Valid range or constraint description
        constraint: String,
    },

    /// Numerical computation error due to instability.
    #[error("Numerical computation failed: {reason}")]
    NumericalError {
        /// Detailed reason for numerical failure
        reason: String,
        /// Operation that failed
        operation: Option<String>,
    },

    /// The label-matching optimization could not be solved.
    #[error("Infeasible label assignment: {reason}")]
    InfeasibleAssignment {
        /// Why the assignment failed
        reason: String,
    },

    /// A cross-validation fold or rolling window cannot be evaluated.
    #[error("Degenerate fold {fold_index}: {reason}")]
    DegenerateFold {
        /// Index of the offending fold or window
        fold_index: usize,
        /// Why the fold was rejected
        reason: String,
    },

    /// Model selection failed because no candidate could be evaluated.
    #[error("Model selection failed: {reason}")]
    ModelSelectionFailed {
        /// Reason for failure
        reason: String,
    },

    /// An operation that needs fitted parameters was called on a fresh model.
    #[error("Model not fitted: {operation} requires a fitted model")]
    NotFitted {
        /// Operation that was attempted
        operation: String,
    },

    /// A snapshot could not be restored.
    #[error("Invalid snapshot: {reason}")]
    SnapshotError {
        /// What is inconsistent in the snapshot
        reason: String,
    },
}

/// Result type for regime detection operations.
pub type RegimeResult<T> = Result<T, RegimeError>;

/// Record of an EM run that stopped at the iteration cap.
///
/// This is not an error: the fit keeps the best iterate and the condition is
/// reported through [`crate::regime_results::FitReport`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NonConvergenceCondition {
    /// Number of EM iterations performed
    pub iterations: usize,
    /// Log-likelihood change of the final iteration
    pub last_improvement: f64,
    /// Log-likelihood of the retained iterate
    pub best_log_likelihood: f64,
}

/// Validates that an observation matrix has enough rows for `num_states` states.
///
/// The heuristic requires strictly more than `num_states * min_samples_per_state`
/// observations.
///
/// # Example
/// ```rust
/// use regime_engine::errors::validate_observation_shape;
///
/// assert!(validate_observation_shape(10, 2, 3).is_ok());
/// assert!(validate_observation_shape(6, 2, 3).is_err());
/// ```
pub fn validate_observation_shape(
    num_rows: usize,
    num_states: usize,
    min_samples_per_state: usize,
) -> RegimeResult<()> {
    let required = num_states * min_samples_per_state;
    if num_rows <= required || num_rows < 2 {
        return Err(RegimeError::InputShape {
            required: required.max(1),
            actual: num_rows,
            states: num_states,
        });
    }
    Ok(())
}

/// Validates that a parameter is within expected bounds (inclusive).
///
/// # Example
/// ```rust
/// use regime_engine::errors::validate_parameter;
///
/// assert!(validate_parameter(0.7, 0.0, 1.0, "alpha").is_ok());
/// assert!(validate_parameter(1.5, 0.0, 1.0, "alpha").is_err());
/// ```
pub fn validate_parameter(value: f64, min: f64, max: f64, name: &str) -> RegimeResult<()> {
    if value.is_nan() {
        return Err(RegimeError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: "must not be NaN".to_string(),
        });
    }

    if min.is_nan() || max.is_nan() || min > max {
        return Err(RegimeError::NumericalError {
            reason: format!(
                "Invalid bounds for parameter {}: min={}, max={}",
                name, min, max
            ),
            operation: None,
        });
    }

    if value < min || value > max {
        Err(RegimeError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: format!("[{}, {}]", min, max),
        })
    } else {
        Ok(())
    }
}

/// Validates that all values in a slice are finite.
///
/// Returns on the first non-finite value, naming its position.
pub fn validate_all_finite(data: &[f64], name: &str) -> RegimeResult<()> {
    if let Some((i, &value)) = data.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(RegimeError::NumericalError {
            reason: format!(
                "{} contains non-finite value at index {}: {}",
                name, i, value
            ),
            operation: None,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_shape_requires_strictly_more_rows() {
        assert!(validate_observation_shape(7, 2, 3).is_ok());

        match validate_observation_shape(6, 2, 3) {
            Err(RegimeError::InputShape {
                required,
                actual,
                states,
            }) => {
                assert_eq!(required, 6);
                assert_eq!(actual, 6);
                assert_eq!(states, 2);
            }
            other => panic!("Expected InputShape error, got {:?}", other),
        }
    }

    #[test]
    fn test_observation_shape_single_row_rejected() {
        assert!(validate_observation_shape(1, 1, 0).is_err());
    }

    #[test]
    fn test_validate_parameter_out_of_range() {
        match validate_parameter(1.5, 0.0, 1.0, "alpha") {
            Err(RegimeError::InvalidParameter {
                parameter,
                value,
                constraint,
            }) => {
                assert_eq!(parameter, "alpha");
                assert_eq!(value, 1.5);
                assert_eq!(constraint, "[0, 1]");
            }
            other => panic!("Expected InvalidParameter error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_parameter_nan_inputs() {
        assert!(matches!(
            validate_parameter(f64::NAN, 0.0, 1.0, "tol"),
            Err(RegimeError::InvalidParameter { .. })
        ));
        assert!(matches!(
            validate_parameter(0.5, 1.0, 0.0, "tol"),
            Err(RegimeError::NumericalError { .. })
        ));
    }

    #[test]
    fn test_validate_all_finite_reports_index() {
        let bad = vec![1.0, 2.0, f64::INFINITY];
        match validate_all_finite(&bad, "row") {
            Err(RegimeError::NumericalError { reason, .. }) => {
                assert!(reason.contains("row"));
                assert!(reason.contains("index 2"));
            }
            other => panic!("Expected NumericalError, got {:?}", other),
        }
        assert!(validate_all_finite(&[], "empty").is_ok());
    }

    #[test]
    fn test_error_display_formatting() {
        let err = RegimeError::InputShape {
            required: 6,
            actual: 4,
            states: 2,
        };
        let text = err.to_string();
        assert!(text.contains("Insufficient samples"));
        assert!(text.contains('6'));
        assert!(text.contains('4'));

        let err = RegimeError::DegenerateFold {
            fold_index: 3,
            reason: "state 2 has 1 example".to_string(),
        };
        assert!(err.to_string().contains("fold 3"));
    }
}
