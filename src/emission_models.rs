//! Gaussian emission laws for the hidden regimes.
//!
//! A regime's emission law is a multivariate Gaussian whose covariance
//! structure is fixed per model: either diagonal or full. The two shapes are a
//! tagged union ([`RegimeDistribution`]) so each serializes in its own form.
//! Densities are evaluated through an [`EmissionDensity`], which caches the
//! precision matrix and log-determinant obtained from a Cholesky factorization.

use crate::{
    errors::{RegimeError, RegimeResult},
    math_utils::constants,
    preprocessing::ObservationMatrix,
};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Covariance structure shared by every regime of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CovarianceType {
    /// Independent features, one variance per dimension
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "diag"))]
    Diagonal,
    /// Dense symmetric positive-definite covariance
    Full,
}

/// Gaussian emission law of one hidden state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum RegimeDistribution {
    /// Axis-aligned Gaussian
    Diagonal {
        /// Mean vector
        mean: DVector<f64>,
        /// Per-dimension variances
        variances: DVector<f64>,
    },
    /// Gaussian with full covariance
    Full {
        /// Mean vector
        mean: DVector<f64>,
        /// Covariance matrix
        covariance: DMatrix<f64>,
    },
}

impl RegimeDistribution {
    /// Covariance structure of this distribution.
    pub fn covariance_type(&self) -> CovarianceType {
        match self {
            RegimeDistribution::Diagonal { .. } => CovarianceType::Diagonal,
            RegimeDistribution::Full { .. } => CovarianceType::Full,
        }
    }

    /// Feature dimension.
    pub fn dim(&self) -> usize {
        self.mean().len()
    }

    /// Mean vector.
    pub fn mean(&self) -> &DVector<f64> {
        match self {
            RegimeDistribution::Diagonal { mean, .. } | RegimeDistribution::Full { mean, .. } => {
                mean
            }
        }
    }

    /// Per-dimension variances (the covariance diagonal).
    pub fn variances(&self) -> DVector<f64> {
        match self {
            RegimeDistribution::Diagonal { variances, .. } => variances.clone(),
            RegimeDistribution::Full { covariance, .. } => covariance.diagonal(),
        }
    }

    /// Covariance as a dense matrix; diagonal laws expand to a diagonal matrix.
    pub fn covariance_matrix(&self) -> DMatrix<f64> {
        match self {
            RegimeDistribution::Diagonal { variances, .. } => DMatrix::from_diagonal(variances),
            RegimeDistribution::Full { covariance, .. } => covariance.clone(),
        }
    }

    /// Euclidean distance between the two means.
    pub fn mean_distance(&self, other: &RegimeDistribution) -> f64 {
        (self.mean() - other.mean()).norm()
    }

    /// Frobenius distance between the two covariances.
    pub fn covariance_distance(&self, other: &RegimeDistribution) -> f64 {
        match (self, other) {
            (
                RegimeDistribution::Diagonal { variances: a, .. },
                RegimeDistribution::Diagonal { variances: b, .. },
            ) => (a - b).norm(),
            _ => (self.covariance_matrix() - other.covariance_matrix()).norm(),
        }
    }

    /// Weighted maximum-likelihood estimate from observations.
    ///
    /// `min_covar` is added to every variance. Returns `None` when the total
    /// weight is too small to support an estimate.
    pub fn estimate(
        x: &ObservationMatrix,
        weights: &[f64],
        covariance_type: CovarianceType,
        min_covar: f64,
    ) -> Option<Self> {
        let d = x.num_cols();
        let weight_sum: f64 = weights.iter().sum();
        if !(weight_sum > 1e-10) {
            return None;
        }
        let inv_weight_sum = 1.0 / weight_sum;

        let mut mean = DVector::zeros(d);
        for (row, &w) in x.rows().zip(weights) {
            for k in 0..d {
                mean[k] += w * row[k];
            }
        }
        mean *= inv_weight_sum;

        match covariance_type {
            CovarianceType::Diagonal => {
                let mut variances = DVector::zeros(d);
                for (row, &w) in x.rows().zip(weights) {
                    for k in 0..d {
                        let diff = row[k] - mean[k];
                        variances[k] += w * diff * diff;
                    }
                }
                variances.apply(|v| *v = *v * inv_weight_sum + min_covar);
                Some(RegimeDistribution::Diagonal { mean, variances })
            }
            CovarianceType::Full => {
                let mut covariance = DMatrix::zeros(d, d);
                let mut diff = vec![0.0; d];
                for (row, &w) in x.rows().zip(weights) {
                    for k in 0..d {
                        diff[k] = row[k] - mean[k];
                    }
                    // upper triangle, mirrored below
                    for p in 0..d {
                        for q in p..d {
                            let contribution = w * diff[p] * diff[q];
                            covariance[(p, q)] += contribution;
                            if p != q {
                                covariance[(q, p)] += contribution;
                            }
                        }
                    }
                }
                covariance *= inv_weight_sum;
                for k in 0..d {
                    covariance[(k, k)] += min_covar;
                }
                Some(RegimeDistribution::Full { mean, covariance })
            }
        }
    }

    /// Same law with the covariance structure converted to `covariance_type`.
    ///
    /// Converting full to diagonal drops the off-diagonal terms.
    pub fn with_covariance_type(self, covariance_type: CovarianceType) -> Self {
        match (self, covariance_type) {
            (RegimeDistribution::Full { mean, covariance }, CovarianceType::Diagonal) => {
                RegimeDistribution::Diagonal {
                    variances: covariance.diagonal(),
                    mean,
                }
            }
            (RegimeDistribution::Diagonal { mean, variances }, CovarianceType::Full) => {
                RegimeDistribution::Full {
                    covariance: DMatrix::from_diagonal(&variances),
                    mean,
                }
            }
            (same, _) => same,
        }
    }

    /// Factorize the covariance and cache what density evaluation needs.
    pub fn density(&self) -> RegimeResult<EmissionDensity> {
        let d = self.dim();
        let (precision, log_det) = match self {
            RegimeDistribution::Diagonal { variances, .. } => {
                if let Some(bad) = variances.iter().find(|v| !(**v > 0.0) || !v.is_finite()) {
                    return Err(RegimeError::NumericalError {
                        reason: format!("Variance must be positive and finite, got {}", bad),
                        operation: Some("emission density".to_string()),
                    });
                }
                let precision = DMatrix::from_diagonal(&variances.map(|v| 1.0 / v));
                let log_det = variances.iter().map(|v| v.ln()).sum::<f64>();
                (precision, log_det)
            }
            RegimeDistribution::Full { covariance, .. } => {
                if covariance.iter().any(|v| !v.is_finite()) {
                    return Err(RegimeError::NumericalError {
                        reason: "Covariance matrix contains non-finite entries".to_string(),
                        operation: Some("emission density".to_string()),
                    });
                }
                let cholesky = factorize_with_regularization(covariance)?;
                let log_det =
                    2.0 * cholesky.l_dirty().diagonal().iter().map(|x| x.ln()).sum::<f64>();
                (cholesky.inverse(), log_det)
            }
        };

        Ok(EmissionDensity {
            mean: self.mean().clone(),
            precision,
            log_norm: -0.5 * (d as f64 * constants::LN_2PI + log_det),
            diagonal: self.covariance_type() == CovarianceType::Diagonal,
        })
    }
}

/// Cholesky factorization with progressive diagonal regularization.
pub(crate) fn factorize_with_regularization(
    covariance: &DMatrix<f64>,
) -> RegimeResult<Cholesky<f64, Dyn>> {
    if let Some(chol) = Cholesky::new(covariance.clone()) {
        return Ok(chol);
    }

    let n = covariance.nrows();
    let regularization_levels = [
        constants::MATRIX_REGULARIZATION,
        constants::MATRIX_REGULARIZATION * 10.0,
        constants::MATRIX_REGULARIZATION * 100.0,
        1e-6,
        1e-4,
        1e-2,
    ];
    for &reg_level in &regularization_levels {
        let regularized = covariance + DMatrix::identity(n, n) * reg_level;
        if let Some(chol) = Cholesky::new(regularized) {
            log::warn!(
                "Covariance not positive definite; regularized diagonal by {:.1e}",
                reg_level
            );
            return Ok(chol);
        }
    }

    Err(RegimeError::NumericalError {
        reason: "Cannot compute Cholesky decomposition even with progressive regularization"
            .to_string(),
        operation: Some("emission density".to_string()),
    })
}

/// Prepared Gaussian density with cached precision and normalizer.
#[derive(Debug, Clone)]
pub struct EmissionDensity {
    mean: DVector<f64>,
    precision: DMatrix<f64>,
    log_norm: f64,
    diagonal: bool,
}

impl EmissionDensity {
    /// Log-density of one observation.
    pub fn log_pdf(&self, x: &[f64]) -> f64 {
        let d = self.mean.len();
        let mut mahalanobis_sq = 0.0;
        if self.diagonal {
            for k in 0..d {
                let diff = x[k] - self.mean[k];
                mahalanobis_sq += diff * diff * self.precision[(k, k)];
            }
        } else {
            for p in 0..d {
                let dp = x[p] - self.mean[p];
                for q in 0..d {
                    mahalanobis_sq += dp * self.precision[(p, q)] * (x[q] - self.mean[q]);
                }
            }
        }
        self.log_norm - 0.5 * mahalanobis_sq
    }

    /// Cached log normalizer `-(d ln 2π + ln|Σ|) / 2`.
    pub fn log_norm(&self) -> f64 {
        self.log_norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn unit_diagonal(d: usize) -> RegimeDistribution {
        RegimeDistribution::Diagonal {
            mean: DVector::zeros(d),
            variances: DVector::from_element(d, 1.0),
        }
    }

    #[test]
    fn test_standard_normal_log_pdf() {
        let density = unit_diagonal(2).density().unwrap();
        assert_approx_eq!(density.log_pdf(&[0.0, 0.0]), -constants::LN_2PI, 1e-12);
        assert_approx_eq!(
            density.log_pdf(&[1.0, 0.0]),
            -constants::LN_2PI - 0.5,
            1e-12
        );
    }

    #[test]
    fn test_full_and_diagonal_agree_on_diagonal_covariance() {
        let diag = RegimeDistribution::Diagonal {
            mean: DVector::from_vec(vec![1.0, -1.0]),
            variances: DVector::from_vec(vec![2.0, 0.5]),
        };
        let full = diag.clone().with_covariance_type(CovarianceType::Full);
        let x = [0.3, 0.7];
        assert_approx_eq!(
            diag.density().unwrap().log_pdf(&x),
            full.density().unwrap().log_pdf(&x),
            1e-10
        );
    }

    #[test]
    fn test_full_covariance_with_correlation() {
        let full = RegimeDistribution::Full {
            mean: DVector::zeros(2),
            covariance: DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]),
        };
        let density = full.density().unwrap();
        // |Σ| = 0.75, Σ⁻¹ = [[4/3, -2/3], [-2/3, 4/3]]
        let expected = -constants::LN_2PI - 0.5 * 0.75f64.ln() - 0.5 * (4.0 / 3.0);
        assert_approx_eq!(density.log_pdf(&[1.0, 0.0]), expected, 1e-10);
    }

    #[test]
    fn test_singular_covariance_is_regularized() {
        let singular = RegimeDistribution::Full {
            mean: DVector::zeros(2),
            covariance: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]),
        };
        let density = singular.density().unwrap();
        assert!(density.log_pdf(&[0.1, 0.1]).is_finite());
    }

    #[test]
    fn test_non_positive_variance_rejected() {
        let bad = RegimeDistribution::Diagonal {
            mean: DVector::zeros(1),
            variances: DVector::from_element(1, 0.0),
        };
        assert!(matches!(
            bad.density(),
            Err(RegimeError::NumericalError { .. })
        ));
    }

    #[test]
    fn test_weighted_estimate() {
        let x = ObservationMatrix::from_rows(vec![vec![0.0], vec![2.0], vec![100.0]]).unwrap();
        let est = RegimeDistribution::estimate(&x, &[1.0, 1.0, 0.0], CovarianceType::Diagonal, 0.0)
            .unwrap();
        assert_approx_eq!(est.mean()[0], 1.0, 1e-12);
        assert_approx_eq!(est.variances()[0], 1.0, 1e-12);

        assert!(
            RegimeDistribution::estimate(&x, &[0.0, 0.0, 0.0], CovarianceType::Full, 1e-3)
                .is_none()
        );
    }

    #[test]
    fn test_distances() {
        let a = unit_diagonal(2);
        let b = RegimeDistribution::Diagonal {
            mean: DVector::from_vec(vec![3.0, 4.0]),
            variances: DVector::from_vec(vec![1.0, 3.0]),
        };
        assert_approx_eq!(a.mean_distance(&b), 5.0, 1e-12);
        assert_approx_eq!(a.covariance_distance(&b), 2.0, 1e-12);

        let b_full = b.clone().with_covariance_type(CovarianceType::Full);
        assert_approx_eq!(a.covariance_distance(&b_full), 2.0, 1e-12);
        assert_eq!(a.mean_distance(&a), 0.0);
    }
}
