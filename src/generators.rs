//! Synthetic regime-switching data for testing and validation.
//!
//! ## Available Generators
//!
//! - **Gaussian HMM sampler**: draws a state path from a [`GaussianHmm`] and
//!   emits one Gaussian observation per step
//! - **Block switching**: regimes take turns in fixed-length blocks, so the
//!   true switch points are known exactly
//! - **Well-separated HMM**: a K-state model whose regimes are far apart along
//!   the first feature, for model-selection studies
//!
//! All generators are reproducible for a fixed seed.

use crate::{
    emission_models::{factorize_with_regularization, RegimeDistribution},
    errors::{validate_parameter, RegimeError, RegimeResult},
    hmm_core::GaussianHmm,
    preprocessing::ObservationMatrix,
    secure_rng::SecureRng,
};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration parameters for synthetic series generation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeneratorConfig {
    /// Length of the generated series
    pub length: usize,
    /// Random seed for reproducible generation
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            length: 1000,
            seed: None,
        }
    }
}

/// Generated observations together with the hidden states that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSeries {
    /// T×D observations
    pub observations: ObservationMatrix,
    /// Zero-based generating state per row
    pub states: Vec<usize>,
}

impl SyntheticSeries {
    /// Rows where the generating state changes.
    pub fn switch_points(&self) -> Vec<usize> {
        (1..self.states.len())
            .filter(|&t| self.states[t] != self.states[t - 1])
            .collect()
    }
}

/// One regime of a block-switching series.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockRegime {
    /// Mean per feature
    pub mean: Vec<f64>,
    /// Standard deviation per feature
    pub std_dev: Vec<f64>,
}

fn draw_categorical(rng: &mut SecureRng, probs: &[f64]) -> usize {
    let u = rng.f64();
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

fn standard_normal_vector(rng: &mut SecureRng, dim: usize) -> DVector<f64> {
    DVector::from_fn(dim, |_, _| rng.inner_mut().sample::<f64, _>(StandardNormal))
}

/// Sample `config.length` observations from a Gaussian HMM.
///
/// # Arguments
/// * `config` - Length and seed
/// * `hmm` - Model to sample from; must be internally consistent
///
/// # Returns
/// * `Ok(SyntheticSeries)` - Observations and the sampled state path
/// * `Err` - If the model is inconsistent or a covariance cannot be factorized
pub fn generate_hmm_series(
    config: &GeneratorConfig,
    hmm: &GaussianHmm,
) -> RegimeResult<SyntheticSeries> {
    hmm.check_consistency()
        .map_err(|reason| RegimeError::InvalidParameter {
            parameter: "hmm".to_string(),
            value: hmm.num_states() as f64,
            constraint: reason,
        })?;
    let mut rng = SecureRng::from_optional_seed(config.seed);
    let dim = hmm.dim();

    // Cholesky factors for correlated draws
    let factors = hmm
        .emissions
        .iter()
        .map(|e| match e {
            RegimeDistribution::Diagonal { variances, .. } => {
                Ok(DMatrix::from_diagonal(&variances.map(f64::sqrt)))
            }
            RegimeDistribution::Full { covariance, .. } => {
                factorize_with_regularization(covariance).map(|c| c.l())
            }
        })
        .collect::<RegimeResult<Vec<_>>>()?;

    let mut data = Vec::with_capacity(config.length * dim);
    let mut states = Vec::with_capacity(config.length);
    let mut state = draw_categorical(&mut rng, &hmm.start_probs);
    for t in 0..config.length {
        if t > 0 {
            state = draw_categorical(&mut rng, &hmm.transition_matrix[state]);
        }
        let noise = standard_normal_vector(&mut rng, dim);
        let x = hmm.emissions[state].mean() + &factors[state] * noise;
        data.extend(x.iter());
        states.push(state);
    }

    Ok(SyntheticSeries {
        observations: ObservationMatrix::from_row_major(data, dim)?,
        states,
    })
}

/// Regimes take turns in blocks of `block_length` rows, cycling in order.
///
/// Switch points fall exactly on multiples of `block_length`.
pub fn generate_block_switching_series(
    config: &GeneratorConfig,
    regimes: &[BlockRegime],
    block_length: usize,
) -> RegimeResult<SyntheticSeries> {
    let dim = regimes.first().map_or(0, |r| r.mean.len());
    if regimes.is_empty() || dim == 0 {
        return Err(RegimeError::InvalidParameter {
            parameter: "regimes".to_string(),
            value: regimes.len() as f64,
            constraint: "at least one regime with at least one feature".to_string(),
        });
    }
    if block_length == 0 {
        return Err(RegimeError::InvalidParameter {
            parameter: "block_length".to_string(),
            value: 0.0,
            constraint: "at least one row".to_string(),
        });
    }
    for regime in regimes {
        if regime.mean.len() != dim || regime.std_dev.len() != dim {
            return Err(RegimeError::DimensionMismatch {
                expected: dim,
                actual: regime.mean.len().min(regime.std_dev.len()),
            });
        }
        for &sd in &regime.std_dev {
            validate_parameter(sd, 0.0, f64::MAX, "std_dev")?;
        }
    }

    let mut rng = SecureRng::from_optional_seed(config.seed);
    let mut data = Vec::with_capacity(config.length * dim);
    let mut states = Vec::with_capacity(config.length);
    for t in 0..config.length {
        let state = (t / block_length) % regimes.len();
        let regime = &regimes[state];
        for j in 0..dim {
            let z: f64 = rng.inner_mut().sample(StandardNormal);
            data.push(regime.mean[j] + regime.std_dev[j] * z);
        }
        states.push(state);
    }

    Ok(SyntheticSeries {
        observations: ObservationMatrix::from_row_major(data, dim)?,
        states,
    })
}

/// K-state diagonal HMM with unit variances and means `separation` apart
/// along the first feature.
///
/// Every state stays put with probability `persistence` and otherwise moves
/// uniformly to one of the other states.
pub fn well_separated_hmm(
    num_states: usize,
    dim: usize,
    separation: f64,
    persistence: f64,
) -> RegimeResult<GaussianHmm> {
    if num_states == 0 || dim == 0 {
        return Err(RegimeError::InvalidParameter {
            parameter: "num_states/dim".to_string(),
            value: num_states.min(dim) as f64,
            constraint: "at least one".to_string(),
        });
    }
    validate_parameter(persistence, 0.0, 1.0, "persistence")?;

    let k = num_states;
    let transition_matrix = (0..k)
        .map(|i| {
            (0..k)
                .map(|j| {
                    if k == 1 {
                        1.0
                    } else if i == j {
                        persistence
                    } else {
                        (1.0 - persistence) / (k - 1) as f64
                    }
                })
                .collect()
        })
        .collect();
    let emissions = (0..k)
        .map(|i| RegimeDistribution::Diagonal {
            mean: DVector::from_fn(dim, |j, _| if j == 0 { i as f64 * separation } else { 0.0 }),
            variances: DVector::from_element(dim, 1.0),
        })
        .collect();

    Ok(GaussianHmm {
        start_probs: vec![1.0 / k as f64; k],
        transition_matrix,
        emissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math_utils::mean;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_block_switching_layout() {
        let config = GeneratorConfig {
            length: 100,
            seed: Some(1),
        };
        let regimes = vec![
            BlockRegime {
                mean: vec![0.0, 1.0],
                std_dev: vec![0.1, 0.1],
            },
            BlockRegime {
                mean: vec![5.0, -1.0],
                std_dev: vec![0.1, 0.1],
            },
        ];
        let series = generate_block_switching_series(&config, &regimes, 25).unwrap();
        assert_eq!(series.observations.num_rows(), 100);
        assert_eq!(series.observations.num_cols(), 2);
        assert_eq!(series.switch_points(), vec![25, 50, 75]);

        let first_block: Vec<f64> = series.observations.prefix(25).column(0);
        assert_approx_eq!(mean(&first_block), 0.0, 0.1);
    }

    #[test]
    fn test_block_switching_rejects_ragged_regimes() {
        let regimes = vec![
            BlockRegime {
                mean: vec![0.0, 1.0],
                std_dev: vec![0.1, 0.1],
            },
            BlockRegime {
                mean: vec![5.0],
                std_dev: vec![0.1],
            },
        ];
        let result = generate_block_switching_series(&GeneratorConfig::default(), &regimes, 10);
        assert!(result.is_err());
    }

    #[test]
    fn test_hmm_sampler_is_reproducible() {
        let hmm = well_separated_hmm(3, 2, 6.0, 0.95).unwrap();
        let config = GeneratorConfig {
            length: 300,
            seed: Some(11),
        };
        let a = generate_hmm_series(&config, &hmm).unwrap();
        let b = generate_hmm_series(&config, &hmm).unwrap();
        assert_eq!(a, b);
        assert!(a.states.iter().all(|&s| s < 3));
        // sticky chain: far fewer switches than rows
        assert!(a.switch_points().len() < 60);
    }

    #[test]
    fn test_well_separated_hmm_is_consistent() {
        let hmm = well_separated_hmm(4, 3, 5.0, 0.9).unwrap();
        assert!(hmm.check_consistency().is_ok());
        assert_approx_eq!(hmm.emissions[3].mean()[0], 15.0, 1e-12);
        assert!(well_separated_hmm(2, 1, 1.0, 1.5).is_err());
    }
}
