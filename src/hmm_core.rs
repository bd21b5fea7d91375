//! Core Gaussian Hidden Markov Model kernels.
//!
//! This module contains the HMM parameter container and its algorithms:
//! scaled forward-backward, Viterbi decoding and Baum-Welch (EM) estimation.
//! Everything here works on internal state indices; stable regime identities
//! are layered on top by [`crate::regime_model::RegimeModel`].
//!
//! The forward pass works in the log domain: each step's normalizer is
//! `ln p(x_t | x_<t)`, so the per-point predictive log-likelihoods fall out of
//! the same recursion that produces the total log-likelihood.

use crate::{
    clustering::ClusterSeeds,
    emission_models::{CovarianceType, EmissionDensity, RegimeDistribution},
    errors::{NonConvergenceCondition, RegimeError, RegimeResult},
    math_utils::{constants, log_sum_exp, normalize_in_place},
    preprocessing::ObservationMatrix,
};
use nalgebra::DVector;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest exponent passed to `exp` in the backward recursion.
const MAX_EXP_ARG: f64 = 700.0;

/// Iteration cap and convergence threshold of the stationary-distribution
/// power iteration.
const STATIONARY_MAX_ITER: usize = 10_000;
const STATIONARY_TOLERANCE: f64 = 1e-12;

/// Gaussian HMM parameters over internal state indices.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussianHmm {
    /// Initial state probabilities
    pub start_probs: Vec<f64>,
    /// Transition probability matrix (state i to state j)
    pub transition_matrix: Vec<Vec<f64>>,
    /// Emission law of each state
    pub emissions: Vec<RegimeDistribution>,
}

/// Forward pass output.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Filtered state distributions `p(s_t | x_≤t)`
    pub alpha: Vec<Vec<f64>>,
    /// One-step predictive log-likelihoods `ln p(x_t | x_<t)`
    pub point_log_likelihoods: Vec<f64>,
}

impl ForwardPass {
    /// Total log-likelihood of the sequence.
    pub fn log_likelihood(&self) -> f64 {
        self.point_log_likelihoods.iter().sum()
    }

    /// Filtered distribution at the final observation.
    pub fn last_filtered(&self) -> Option<&[f64]> {
        self.alpha.last().map(|v| v.as_slice())
    }
}

/// Smoothed posteriors and sufficient statistics from forward-backward.
#[derive(Debug, Clone)]
pub struct Posteriors {
    /// Smoothed state distributions `p(s_t | x_1..T)`, rows sum to one
    pub gamma: Vec<Vec<f64>>,
    /// Expected transition counts summed over time
    pub expected_transitions: Vec<Vec<f64>>,
    /// Forward pass the posteriors were computed from
    pub forward: ForwardPass,
}

impl Posteriors {
    /// Total log-likelihood of the sequence.
    pub fn log_likelihood(&self) -> f64 {
        self.forward.log_likelihood()
    }
}

/// Outcome of a Baum-Welch run.
#[derive(Debug, Clone, PartialEq)]
pub struct EmOutcome {
    /// E-steps performed
    pub iterations: usize,
    /// Log-likelihood of the retained parameters
    pub log_likelihood: f64,
    /// True when |ΔLL| fell below the tolerance
    pub converged: bool,
    /// Recorded when the iteration cap was reached
    pub non_convergence: Option<NonConvergenceCondition>,
}

/// Baum-Welch stopping rule and covariance floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmSettings {
    /// Iteration cap
    pub n_iter: usize,
    /// Convergence threshold on |ΔLL|
    pub tol: f64,
    /// Added to every variance in the M-step
    pub min_covar: f64,
}

impl GaussianHmm {
    /// Cold-start parameters: uniform start and transition probabilities,
    /// emissions estimated from a hard cluster assignment.
    ///
    /// Clusters with fewer than two members take their centroid as mean and
    /// the pooled covariance of all observations.
    pub fn from_clusters(
        x: &ObservationMatrix,
        seeds: &ClusterSeeds,
        covariance_type: CovarianceType,
        min_covar: f64,
    ) -> RegimeResult<Self> {
        let k = seeds.centroids.len();
        if k == 0 {
            return Err(RegimeError::InvalidParameter {
                parameter: "num_states".to_string(),
                value: 0.0,
                constraint: "at least one state".to_string(),
            });
        }

        let pooled = RegimeDistribution::estimate(
            x,
            &vec![1.0; x.num_rows()],
            covariance_type,
            min_covar,
        )
        .ok_or_else(|| RegimeError::InputShape {
            required: 1,
            actual: x.num_rows(),
            states: k,
        })?;

        let sizes = seeds.cluster_sizes();
        let mut emissions = Vec::with_capacity(k);
        for (state, centroid) in seeds.centroids.iter().enumerate() {
            let estimated = if sizes[state] >= 2 {
                let weights: Vec<f64> = seeds
                    .assignments
                    .iter()
                    .map(|&a| if a == state { 1.0 } else { 0.0 })
                    .collect();
                RegimeDistribution::estimate(x, &weights, covariance_type, min_covar)
            } else {
                None
            };
            let emission = match estimated {
                Some(e) => e,
                None => with_mean(&pooled, DVector::from_column_slice(centroid)),
            };
            emissions.push(emission);
        }

        let uniform = 1.0 / k as f64;
        Ok(Self {
            start_probs: vec![uniform; k],
            transition_matrix: vec![vec![uniform; k]; k],
            emissions,
        })
    }

    /// Number of hidden states.
    pub fn num_states(&self) -> usize {
        self.start_probs.len()
    }

    /// Observation dimension.
    pub fn dim(&self) -> usize {
        self.emissions.first().map_or(0, |e| e.dim())
    }

    /// Covariance structure of the emissions.
    pub fn covariance_type(&self) -> CovarianceType {
        self.emissions
            .first()
            .map_or(CovarianceType::default(), |e| e.covariance_type())
    }

    /// Checks shapes, stochasticity and emission consistency.
    pub fn check_consistency(&self) -> Result<(), String> {
        let k = self.num_states();
        if k == 0 {
            return Err("model has no states".to_string());
        }
        if self.transition_matrix.len() != k || self.emissions.len() != k {
            return Err(format!(
                "expected {} transition rows and emissions, got {} and {}",
                k,
                self.transition_matrix.len(),
                self.emissions.len()
            ));
        }
        check_distribution(&self.start_probs, "start probabilities")?;
        for (i, row) in self.transition_matrix.iter().enumerate() {
            if row.len() != k {
                return Err(format!("transition row {} has {} entries", i, row.len()));
            }
            check_distribution(row, &format!("transition row {}", i))?;
        }
        let d = self.dim();
        let covariance_type = self.covariance_type();
        for (i, e) in self.emissions.iter().enumerate() {
            if e.dim() != d || e.covariance_type() != covariance_type {
                return Err(format!("emission {} differs in shape from emission 0", i));
            }
            if let RegimeDistribution::Full { covariance, .. } = e {
                if covariance.nrows() != d || covariance.ncols() != d {
                    return Err(format!("emission {} covariance is not {}x{}", i, d, d));
                }
            }
            if let RegimeDistribution::Diagonal { variances, .. } = e {
                if variances.len() != d {
                    return Err(format!("emission {} has {} variances", i, variances.len()));
                }
            }
        }
        Ok(())
    }

    fn check_input(&self, x: &ObservationMatrix) -> RegimeResult<()> {
        if x.is_empty() {
            return Err(RegimeError::InputShape {
                required: 1,
                actual: 0,
                states: self.num_states(),
            });
        }
        if x.num_cols() != self.dim() {
            return Err(RegimeError::DimensionMismatch {
                expected: self.dim(),
                actual: x.num_cols(),
            });
        }
        Ok(())
    }

    /// Prepared emission densities, one per state.
    pub fn densities(&self) -> RegimeResult<Vec<EmissionDensity>> {
        self.emissions.iter().map(|e| e.density()).collect()
    }

    /// Emission log-densities, T×K.
    pub fn log_emissions(&self, x: &ObservationMatrix) -> RegimeResult<Vec<Vec<f64>>> {
        self.check_input(x)?;
        let densities = self.densities()?;
        Ok(x
            .rows()
            .map(|row| densities.iter().map(|d| d.log_pdf(row)).collect())
            .collect())
    }

    /// Distribution of the next state given the current filtered distribution.
    pub fn predict_next(&self, filtered: &[f64]) -> Vec<f64> {
        let k = self.num_states();
        let mut next = vec![0.0; k];
        for (i, &p) in filtered.iter().enumerate() {
            for j in 0..k {
                next[j] += p * self.transition_matrix[i][j];
            }
        }
        normalize_in_place(&mut next);
        next
    }

    /// Forward pass starting from the model's start probabilities.
    pub fn forward(&self, x: &ObservationMatrix) -> RegimeResult<ForwardPass> {
        let log_b = self.log_emissions(x)?;
        Ok(self.forward_from(&log_b, &self.start_probs))
    }

    /// Forward pass of `x` after having observed `context`.
    ///
    /// The first row of `x` is predicted from the filtered distribution at the
    /// end of `context`, so the returned point log-likelihoods are
    /// out-of-sample scores conditioned on the context window.
    pub fn forward_continuation(
        &self,
        context: &ObservationMatrix,
        x: &ObservationMatrix,
    ) -> RegimeResult<ForwardPass> {
        let prior = if context.is_empty() {
            self.start_probs.clone()
        } else {
            let context_pass = self.forward(context)?;
            let filtered = context_pass
                .last_filtered()
                .unwrap_or(self.start_probs.as_slice());
            self.predict_next(filtered)
        };
        let log_b = self.log_emissions(x)?;
        Ok(self.forward_from(&log_b, &prior))
    }

    fn forward_from(&self, log_b: &[Vec<f64>], prior: &[f64]) -> ForwardPass {
        let t_len = log_b.len();
        let k = self.num_states();
        let mut alpha = Vec::with_capacity(t_len);
        let mut point_log_likelihoods = Vec::with_capacity(t_len);
        let mut predicted = prior.to_vec();
        let mut joint = vec![0.0; k];

        for row in log_b {
            for j in 0..k {
                joint[j] = predicted[j].max(0.0).ln() + row[j];
            }
            let log_c = log_sum_exp(&joint);
            let mut filtered: Vec<f64> = if log_c.is_finite() {
                joint.iter().map(|v| (v - log_c).exp()).collect()
            } else {
                vec![1.0 / k as f64; k]
            };
            normalize_in_place(&mut filtered);
            point_log_likelihoods.push(log_c.max(-f64::MAX));
            predicted = self.predict_next(&filtered);
            alpha.push(filtered);
        }

        ForwardPass {
            alpha,
            point_log_likelihoods,
        }
    }

    /// Long-run state distribution of the transition matrix.
    ///
    /// Power iteration on the lazy chain `(I + A) / 2`, which has the same
    /// stationary distribution and also converges for periodic chains.
    pub fn stationary_distribution(&self) -> Vec<f64> {
        let k = self.num_states();
        let mut pi = vec![1.0 / k.max(1) as f64; k];
        for _ in 0..STATIONARY_MAX_ITER {
            let stepped = self.predict_next(&pi);
            let next: Vec<f64> = pi.iter().zip(&stepped).map(|(a, b)| 0.5 * (a + b)).collect();
            let change = next
                .iter()
                .zip(&pi)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            pi = next;
            if change < STATIONARY_TOLERANCE {
                break;
            }
        }
        pi
    }

    /// Log-likelihood of every row of `x` scored on its own under the
    /// stationary distribution π: `ln Σ_j π_j · N(x_t | μ_j, Σ_j)`.
    ///
    /// The start probabilities are not used: after EM on one sequence they
    /// collapse onto the state of its first row.
    pub fn independent_log_likelihoods(&self, x: &ObservationMatrix) -> RegimeResult<Vec<f64>> {
        let log_pi: Vec<f64> = self
            .stationary_distribution()
            .iter()
            .map(|p| p.max(0.0).ln())
            .collect();
        Ok(self
            .log_emissions(x)?
            .iter()
            .map(|row| {
                let joint: Vec<f64> = row.iter().zip(&log_pi).map(|(b, pi)| b + pi).collect();
                log_sum_exp(&joint).max(-f64::MAX)
            })
            .collect())
    }

    /// Start and transition probabilities mixed with `epsilon` of the uniform
    /// distribution.
    ///
    /// Baum-Welch never moves a probability that is exactly zero, so warm
    /// starts are floored before EM.
    pub fn with_probability_floor(&self, epsilon: f64) -> Self {
        let epsilon = epsilon.clamp(0.0, 1.0);
        let k = self.num_states();
        let uniform = 1.0 / k.max(1) as f64;
        let floor = |p: &[f64]| -> Vec<f64> {
            let mut floored: Vec<f64> = p
                .iter()
                .map(|&v| (1.0 - epsilon) * v + epsilon * uniform)
                .collect();
            normalize_in_place(&mut floored);
            floored
        };
        Self {
            start_probs: floor(&self.start_probs),
            transition_matrix: self.transition_matrix.iter().map(|row| floor(row)).collect(),
            emissions: self.emissions.clone(),
        }
    }

    /// Scaled forward-backward pass.
    pub fn forward_backward(&self, x: &ObservationMatrix) -> RegimeResult<Posteriors> {
        let log_b = self.log_emissions(x)?;
        let forward = self.forward_from(&log_b, &self.start_probs);
        let t_len = log_b.len();
        let k = self.num_states();

        // b'[t][j] = p(x_t | s_t = j) / p(x_t | x_<t)
        let scaled_b: Vec<Vec<f64>> = log_b
            .iter()
            .zip(&forward.point_log_likelihoods)
            .map(|(row, &log_c)| {
                row.iter()
                    .map(|v| (v - log_c).min(MAX_EXP_ARG).exp())
                    .collect()
            })
            .collect();

        let mut beta = vec![vec![1.0; k]; t_len];
        for t in (0..t_len.saturating_sub(1)).rev() {
            for j in 0..k {
                let mut acc = 0.0;
                for s in 0..k {
                    acc += self.transition_matrix[j][s] * scaled_b[t + 1][s] * beta[t + 1][s];
                }
                beta[t][j] = acc;
            }
        }

        let mut gamma = vec![vec![0.0; k]; t_len];
        for t in 0..t_len {
            for j in 0..k {
                gamma[t][j] = forward.alpha[t][j] * beta[t][j];
            }
            normalize_in_place(&mut gamma[t]);
        }

        let mut expected_transitions = vec![vec![0.0; k]; k];
        let mut xi = vec![vec![0.0; k]; k];
        for t in 0..t_len.saturating_sub(1) {
            let mut xi_sum = 0.0;
            for i in 0..k {
                for j in 0..k {
                    xi[i][j] = forward.alpha[t][i]
                        * self.transition_matrix[i][j]
                        * scaled_b[t + 1][j]
                        * beta[t + 1][j];
                    xi_sum += xi[i][j];
                }
            }
            if xi_sum > constants::MIN_LOG_VALUE && xi_sum.is_finite() {
                let inv = 1.0 / xi_sum;
                for i in 0..k {
                    for j in 0..k {
                        expected_transitions[i][j] += xi[i][j] * inv;
                    }
                }
            }
        }

        Ok(Posteriors {
            gamma,
            expected_transitions,
            forward,
        })
    }

    /// Most likely state path and its joint log-probability.
    ///
    /// Ties are resolved toward the lowest state index.
    pub fn viterbi(&self, x: &ObservationMatrix) -> RegimeResult<(Vec<usize>, f64)> {
        let log_b = self.log_emissions(x)?;
        let t_len = log_b.len();
        let k = self.num_states();
        let log_a: Vec<Vec<f64>> = self
            .transition_matrix
            .iter()
            .map(|row| row.iter().map(|p| p.ln()).collect())
            .collect();

        let mut delta: Vec<f64> = (0..k)
            .map(|j| self.start_probs[j].ln() + log_b[0][j])
            .collect();
        let mut psi = vec![vec![0usize; k]; t_len];

        for t in 1..t_len {
            let mut next = vec![f64::NEG_INFINITY; k];
            for j in 0..k {
                let mut max_val = f64::NEG_INFINITY;
                let mut max_idx = 0;
                for i in 0..k {
                    let val = delta[i] + log_a[i][j];
                    if val > max_val {
                        max_val = val;
                        max_idx = i;
                    }
                }
                next[j] = max_val + log_b[t][j];
                psi[t][j] = max_idx;
            }
            delta = next;
        }

        let mut best_final_state = 0;
        let mut best_final_prob = f64::NEG_INFINITY;
        for (j, &v) in delta.iter().enumerate() {
            if v > best_final_prob {
                best_final_prob = v;
                best_final_state = j;
            }
        }

        let mut path = vec![0; t_len];
        path[t_len - 1] = best_final_state;
        for t in (0..t_len - 1).rev() {
            path[t] = psi[t + 1][path[t + 1]];
        }

        Ok((path, best_final_prob))
    }

    /// M-step: re-estimate all parameters from posteriors.
    pub fn update_parameters(
        &mut self,
        x: &ObservationMatrix,
        posteriors: &Posteriors,
        min_covar: f64,
    ) {
        let k = self.num_states();
        let covariance_type = self.covariance_type();

        self.start_probs = posteriors.gamma[0].clone();
        normalize_in_place(&mut self.start_probs);

        for i in 0..k {
            let row_total: f64 = posteriors.expected_transitions[i].iter().sum();
            if row_total > constants::MIN_LOG_VALUE {
                self.transition_matrix[i] = posteriors.expected_transitions[i].clone();
                normalize_in_place(&mut self.transition_matrix[i]);
            }
        }

        for j in 0..k {
            let weights: Vec<f64> = posteriors.gamma.iter().map(|g| g[j]).collect();
            if let Some(updated) =
                RegimeDistribution::estimate(x, &weights, covariance_type, min_covar)
            {
                self.emissions[j] = updated;
            }
        }
    }

    /// Baum-Welch estimation.
    ///
    /// Stops when |ΔLL| < `tol` or after `n_iter` E-steps, and keeps the
    /// parameters with the highest log-likelihood seen.
    pub fn fit_em(
        &mut self,
        x: &ObservationMatrix,
        settings: &EmSettings,
    ) -> RegimeResult<EmOutcome> {
        self.check_input(x)?;
        let n_iter = settings.n_iter.max(1);

        let mut best_params = self.clone();
        let mut best_ll = f64::NEG_INFINITY;
        let mut prev_ll: Option<f64> = None;
        let mut last_improvement = f64::NAN;

        for iteration in 0..n_iter {
            let posteriors = self.forward_backward(x)?;
            let log_likelihood = posteriors.log_likelihood();
            if !log_likelihood.is_finite() {
                return Err(RegimeError::NumericalError {
                    reason: format!("log-likelihood became {}", log_likelihood),
                    operation: Some("Baum-Welch".to_string()),
                });
            }

            if log_likelihood > best_ll {
                best_ll = log_likelihood;
                best_params = self.clone();
            }

            if let Some(prev) = prev_ll {
                last_improvement = log_likelihood - prev;
                if last_improvement.abs() < settings.tol {
                    log::debug!(
                        "EM converged after {} iterations (LL = {:.6})",
                        iteration + 1,
                        best_ll
                    );
                    *self = best_params;
                    return Ok(EmOutcome {
                        iterations: iteration + 1,
                        log_likelihood: best_ll,
                        converged: true,
                        non_convergence: None,
                    });
                }
            }

            self.update_parameters(x, &posteriors, settings.min_covar);
            prev_ll = Some(log_likelihood);
        }

        // parameters after the final M-step have not been scored yet
        let final_ll = self.forward(x)?.log_likelihood();
        if let Some(prev) = prev_ll {
            last_improvement = final_ll - prev;
        }
        if final_ll.is_finite() && final_ll > best_ll {
            best_ll = final_ll;
            best_params = self.clone();
        }
        *self = best_params;

        let condition = NonConvergenceCondition {
            iterations: n_iter,
            last_improvement,
            best_log_likelihood: best_ll,
        };
        log::warn!(
            "EM hit the iteration cap ({}) without converging; last ΔLL = {:.3e}",
            n_iter,
            last_improvement
        );

        Ok(EmOutcome {
            iterations: n_iter,
            log_likelihood: best_ll,
            converged: false,
            non_convergence: Some(condition),
        })
    }

    /// Reorders states: new state `i` is old state `order[i]`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        Self {
            start_probs: order.iter().map(|&o| self.start_probs[o]).collect(),
            transition_matrix: order
                .iter()
                .map(|&i| order.iter().map(|&j| self.transition_matrix[i][j]).collect())
                .collect(),
            emissions: order.iter().map(|&o| self.emissions[o].clone()).collect(),
        }
    }
}

fn with_mean(template: &RegimeDistribution, mean: DVector<f64>) -> RegimeDistribution {
    match template {
        RegimeDistribution::Diagonal { variances, .. } => RegimeDistribution::Diagonal {
            mean,
            variances: variances.clone(),
        },
        RegimeDistribution::Full { covariance, .. } => RegimeDistribution::Full {
            mean,
            covariance: covariance.clone(),
        },
    }
}

fn check_distribution(p: &[f64], name: &str) -> Result<(), String> {
    if p.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(format!("{} contain negative or non-finite entries", name));
    }
    let total: f64 = p.iter().sum();
    if (total - 1.0).abs() > constants::STOCHASTIC_TOLERANCE {
        return Err(format!("{} sum to {} instead of 1", name, total));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{ClusterInitializer, KMeansInitializer};
    use crate::secure_rng::SecureRng;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;

    fn two_state_model() -> GaussianHmm {
        GaussianHmm {
            start_probs: vec![0.5, 0.5],
            transition_matrix: vec![vec![0.9, 0.1], vec![0.2, 0.8]],
            emissions: vec![
                RegimeDistribution::Diagonal {
                    mean: DVector::from_vec(vec![-2.0]),
                    variances: DVector::from_vec(vec![1.0]),
                },
                RegimeDistribution::Diagonal {
                    mean: DVector::from_vec(vec![2.0]),
                    variances: DVector::from_vec(vec![1.0]),
                },
            ],
        }
    }

    fn switching_series() -> ObservationMatrix {
        let mut rows = Vec::new();
        for t in 0..60 {
            let level = if (t / 15) % 2 == 0 { -2.0 } else { 2.0 };
            let wiggle = ((t * 7) % 5) as f64 * 0.1 - 0.2;
            rows.push(vec![level + wiggle]);
        }
        ObservationMatrix::from_rows(rows).unwrap()
    }

    /// Brute-force likelihood for a tiny sequence by summing over all paths.
    fn brute_force_log_likelihood(hmm: &GaussianHmm, x: &ObservationMatrix) -> f64 {
        let log_b = hmm.log_emissions(x).unwrap();
        let k = hmm.num_states();
        let t_len = x.num_rows();
        let mut total = 0.0;
        for code in 0..k.pow(t_len as u32) {
            let mut path = Vec::with_capacity(t_len);
            let mut c = code;
            for _ in 0..t_len {
                path.push(c % k);
                c /= k;
            }
            let mut p = hmm.start_probs[path[0]] * log_b[0][path[0]].exp();
            for t in 1..t_len {
                p *= hmm.transition_matrix[path[t - 1]][path[t]] * log_b[t][path[t]].exp();
            }
            total += p;
        }
        total.ln()
    }

    #[test]
    fn test_forward_matches_brute_force() {
        let hmm = two_state_model();
        let x = ObservationMatrix::from_rows(vec![vec![-1.5], vec![0.3], vec![2.2], vec![1.9]])
            .unwrap();
        let pass = hmm.forward(&x).unwrap();
        assert_approx_eq!(
            pass.log_likelihood(),
            brute_force_log_likelihood(&hmm, &x),
            1e-10
        );
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let hmm = two_state_model();
        let post = hmm.forward_backward(&switching_series()).unwrap();
        for g in &post.gamma {
            assert_approx_eq!(g.iter().sum::<f64>(), 1.0, constants::POSTERIOR_TOLERANCE);
        }
        let total: f64 = post.expected_transitions.iter().flatten().sum();
        assert_approx_eq!(total, 59.0, 1e-6);
    }

    #[test]
    fn test_continuation_splits_likelihood() {
        let hmm = two_state_model();
        let x = switching_series();
        let head = x.prefix(40);
        let tail = x.slice_rows(40..60);
        let whole = hmm.forward(&x).unwrap().log_likelihood();
        let split = hmm.forward(&head).unwrap().log_likelihood()
            + hmm.forward_continuation(&head, &tail).unwrap().log_likelihood();
        assert_approx_eq!(whole, split, 1e-8);
    }

    #[test]
    fn test_viterbi_follows_levels() {
        let hmm = two_state_model();
        let (path, log_prob) = hmm.viterbi(&switching_series()).unwrap();
        assert!(log_prob.is_finite());
        for (t, &s) in path.iter().enumerate() {
            let expected = if (t / 15) % 2 == 0 { 0 } else { 1 };
            assert_eq!(s, expected, "t = {}", t);
        }
    }

    #[test]
    fn test_em_increases_likelihood_and_keeps_rows_stochastic() {
        let x = switching_series();
        let seeds = KMeansInitializer::default()
            .initialize(&x, 2, &mut SecureRng::with_seed(5))
            .unwrap();
        let mut hmm = GaussianHmm::from_clusters(&x, &seeds, CovarianceType::Full, 1e-3).unwrap();
        let initial_ll = hmm.forward(&x).unwrap().log_likelihood();

        let outcome = hmm
            .fit_em(
                &x,
                &EmSettings {
                    n_iter: 100,
                    tol: 1e-6,
                    min_covar: 1e-3,
                },
            )
            .unwrap();

        assert!(outcome.log_likelihood >= initial_ll);
        assert!(outcome.converged);
        assert!(outcome.non_convergence.is_none());
        for row in &hmm.transition_matrix {
            assert_approx_eq!(row.iter().sum::<f64>(), 1.0, constants::STOCHASTIC_TOLERANCE);
        }
        assert_approx_eq!(
            hmm.forward(&x).unwrap().log_likelihood(),
            outcome.log_likelihood,
            1e-9
        );
    }

    #[test]
    fn test_iteration_cap_records_condition() {
        let x = switching_series();
        let mut hmm = two_state_model();
        let outcome = hmm
            .fit_em(
                &x,
                &EmSettings {
                    n_iter: 1,
                    tol: 0.0,
                    min_covar: 1e-3,
                },
            )
            .unwrap();
        assert!(!outcome.converged);
        let condition = outcome.non_convergence.unwrap();
        assert_eq!(condition.iterations, 1);
        assert_approx_eq!(condition.best_log_likelihood, outcome.log_likelihood, 1e-12);
    }

    #[test]
    fn test_dimension_mismatch() {
        let hmm = two_state_model();
        let x = ObservationMatrix::from_rows(vec![vec![0.0, 1.0]]).unwrap();
        assert!(matches!(
            hmm.forward(&x),
            Err(RegimeError::DimensionMismatch {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_permuted_swaps_states() {
        let hmm = two_state_model();
        let swapped = hmm.permuted(&[1, 0]);
        assert_eq!(swapped.transition_matrix, vec![vec![0.8, 0.2], vec![0.1, 0.9]]);
        assert_eq!(swapped.emissions[0], hmm.emissions[1]);
    }

    #[test]
    fn test_stationary_distribution() {
        let hmm = two_state_model();
        let pi = hmm.stationary_distribution();
        assert_approx_eq!(pi[0], 2.0 / 3.0, 1e-9);
        assert_approx_eq!(pi[1], 1.0 / 3.0, 1e-9);

        let mut flip = two_state_model();
        flip.transition_matrix = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let pi = flip.stationary_distribution();
        assert_approx_eq!(pi[0], 0.5, 1e-9);
    }

    #[test]
    fn test_independent_scores_ignore_order() {
        let hmm = two_state_model();
        let x = ObservationMatrix::from_rows(vec![vec![-1.5], vec![2.2]]).unwrap();
        let reversed = ObservationMatrix::from_rows(vec![vec![2.2], vec![-1.5]]).unwrap();
        let forward = hmm.independent_log_likelihoods(&x).unwrap();
        let backward = hmm.independent_log_likelihoods(&reversed).unwrap();
        assert_approx_eq!(forward[0], backward[1], 1e-12);
        assert_approx_eq!(forward[1], backward[0], 1e-12);

        // mixture 2/3 N(-2, 1) + 1/3 N(2, 1) at -1.5
        let norm = (2.0 * std::f64::consts::PI).sqrt();
        let pdf = |x: f64, m: f64| (-(x - m) * (x - m) / 2.0).exp() / norm;
        let expected = (2.0 / 3.0 * pdf(-1.5, -2.0) + 1.0 / 3.0 * pdf(-1.5, 2.0)).ln();
        assert_approx_eq!(forward[0], expected, 1e-9);
    }

    #[test]
    fn test_probability_floor_reopens_absorbing_state() {
        let mut hmm = two_state_model();
        hmm.start_probs = vec![0.0, 1.0];
        hmm.transition_matrix = vec![vec![0.95, 0.05], vec![0.0, 1.0]];
        let floored = hmm.with_probability_floor(0.01);
        assert!(floored.check_consistency().is_ok());
        assert_approx_eq!(floored.transition_matrix[1][0], 0.005, 1e-12);
        assert_approx_eq!(floored.transition_matrix[0][0], 0.99 * 0.95 + 0.005, 1e-12);
        assert!(floored.start_probs[0] > 0.0);

        // an absorbing regime is left again once EM sees the data leave it
        let x = switching_series();
        let settings = EmSettings {
            n_iter: 30,
            tol: 1e-8,
            min_covar: 1e-3,
        };
        let mut trapped = hmm.clone();
        trapped.fit_em(&x, &settings).unwrap();
        assert_eq!(trapped.transition_matrix[1][0], 0.0);

        let mut released = floored;
        released.fit_em(&x, &settings).unwrap();
        assert!(released.transition_matrix[1][0] > 0.01);
    }

    #[test]
    fn test_consistency_check() {
        let mut hmm = two_state_model();
        assert!(hmm.check_consistency().is_ok());
        hmm.transition_matrix[0] = vec![0.5, 0.6];
        assert!(hmm.check_consistency().is_err());

        let mut mixed = two_state_model();
        mixed.emissions[1] = RegimeDistribution::Full {
            mean: DVector::from_vec(vec![2.0]),
            covariance: DMatrix::from_element(1, 1, 1.0),
        };
        assert!(mixed.check_consistency().is_err());
    }
}
