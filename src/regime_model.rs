//! The regime model: a K-state Gaussian HMM with stable regime identities.
//!
//! [`RegimeModel`] owns everything a fit produces (HMM parameters in identity
//! order, the z-score transform, the previous regime set and the last label
//! remap) and exposes it as one [`ModelSnapshot`]. The first fit is a cold
//! start from the cluster initializer; later fits with the same K start from
//! the previous parameters and are relabelled by the [`LabelStabilizer`].
//!
//! A warm start floors the previous start and transition probabilities and
//! runs EM twice: once from the carried emissions and once from emissions
//! re-seeded by the cluster initializer, matched to the carried states. The
//! re-seeded run is kept only when it is clearly better.
//!
//! All likelihoods returned by the public API are in the units of the caller's
//! observations: the log-Jacobian of the z-score transform is added back.

use crate::{
    clustering::{ClusterInitializer, KMeansInitializer},
    emission_models::{CovarianceType, RegimeDistribution},
    errors::{validate_observation_shape, RegimeError, RegimeResult},
    hmm_core::{EmOutcome, GaussianHmm},
    label_stabilizer::{
        cost_matrix, solve_assignment, LabelMapping, LabelStabilizer, RegimeIdentity, RegimeSet,
    },
    model_selection::{SelectionDiagnostics, StateCountSelector},
    preprocessing::{ObservationMatrix, ScalerParams},
    regime_config::{PointScoring, RegimeModelConfig},
    regime_results::{summarize_runs, DecodeResult, FitReport, RegimeStatistics},
    secure_rng::SecureRng,
};
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Share of the uniform distribution mixed into warm-start probabilities.
const WARM_START_FLOOR: f64 = 1e-2;

/// Log-likelihood gain (nats) a re-seeded warm start needs over the carried
/// emissions before it replaces them.
const RESEED_MIN_GAIN: f64 = 1.0;

/// Everything needed to resume warm-start fitting without replaying history.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelSnapshot {
    /// Number of regimes
    pub k: usize,
    /// Covariance structure of every regime
    pub covariance_type: CovarianceType,
    /// Start probabilities in identity order
    pub start_probs: Vec<f64>,
    /// Transition matrix in identity order
    pub transition_matrix: Vec<Vec<f64>>,
    /// Current regimes (standardized space)
    pub regimes: RegimeSet,
    /// z-score transform of the last fit
    pub scaler: ScalerParams,
    /// Regimes before the last fit, if it was not the first
    pub prior_regimes: Option<RegimeSet>,
    /// Identity assigned to each raw EM state by the last fit
    pub label_remap: Vec<RegimeIdentity>,
    /// Configuration, including the initializer seed
    pub config: RegimeModelConfig,
    /// Number of fits performed since the last reset
    pub fit_count: usize,
}

#[derive(Debug, Clone)]
struct FittedState {
    /// States are kept in identity order: state `i` is identity `i + 1`.
    hmm: GaussianHmm,
    scaler: ScalerParams,
    prior_regimes: Option<RegimeSet>,
    label_remap: Vec<RegimeIdentity>,
    fit_count: usize,
}

impl FittedState {
    fn log_jacobian(&self) -> f64 {
        self.scaler.log_jacobian()
    }
}

/// Gaussian HMM regime model.
#[derive(Debug, Clone)]
pub struct RegimeModel {
    config: RegimeModelConfig,
    initializer: Arc<dyn ClusterInitializer>,
    stabilizer: LabelStabilizer,
    state: Option<FittedState>,
    selection: Option<SelectionDiagnostics>,
    last_report: Option<FitReport>,
}

impl RegimeModel {
    /// Unfitted model with the k-means initializer.
    pub fn new(config: RegimeModelConfig) -> RegimeResult<Self> {
        Self::with_initializer(config, Arc::new(KMeansInitializer::default()))
    }

    /// Unfitted model with a custom cluster initializer.
    pub fn with_initializer(
        config: RegimeModelConfig,
        initializer: Arc<dyn ClusterInitializer>,
    ) -> RegimeResult<Self> {
        config.validate()?;
        Ok(Self {
            stabilizer: LabelStabilizer::new(config.stabilizer),
            config,
            initializer,
            state: None,
            selection: None,
            last_report: None,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &RegimeModelConfig {
        &self.config
    }

    /// Cluster initializer in use.
    pub fn initializer(&self) -> Arc<dyn ClusterInitializer> {
        Arc::clone(&self.initializer)
    }

    /// True once a fit succeeded (or a snapshot was loaded).
    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Number of regimes of the current fit.
    pub fn num_states(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.hmm.num_states())
    }

    /// Feature dimension fixed by the first fit.
    pub fn dim(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.hmm.dim())
    }

    fn fitted(&self, operation: &str) -> RegimeResult<&FittedState> {
        self.state.as_ref().ok_or_else(|| RegimeError::NotFitted {
            operation: operation.to_string(),
        })
    }

    /// Fit the model to `x`.
    ///
    /// With `k = None` the state-count selector chooses K and its diagnostics
    /// are kept on the model. Calls with an unchanged K warm-start from the
    /// previous parameters; a larger K starts cold and new regimes are born;
    /// a smaller K renumbers all identities by the first mean coordinate.
    pub fn fit(&mut self, x: &ObservationMatrix, k: Option<usize>) -> RegimeResult<FitReport> {
        if let Some(state) = &self.state {
            if x.num_cols() != state.hmm.dim() {
                return Err(RegimeError::DimensionMismatch {
                    expected: state.hmm.dim(),
                    actual: x.num_cols(),
                });
            }
        }
        if x.num_rows() < 2 {
            return Err(RegimeError::InputShape {
                required: 1,
                actual: x.num_rows(),
                states: k.unwrap_or(0),
            });
        }

        let scaler = if self.config.standardize {
            ScalerParams::fit(x)?
        } else {
            ScalerParams::identity(x.num_cols())
        };
        let z = scaler.transform(x)?;

        let k = match k {
            Some(0) => {
                return Err(RegimeError::InvalidParameter {
                    parameter: "k".to_string(),
                    value: 0.0,
                    constraint: "at least one regime".to_string(),
                })
            }
            Some(k) => k,
            None => {
                let selector = StateCountSelector::new(&self.config, self.initializer());
                let diagnostics = selector.select(&z)?;
                let chosen = diagnostics.chosen_k;
                self.selection = Some(diagnostics);
                chosen
            }
        };
        validate_observation_shape(z.num_rows(), k, self.config.min_samples_per_state)?;

        let previous = self
            .state
            .as_ref()
            .map(|s| transfer_scaler(&s.hmm, &s.scaler, &scaler));
        let previous_k = previous.as_ref().map(|p| p.num_states());

        let (hmm, em, warm_started) = match &previous {
            Some(p) if p.num_states() == k => {
                let (hmm, em) = self.warm_fit(&z, p)?;
                (hmm, em, true)
            }
            _ => {
                let mut hmm = self.cold_start(&z, k)?;
                let em = hmm.fit_em(&z, &self.config.em_settings())?;
                (hmm, em, false)
            }
        };

        let prior_regimes = previous.map(|p| RegimeSet::new(p.emissions));
        let (mapping, identities_reset) = match &prior_regimes {
            Some(prior) if prior.len() <= k => {
                (self.stabilizer.stabilize(prior, &hmm.emissions)?, false)
            }
            _ => {
                let mapping = LabelMapping::by_first_coordinate(&hmm.emissions);
                self.stabilizer.record(mapping.clone());
                (mapping, true)
            }
        };
        if !mapping.is_consecutive() {
            return Err(RegimeError::InfeasibleAssignment {
                reason: format!(
                    "labels {:?} are not exactly 1..{}",
                    mapping.identities.iter().map(|i| i.get()).collect::<Vec<_>>(),
                    k
                ),
            });
        }

        let hmm = hmm.permuted(&mapping.state_order());
        hmm.check_consistency()
            .map_err(|reason| RegimeError::NumericalError {
                reason,
                operation: Some("fit".to_string()),
            })?;

        match previous_k {
            Some(old) if old != k => {
                log::info!("Regime count changed from {} to {}", old, k)
            }
            None => log::info!("Cold-start fit with {} regimes", k),
            _ => {}
        }

        let log_jacobian = scaler.log_jacobian();
        let fit_count = self.state.as_ref().map_or(0, |s| s.fit_count) + 1;
        self.state = Some(FittedState {
            hmm,
            scaler,
            prior_regimes,
            label_remap: mapping.identities.clone(),
            fit_count,
        });

        let report = FitReport {
            k,
            iterations: em.iterations,
            log_likelihood: em.log_likelihood + log_jacobian * z.num_rows() as f64,
            converged: em.converged,
            warm_started,
            non_convergence: em.non_convergence,
            label_mapping: mapping,
            identities_reset,
        };
        log::debug!(
            "Fit #{}: k = {}, {} iterations, warm = {}",
            fit_count,
            report.k,
            report.iterations,
            report.warm_started
        );
        self.last_report = Some(report.clone());
        Ok(report)
    }

    fn cold_start(&self, z: &ObservationMatrix, k: usize) -> RegimeResult<GaussianHmm> {
        let mut rng = SecureRng::from_optional_seed(self.config.seed);
        let seeds = self.initializer.initialize(z, k, &mut rng)?;
        GaussianHmm::from_clusters(z, &seeds, self.config.covariance_type, self.config.min_covar)
    }

    /// Emissions from a fresh cluster initialization, each placed in the slot
    /// of the nearest `warm` state; probabilities are taken from `warm`.
    fn reseeded_start(
        &self,
        z: &ObservationMatrix,
        warm: &GaussianHmm,
    ) -> RegimeResult<GaussianHmm> {
        let seeded = self.cold_start(z, warm.num_states())?;
        let costs = cost_matrix(
            &RegimeSet::new(warm.emissions.clone()),
            &seeded.emissions,
            self.config.stabilizer.alpha,
        );
        let mut emissions = warm.emissions.clone();
        for (new, matched) in solve_assignment(&costs)?.into_iter().enumerate() {
            if let Some(slot) = matched {
                emissions[slot] = seeded.emissions[new].clone();
            }
        }
        Ok(GaussianHmm {
            start_probs: warm.start_probs.clone(),
            transition_matrix: warm.transition_matrix.clone(),
            emissions,
        })
    }

    fn warm_fit(
        &self,
        z: &ObservationMatrix,
        previous: &GaussianHmm,
    ) -> RegimeResult<(GaussianHmm, EmOutcome)> {
        let settings = self.config.em_settings();
        let run_em = |mut hmm: GaussianHmm| -> RegimeResult<(GaussianHmm, EmOutcome)> {
            let em = hmm.fit_em(z, &settings)?;
            Ok((hmm, em))
        };

        let floored = previous.with_probability_floor(WARM_START_FLOOR);
        let carried = run_em(floored.clone());
        let reseeded = self.reseeded_start(z, &floored).and_then(&run_em);

        match (carried, reseeded) {
            (Ok(c), Ok(r)) if r.1.log_likelihood > c.1.log_likelihood + RESEED_MIN_GAIN => {
                log::debug!(
                    "Warm start re-seeded from the cluster initializer (LL {:.4} -> {:.4})",
                    c.1.log_likelihood,
                    r.1.log_likelihood
                );
                Ok(r)
            }
            (Ok(c), _) => Ok(c),
            (Err(e), Ok(r)) => {
                log::debug!("Carried warm start failed ({}); using re-seeded start", e);
                Ok(r)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Viterbi labels and smoothed posteriors; does not modify the model.
    pub fn decode(&self, x: &ObservationMatrix) -> RegimeResult<DecodeResult> {
        let state = self.fitted("decode")?;
        let z = state.scaler.transform(x)?;
        let (path, path_log_probability) = state.hmm.viterbi(&z)?;
        let posteriors = state.hmm.forward_backward(&z)?;
        let shift = state.log_jacobian() * z.num_rows() as f64;

        Ok(DecodeResult {
            labels: path.into_iter().map(RegimeIdentity::from_index).collect(),
            log_likelihood: posteriors.log_likelihood() + shift,
            posteriors: posteriors.gamma,
            path_log_probability: path_log_probability + shift,
        })
    }

    /// Total log-likelihood of `x`.
    pub fn score(&self, x: &ObservationMatrix) -> RegimeResult<f64> {
        Ok(self.point_log_likelihoods(x)?.iter().sum())
    }

    /// One-step predictive log-likelihoods `ln p(x_t | x_<t)`; they sum to
    /// [`RegimeModel::score`].
    pub fn point_log_likelihoods(&self, x: &ObservationMatrix) -> RegimeResult<Vec<f64>> {
        let state = self.fitted("point_log_likelihoods")?;
        let z = state.scaler.transform(x)?;
        let jacobian = state.log_jacobian();
        Ok(state
            .hmm
            .forward(&z)?
            .point_log_likelihoods
            .into_iter()
            .map(|ll| ll + jacobian)
            .collect())
    }

    /// One-step predictive log-likelihoods of `x` following `context`.
    pub fn point_log_likelihoods_after(
        &self,
        context: &ObservationMatrix,
        x: &ObservationMatrix,
    ) -> RegimeResult<Vec<f64>> {
        let state = self.fitted("score_continuation")?;
        let zc = state.scaler.transform(context)?;
        let zx = state.scaler.transform(x)?;
        let jacobian = state.log_jacobian();
        Ok(state
            .hmm
            .forward_continuation(&zc, &zx)?
            .point_log_likelihoods
            .into_iter()
            .map(|ll| ll + jacobian)
            .collect())
    }

    /// Log-likelihood of every row of `x` scored on its own under the
    /// stationary regime distribution.
    pub fn independent_log_likelihoods(&self, x: &ObservationMatrix) -> RegimeResult<Vec<f64>> {
        let state = self.fitted("independent_log_likelihoods")?;
        let z = state.scaler.transform(x)?;
        let jacobian = state.log_jacobian();
        Ok(state
            .hmm
            .independent_log_likelihoods(&z)?
            .into_iter()
            .map(|ll| ll + jacobian)
            .collect())
    }

    /// Per-row log-likelihoods of `x` under the configured [`PointScoring`].
    pub fn point_scores(&self, x: &ObservationMatrix) -> RegimeResult<Vec<f64>> {
        match self.config.point_scoring {
            PointScoring::Independent => self.independent_log_likelihoods(x),
            PointScoring::Predictive => self.point_log_likelihoods(x),
        }
    }

    /// Per-row out-of-sample log-likelihoods of `x` under the configured
    /// [`PointScoring`]; `context` is only used by predictive scoring.
    pub fn point_scores_after(
        &self,
        context: &ObservationMatrix,
        x: &ObservationMatrix,
    ) -> RegimeResult<Vec<f64>> {
        match self.config.point_scoring {
            PointScoring::Independent => self.independent_log_likelihoods(x),
            PointScoring::Predictive => self.point_log_likelihoods_after(context, x),
        }
    }

    /// Log-likelihood of `x` conditioned on a preceding `context` window.
    pub fn score_continuation(
        &self,
        context: &ObservationMatrix,
        x: &ObservationMatrix,
    ) -> RegimeResult<f64> {
        Ok(self.point_log_likelihoods_after(context, x)?.iter().sum())
    }

    /// Filtered posterior of the final row of `x` and the log-likelihood of
    /// that row under the configured [`PointScoring`].
    ///
    /// At the final row the filtered and smoothed posteriors coincide.
    pub fn filter_last(&self, x: &ObservationMatrix) -> RegimeResult<(Vec<f64>, f64)> {
        let state = self.fitted("filter_last")?;
        let z = state.scaler.transform(x)?;
        let forward = state.hmm.forward(&z)?;
        let (posterior, predictive) =
            match (forward.last_filtered(), forward.point_log_likelihoods.last()) {
                (Some(posterior), Some(&ll)) => (posterior.to_vec(), ll),
                _ => {
                    return Err(RegimeError::InputShape {
                        required: 0,
                        actual: 0,
                        states: state.hmm.num_states(),
                    })
                }
            };
        let ll = match self.config.point_scoring {
            PointScoring::Predictive => predictive,
            PointScoring::Independent => {
                let last = z.slice_rows(z.num_rows() - 1..z.num_rows());
                state
                    .hmm
                    .independent_log_likelihoods(&last)?
                    .first()
                    .copied()
                    .unwrap_or(predictive)
            }
        };
        Ok((posterior, ll + state.log_jacobian()))
    }

    /// Transition matrix in identity order.
    pub fn transition_matrix(&self) -> RegimeResult<&[Vec<f64>]> {
        Ok(&self.fitted("transition_matrix")?.hmm.transition_matrix)
    }

    /// Start probabilities in identity order.
    pub fn start_probabilities(&self) -> RegimeResult<&[f64]> {
        Ok(&self.fitted("start_probabilities")?.hmm.start_probs)
    }

    /// Current regimes in the standardized space the model was fitted in.
    pub fn regime_set(&self) -> RegimeResult<RegimeSet> {
        Ok(RegimeSet::new(
            self.fitted("regime_set")?.hmm.emissions.clone(),
        ))
    }

    /// Current regimes in the caller's feature units.
    pub fn regime_set_original_units(&self) -> RegimeResult<RegimeSet> {
        let state = self.fitted("regime_set_original_units")?;
        let identity = ScalerParams::identity(state.scaler.num_features());
        Ok(RegimeSet::new(
            transfer_scaler(&state.hmm, &state.scaler, &identity).emissions,
        ))
    }

    /// Regimes before the last fit, if any.
    pub fn prior_regime_set(&self) -> Option<&RegimeSet> {
        self.state.as_ref().and_then(|s| s.prior_regimes.as_ref())
    }

    /// z-score transform of the last fit.
    pub fn scaler(&self) -> Option<&ScalerParams> {
        self.state.as_ref().map(|s| &s.scaler)
    }

    /// Per-regime parameters and decoded-run statistics over `x`.
    pub fn regime_statistics(&self, x: &ObservationMatrix) -> RegimeResult<Vec<RegimeStatistics>> {
        let decoded = self.decode(x)?;
        let regimes = self.regime_set_original_units()?;
        let transition = self.transition_matrix()?;

        Ok(regimes
            .iter()
            .map(|(identity, dist)| {
                let runs = summarize_runs(&decoded.labels, identity);
                let persistence = transition[identity.index()][identity.index()];
                RegimeStatistics {
                    identity,
                    mean: dist.mean().iter().copied().collect(),
                    variances: dist.variances().iter().copied().collect(),
                    persistence_probability: persistence,
                    expected_duration: (persistence < 1.0).then(|| 1.0 / (1.0 - persistence)),
                    occupancy: runs.occupancy,
                    average_duration: runs.average_duration,
                    occurrence_count: runs.occurrence_count,
                    total_duration: runs.total_duration,
                    first_occurrence: runs.first_occurrence,
                    last_occurrence: runs.last_occurrence,
                }
            })
            .collect())
    }

    /// Diagnostics of the last automatic state-count selection.
    pub fn selection_diagnostics(&self) -> Option<&SelectionDiagnostics> {
        self.selection.as_ref()
    }

    /// Report of the last successful fit.
    pub fn last_fit_report(&self) -> Option<&FitReport> {
        self.last_report.as_ref()
    }

    /// Drop all fitted state; the next fit is a cold start.
    pub fn reset(&mut self) {
        self.state = None;
        self.selection = None;
        self.last_report = None;
        self.stabilizer.reset();
    }

    /// Snapshot of the fitted state.
    pub fn dump(&self) -> RegimeResult<ModelSnapshot> {
        let state = self.fitted("dump")?;
        Ok(ModelSnapshot {
            k: state.hmm.num_states(),
            covariance_type: state.hmm.covariance_type(),
            start_probs: state.hmm.start_probs.clone(),
            transition_matrix: state.hmm.transition_matrix.clone(),
            regimes: RegimeSet::new(state.hmm.emissions.clone()),
            scaler: state.scaler.clone(),
            prior_regimes: state.prior_regimes.clone(),
            label_remap: state.label_remap.clone(),
            config: self.config.clone(),
            fit_count: state.fit_count,
        })
    }

    /// Restore a model from a snapshot, with the k-means initializer.
    pub fn load(snapshot: ModelSnapshot) -> RegimeResult<Self> {
        Self::load_with_initializer(snapshot, Arc::new(KMeansInitializer::default()))
    }

    /// Restore a model from a snapshot, with a custom initializer.
    pub fn load_with_initializer(
        snapshot: ModelSnapshot,
        initializer: Arc<dyn ClusterInitializer>,
    ) -> RegimeResult<Self> {
        let snapshot_error = |reason: String| RegimeError::SnapshotError { reason };

        let hmm = GaussianHmm {
            start_probs: snapshot.start_probs,
            transition_matrix: snapshot.transition_matrix,
            emissions: snapshot.regimes.distributions().to_vec(),
        };
        if hmm.num_states() != snapshot.k {
            return Err(snapshot_error(format!(
                "k = {} but {} start probabilities",
                snapshot.k,
                hmm.num_states()
            )));
        }
        hmm.check_consistency().map_err(snapshot_error)?;
        if hmm.covariance_type() != snapshot.covariance_type
            || snapshot.config.covariance_type != snapshot.covariance_type
        {
            return Err(snapshot_error(
                "covariance type disagrees with the stored regimes".to_string(),
            ));
        }
        hmm.densities()
            .map_err(|e| snapshot_error(format!("regime covariance unusable: {}", e)))?;

        let scaler = snapshot.scaler;
        if scaler.num_features() != hmm.dim() || scaler.scales.len() != hmm.dim() {
            return Err(snapshot_error(format!(
                "scaler has {} features, regimes have {}",
                scaler.num_features(),
                hmm.dim()
            )));
        }
        if scaler
            .scales
            .iter()
            .chain(&scaler.means)
            .any(|v| !v.is_finite())
            || scaler.scales.iter().any(|&s| s <= 0.0)
        {
            return Err(snapshot_error(
                "scaler parameters must be finite with positive scales".to_string(),
            ));
        }

        if let Some(prior) = &snapshot.prior_regimes {
            if prior.distributions().iter().any(|d| d.dim() != hmm.dim()) {
                return Err(snapshot_error(
                    "prior regimes differ in dimension".to_string(),
                ));
            }
        }

        let remap = LabelMapping {
            identities: snapshot.label_remap,
            born: Vec::new(),
            weights: Vec::new(),
            costs: Vec::new(),
            total_cost: 0.0,
        };
        if remap.len() != snapshot.k || !remap.is_consecutive() {
            return Err(snapshot_error(format!(
                "label remap is not a permutation of 1..{}",
                snapshot.k
            )));
        }

        let mut model = Self::with_initializer(snapshot.config, initializer)?;
        model.stabilizer.record(remap.clone());
        model.state = Some(FittedState {
            hmm,
            scaler,
            prior_regimes: snapshot.prior_regimes,
            label_remap: remap.identities,
            fit_count: snapshot.fit_count,
        });
        Ok(model)
    }
}

/// Re-expresses HMM parameters fitted under scaler `from` in the coordinates
/// of scaler `to`. The emission laws describe the same distributions in the
/// original feature units.
fn transfer_scaler(hmm: &GaussianHmm, from: &ScalerParams, to: &ScalerParams) -> GaussianHmm {
    if from == to {
        return hmm.clone();
    }
    let d = from.num_features();
    // z_to = ratio * z_from + offset
    let ratio: Vec<f64> = (0..d).map(|j| from.scales[j] / to.scales[j]).collect();
    let offset: Vec<f64> = (0..d)
        .map(|j| (from.means[j] - to.means[j]) / to.scales[j])
        .collect();

    let emissions = hmm
        .emissions
        .iter()
        .map(|e| {
            let mean = DVector::from_fn(d, |j, _| e.mean()[j] * ratio[j] + offset[j]);
            match e {
                RegimeDistribution::Diagonal { variances, .. } => RegimeDistribution::Diagonal {
                    mean,
                    variances: DVector::from_fn(d, |j, _| variances[j] * ratio[j] * ratio[j]),
                },
                RegimeDistribution::Full { covariance, .. } => RegimeDistribution::Full {
                    mean,
                    covariance: DMatrix::from_fn(d, d, |p, q| {
                        covariance[(p, q)] * ratio[p] * ratio[q]
                    }),
                },
            }
        })
        .collect();

    GaussianHmm {
        start_probs: hmm.start_probs.clone(),
        transition_matrix: hmm.transition_matrix.clone(),
        emissions,
    }
}
