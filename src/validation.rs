//! Validation and explainability adapter.
//!
//! Compares a fitted K-regime model against a single-regime null, produces
//! out-of-sample cumulative log-likelihood curves, and exports labelled
//! feature vectors and per-regime parameter tables for downstream
//! explainability tooling. Nothing here modifies the model under test.

use crate::{
    errors::{RegimeError, RegimeResult},
    label_stabilizer::RegimeIdentity,
    math_utils::{mean, sample_std},
    preprocessing::ObservationMatrix,
    regime_model::RegimeModel,
    regime_results::ModelCriteria,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Vuong test on per-observation log-likelihood differences.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VuongTest {
    /// `√N · mean(d) / sd(d)` with `d_t = ℓ_model(t) − ℓ_null(t)`
    pub statistic: f64,
    /// Two-sided p-value under the standard normal
    pub p_value: f64,
    /// Mean per-observation difference
    pub mean_difference: f64,
    /// Number of observations
    pub num_observations: usize,
}

impl VuongTest {
    /// Test from per-observation differences.
    pub fn from_differences(differences: &[f64]) -> RegimeResult<Self> {
        if differences.len() < 2 {
            return Err(RegimeError::InputShape {
                required: 1,
                actual: differences.len(),
                states: 0,
            });
        }
        let n = differences.len();
        let m = mean(differences);
        let sd = sample_std(differences);

        let statistic = if sd > f64::EPSILON {
            (n as f64).sqrt() * m / sd
        } else if m == 0.0 {
            0.0
        } else {
            m.signum() * f64::INFINITY
        };

        let normal = Normal::new(0.0, 1.0).map_err(|_| RegimeError::NumericalError {
            reason: "Failed to create standard normal distribution".to_string(),
            operation: Some("vuong_test".to_string()),
        })?;
        let p_value = 2.0 * (1.0 - normal.cdf(statistic.abs()));

        Ok(Self {
            statistic,
            p_value,
            mean_difference: m,
            num_observations: n,
        })
    }

    /// True when the model beats the null at `significance`.
    pub fn favours_model(&self, significance: f64) -> bool {
        self.statistic > 0.0 && self.p_value < significance
    }
}

/// K-regime model against the single-regime null on the same data.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NullComparison {
    /// Criteria of the single-regime model
    pub null: ModelCriteria,
    /// Criteria of the K-regime model
    pub model: ModelCriteria,
    /// `2 · (LL_model − LL_null)`
    pub likelihood_ratio: f64,
    /// Vuong test on the per-point log-likelihood differences
    pub vuong: VuongTest,
}

/// Fit the single-regime null model on `train` with `model`'s configuration.
pub fn fit_null_model(
    train: &ObservationMatrix,
    model: &RegimeModel,
) -> RegimeResult<RegimeModel> {
    let mut null = RegimeModel::with_initializer(model.config().clone(), model.initializer())?;
    null.fit(train, Some(1))?;
    Ok(null)
}

/// Compare a fitted `model` with a freshly fitted single-regime null on `train`.
pub fn compare_against_null(
    train: &ObservationMatrix,
    model: &RegimeModel,
) -> RegimeResult<NullComparison> {
    let k = model.num_states().ok_or_else(|| RegimeError::NotFitted {
        operation: "compare_against_null".to_string(),
    })?;
    let null = fit_null_model(train, model)?;

    let model_points = model.point_scores(train)?;
    let null_points = null.point_scores(train)?;
    let differences: Vec<f64> = model_points
        .iter()
        .zip(&null_points)
        .map(|(a, b)| a - b)
        .collect();

    let n = train.num_rows();
    let d = train.num_cols();
    let model_ll = model.score(train)?;
    let null_ll = null.score(train)?;
    let vuong = VuongTest::from_differences(&differences)?;

    log::debug!(
        "Null comparison: LL(1) = {:.4}, LL({}) = {:.4}, Vuong z = {:.3}",
        null_ll,
        k,
        model_ll,
        vuong.statistic
    );

    Ok(NullComparison {
        null: ModelCriteria::new(null_ll, 1, d, n),
        model: ModelCriteria::new(model_ll, k, d, n),
        likelihood_ratio: 2.0 * (model_ll - null_ll),
        vuong,
    })
}

/// Cumulative out-of-sample log-likelihood curves.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutOfSampleCurves {
    /// Cumulative per-point log-likelihood of the null model
    pub null: Vec<f64>,
    /// Cumulative per-point log-likelihood of the K-regime model
    pub model: Vec<f64>,
    /// `model − null` at each step
    pub difference: Vec<f64>,
}

impl OutOfSampleCurves {
    /// Final value of the difference curve.
    pub fn final_difference(&self) -> Option<f64> {
        self.difference.last().copied()
    }
}

/// Score `test` after `context` with both models and accumulate.
pub fn out_of_sample_curves(
    null: &RegimeModel,
    model: &RegimeModel,
    context: &ObservationMatrix,
    test: &ObservationMatrix,
) -> RegimeResult<OutOfSampleCurves> {
    let cumulative = |points: Vec<f64>| -> Vec<f64> {
        points
            .iter()
            .scan(0.0, |acc, &v| {
                *acc += v;
                Some(*acc)
            })
            .collect()
    };
    let null_curve = cumulative(null.point_scores_after(context, test)?);
    let model_curve = cumulative(model.point_scores_after(context, test)?);
    let difference = model_curve
        .iter()
        .zip(&null_curve)
        .map(|(m, n)| m - n)
        .collect();

    Ok(OutOfSampleCurves {
        null: null_curve,
        model: model_curve,
        difference,
    })
}

/// Feature vector with its decoded regime.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LabeledFeatures {
    /// Viterbi regime
    pub identity: RegimeIdentity,
    /// Observation in the caller's units
    pub features: Vec<f64>,
}

/// Pairs each row of `x` with its Viterbi regime.
pub fn labeled_features(
    model: &RegimeModel,
    x: &ObservationMatrix,
) -> RegimeResult<Vec<LabeledFeatures>> {
    let decoded = model.decode(x)?;
    Ok(decoded
        .labels
        .into_iter()
        .zip(x.rows())
        .map(|(identity, row)| LabeledFeatures {
            identity,
            features: row.to_vec(),
        })
        .collect())
}

/// Emission parameters and persistence of one regime.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegimeParameterRow {
    /// Regime identity
    pub identity: RegimeIdentity,
    /// Mean in the caller's units
    pub mean: Vec<f64>,
    /// Variances in the caller's units
    pub variances: Vec<f64>,
    /// Self-transition probability
    pub persistence: f64,
}

/// Parameter table of the fitted regimes, in identity order.
pub fn regime_parameter_table(model: &RegimeModel) -> RegimeResult<Vec<RegimeParameterRow>> {
    let regimes = model.regime_set_original_units()?;
    let transition = model.transition_matrix()?;
    Ok(regimes
        .iter()
        .map(|(identity, dist)| RegimeParameterRow {
            identity,
            mean: dist.mean().iter().copied().collect(),
            variances: dist.variances().iter().copied().collect(),
            persistence: transition[identity.index()][identity.index()],
        })
        .collect())
}
