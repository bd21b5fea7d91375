//! One-call regime detection on a complete series.
//!
//! This module provides the main interface for detecting regimes in a
//! multivariate indicator series: fit (choosing K when none is given), decode,
//! and collect change points, regime statistics and information criteria in a
//! single [`RegimeDetectionResult`].

use crate::{
    errors::RegimeResult,
    preprocessing::ObservationMatrix,
    regime_config::RegimeModelConfig,
    regime_model::RegimeModel,
};

// Re-export the structures a detection run produces
pub use crate::model_selection::{SelectionDiagnostics, SelectionRationale};
pub use crate::regime_results::{
    ModelCriteria, RegimeChangePoint, RegimeDetectionResult, RegimeStatistics,
};

/// Detect regimes in `x` with a fresh model.
///
/// With `k = None` the number of regimes is chosen by the state-count
/// selector and its diagnostics are part of the result.
pub fn detect_regimes(
    x: &ObservationMatrix,
    k: Option<usize>,
    config: &RegimeModelConfig,
) -> RegimeResult<RegimeDetectionResult> {
    let mut model = RegimeModel::new(config.clone())?;
    detect_regimes_with_model(&mut model, x, k)
}

/// Detect regimes in `x` with an existing model.
///
/// A fitted model is refitted (warm-started when K is unchanged), so regime
/// identities stay comparable with earlier results from the same model.
pub fn detect_regimes_with_model(
    model: &mut RegimeModel,
    x: &ObservationMatrix,
    k: Option<usize>,
) -> RegimeResult<RegimeDetectionResult> {
    let fit_report = model.fit(x, k)?;
    let decoded = model.decode(x)?;
    let regime_statistics = model.regime_statistics(x)?;

    let model_criteria = ModelCriteria::new(
        decoded.log_likelihood,
        fit_report.k,
        x.num_cols(),
        x.num_rows(),
    );

    Ok(RegimeDetectionResult {
        k: fit_report.k,
        change_points: decoded.change_points(),
        labels: decoded.labels,
        posteriors: decoded.posteriors,
        transition_matrix: model.transition_matrix()?.to_vec(),
        regime_statistics,
        model_criteria,
        selection: if k.is_none() {
            model.selection_diagnostics().cloned()
        } else {
            None
        },
        fit_report,
    })
}
