//! # Regime Engine
//!
//! Regime-switching detection for multivariate indicator series.
//!
//! This crate fits K-state Gaussian hidden Markov models to a T×D matrix of
//! indicators, chooses K automatically, and keeps regime identities stable
//! across refits so that "regime 2" means the same market state from one
//! month to the next.
//!
//! ## Key Features
//!
//! - **Gaussian HMM**: scaled forward-backward, Viterbi decoding and Baum-Welch
//!   with diagonal or full covariances
//! - **State-Count Selection**: silhouette elbow, BIC and rolling
//!   cross-validation of the out-of-sample per-point likelihood
//! - **Label Stabilization**: min-cost assignment between consecutive regime
//!   sets, with newly born regimes numbered after the existing ones
//! - **Rolling Inference**: expanding-window warm-started refits with one-step
//!   posteriors and surprise monitoring
//! - **Validation**: null-model comparison (Vuong test), out-of-sample curves
//!   and explainability tables
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use regime_engine::{
//!     generate_block_switching_series, BlockRegime, GeneratorConfig, RegimeModel,
//!     RegimeModelConfig,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let regimes = vec![
//!         BlockRegime { mean: vec![0.0, 0.0, 0.0], std_dev: vec![0.3; 3] },
//!         BlockRegime { mean: vec![5.0, 5.0, 5.0], std_dev: vec![0.3; 3] },
//!     ];
//!     let config = GeneratorConfig { length: 200, seed: Some(7) };
//!     let series = generate_block_switching_series(&config, &regimes, 50)?;
//!
//!     let mut model = RegimeModel::new(RegimeModelConfig::seeded(42))?;
//!     let report = model.fit(&series.observations, None)?;
//!     println!("K = {}", report.k);
//!
//!     let decoded = model.decode(&series.observations)?;
//!     for change in decoded.change_points() {
//!         println!("t = {}: {} -> {}", change.index, change.from, change.to);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized around [`RegimeModel`], which owns the fitted HMM,
//! the z-score transform and the label stabilizer. [`StateCountSelector`] and
//! [`RollingInferenceEngine`] drive it; [`regime_detection`] wraps a complete
//! fit-and-decode run in one call.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod errors;
pub mod math_utils;
pub mod preprocessing;
pub mod secure_rng;

// Model components
pub mod clustering;
pub mod emission_models;
pub mod hmm_core;
pub mod label_stabilizer;
pub mod regime_config;
pub mod regime_model;
pub mod regime_results;

// Drivers
pub mod generators;
pub mod model_selection;
pub mod regime_detection;
pub mod rolling_inference;
pub mod validation;

// Re-exports for convenience - main public API
pub use errors::{NonConvergenceCondition, RegimeError, RegimeResult};
pub use preprocessing::{ObservationMatrix, ScalerParams};
pub use regime_config::{
    PointScoring, RegimeModelConfig, RollingConfig, SelectionConfig, StabilizerConfig,
};
pub use regime_model::{ModelSnapshot, RegimeModel};
pub use regime_results::{
    change_points, num_free_parameters, time_in_regime, DecodeResult, FitReport, ModelCriteria,
    PosteriorRecord, RegimeChangePoint, RegimeDetectionResult, RegimeStatistics,
};

// Model component exports
pub use clustering::{silhouette_score, ClusterInitializer, ClusterSeeds, KMeansInitializer};
pub use emission_models::{CovarianceType, EmissionDensity, RegimeDistribution};
pub use hmm_core::{EmOutcome, EmSettings, GaussianHmm};
pub use label_stabilizer::{
    cost_matrix, solve_assignment, LabelMapping, LabelStabilizer, RegimeIdentity, RegimeSet,
};

// Driver exports
pub use model_selection::{
    SelectionDiagnostics, SelectionRationale, SkippedEvaluation, StateCountSelector,
};
pub use regime_detection::{detect_regimes, detect_regimes_with_model};
pub use rolling_inference::{RollingInferenceEngine, RollingOutput, SurpriseMonitor};
pub use validation::{
    compare_against_null, fit_null_model, labeled_features, out_of_sample_curves,
    regime_parameter_table, NullComparison, OutOfSampleCurves, VuongTest,
};

// Data generation exports
pub use generators::{
    generate_block_switching_series, generate_hmm_series, well_separated_hmm, BlockRegime,
    GeneratorConfig, SyntheticSeries,
};
