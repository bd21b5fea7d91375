//! Integration tests for snapshot persistence and probabilistic invariants.

use assert_approx_eq::assert_approx_eq;
use nalgebra::{DMatrix, DVector};
use regime_engine::{
    generators::*, CovarianceType, GaussianHmm, RegimeDistribution, RegimeModel,
    RegimeModelConfig,
};

fn correlated_hmm() -> GaussianHmm {
    GaussianHmm {
        start_probs: vec![0.5, 0.5],
        transition_matrix: vec![vec![0.95, 0.05], vec![0.1, 0.9]],
        emissions: vec![
            RegimeDistribution::Full {
                mean: DVector::from_vec(vec![0.0, 0.0]),
                covariance: DMatrix::from_row_slice(2, 2, &[1.0, 0.8, 0.8, 1.0]),
            },
            RegimeDistribution::Full {
                mean: DVector::from_vec(vec![4.0, -3.0]),
                covariance: DMatrix::from_row_slice(2, 2, &[0.5, -0.2, -0.2, 0.7]),
            },
        ],
    }
}

#[test]
fn test_full_covariance_fit_keeps_distributions_normalized() {
    let series = generate_hmm_series(
        &GeneratorConfig {
            length: 300,
            seed: Some(31),
        },
        &correlated_hmm(),
    )
    .unwrap();
    let x = &series.observations;

    let config = RegimeModelConfig {
        seed: Some(3),
        ..RegimeModelConfig::full_covariance()
    };
    assert_eq!(config.covariance_type, CovarianceType::Full);
    let mut model = RegimeModel::new(config).unwrap();
    let report = model.fit(x, Some(2)).unwrap();
    assert_eq!(report.k, 2);

    for row in model.transition_matrix().unwrap() {
        assert_approx_eq!(row.iter().sum::<f64>(), 1.0, 1e-9);
        assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }
    assert_approx_eq!(
        model.start_probabilities().unwrap().iter().sum::<f64>(),
        1.0,
        1e-9
    );

    let decoded = model.decode(x).unwrap();
    for posterior in &decoded.posteriors {
        assert_approx_eq!(posterior.iter().sum::<f64>(), 1.0, 1e-6);
    }

    // the correlation of regime 1 survives the round trip to caller units
    let regimes = model.regime_set_original_units().unwrap();
    let covariance = regimes.distributions()[0].covariance_matrix();
    let correlation = covariance[(0, 1)] / (covariance[(0, 0)] * covariance[(1, 1)]).sqrt();
    assert!(correlation > 0.6, "correlation {}", correlation);
}

#[test]
fn test_snapshot_restores_an_equivalent_model() {
    let series = generate_hmm_series(
        &GeneratorConfig {
            length: 200,
            seed: Some(4),
        },
        &well_separated_hmm(2, 3, 5.0, 0.95).unwrap(),
    )
    .unwrap();
    let x = &series.observations;

    let mut model = RegimeModel::new(RegimeModelConfig::seeded(10)).unwrap();
    model.fit(&x.prefix(150), Some(2)).unwrap();
    model.fit(x, Some(2)).unwrap();

    let snapshot = model.dump().unwrap();
    assert_eq!(snapshot.fit_count, 2);
    assert!(snapshot.prior_regimes.is_some());

    let restored = RegimeModel::load(snapshot.clone()).unwrap();
    assert_eq!(restored.dump().unwrap(), snapshot);
    assert_eq!(
        restored.decode(x).unwrap().labels,
        model.decode(x).unwrap().labels
    );
    assert_approx_eq!(restored.score(x).unwrap(), model.score(x).unwrap(), 1e-9);
}

#[cfg(feature = "serde")]
#[test]
fn test_snapshot_json_round_trip_resumes_warm_start() {
    let series = generate_hmm_series(
        &GeneratorConfig {
            length: 200,
            seed: Some(19),
        },
        &well_separated_hmm(2, 2, 6.0, 0.95).unwrap(),
    )
    .unwrap();
    let x = &series.observations;

    let mut model = RegimeModel::new(RegimeModelConfig::seeded(1)).unwrap();
    model.fit(&x.prefix(180), Some(2)).unwrap();

    let json = serde_json::to_string(&model.dump().unwrap()).unwrap();
    let snapshot = serde_json::from_str(&json).unwrap();
    let mut restored = RegimeModel::load(snapshot).unwrap();

    assert_approx_eq!(
        restored.score(&x.prefix(180)).unwrap(),
        model.score(&x.prefix(180)).unwrap(),
        1e-6
    );

    let report = restored.fit(x, Some(2)).unwrap();
    assert!(report.warm_started);
    assert!(report.label_mapping.is_identity());
}

#[cfg(feature = "serde")]
#[test]
fn test_absorbing_regime_statistics_survive_json() {
    let series = generate_hmm_series(
        &GeneratorConfig {
            length: 120,
            seed: Some(23),
        },
        &well_separated_hmm(2, 2, 6.0, 0.9).unwrap(),
    )
    .unwrap();
    let x = &series.observations;

    let mut model = RegimeModel::new(RegimeModelConfig::seeded(4)).unwrap();
    model.fit(x, Some(2)).unwrap();
    let mut snapshot = model.dump().unwrap();
    snapshot.transition_matrix = vec![vec![0.9, 0.1], vec![0.0, 1.0]];
    let absorbing = RegimeModel::load(snapshot).unwrap();

    let stats = absorbing.regime_statistics(x).unwrap();
    assert_approx_eq!(stats[0].expected_duration.unwrap(), 10.0, 1e-9);
    assert_eq!(stats[1].expected_duration, None);

    let json = serde_json::to_string(&stats).unwrap();
    let restored: Vec<regime_engine::RegimeStatistics> = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.len(), 2);
    assert_approx_eq!(restored[0].expected_duration.unwrap(), 10.0, 1e-9);
    assert_eq!(restored[1].expected_duration, None);
    assert_eq!(restored[1].occurrence_count, stats[1].occurrence_count);
}
