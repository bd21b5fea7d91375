//! Automatic choice of the number of regimes.
//!
//! Three estimators are reconciled:
//!
//! 1. a greedy silhouette elbow, used as an informal upper bound,
//! 2. BIC over a training prefix, `BIC(k) = −2·LL + p(k,D)·ln N`,
//! 3. rolling cross-validation of the out-of-sample per-point log-likelihood.
//!
//! When BIC and CV disagree, the candidate with the higher CV score wins.
//! Cross-validation folds are independent fits and run in parallel when the
//! `parallel` feature is enabled; every fold draws from its own derived seed so
//! the outcome does not depend on scheduling.

use crate::{
    clustering::{silhouette_score, ClusterInitializer},
    errors::{RegimeError, RegimeResult},
    label_stabilizer::RegimeIdentity,
    preprocessing::ObservationMatrix,
    regime_config::{RegimeModelConfig, SelectionConfig},
    regime_model::RegimeModel,
    regime_results::ModelCriteria,
    secure_rng::{derive_seed, SecureRng},
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Silhouette score of one elbow candidate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ElbowPoint {
    /// Number of regimes
    pub k: usize,
    /// Silhouette of the decoded states; `None` when fewer than two states were used
    pub silhouette: Option<f64>,
}

/// One row of the BIC table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BicRow {
    /// Number of regimes
    pub k: usize,
    /// Criteria of the fit on the training prefix
    pub criteria: ModelCriteria,
    /// True when the fit met its EM tolerance
    pub converged: bool,
}

/// Out-of-sample score of one CV fold.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FoldScore {
    /// Position of the fold in the fold sequence
    pub fold_index: usize,
    /// Rows in the training prefix
    pub train_len: usize,
    /// Summed per-point log-likelihood of the test window
    pub score: f64,
}

/// One row of the CV table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CvRow {
    /// Number of regimes
    pub k: usize,
    /// Folds that could be evaluated
    pub folds: Vec<FoldScore>,
    /// Mean fold score
    pub mean: f64,
}

/// A candidate or fold that was skipped.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SkippedEvaluation {
    /// Number of regimes
    pub k: usize,
    /// CV fold, or `None` for a whole candidate
    pub fold_index: Option<usize>,
    /// Why it was skipped
    pub reason: String,
}

/// How the final K was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SelectionRationale {
    /// BIC and CV chose the same K
    Agreement,
    /// They disagreed and the CV choice scored at least as well out of sample
    CvPreferred,
    /// They disagreed and the BIC choice scored better out of sample
    BicPreferred,
    /// No CV fold could be evaluated
    BicOnly,
    /// No BIC candidate could be fitted
    CvOnly,
}

/// Everything the selector computed on its way to K.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelectionDiagnostics {
    /// Silhouette score per elbow candidate
    pub elbow_trace: Vec<ElbowPoint>,
    /// Last non-decreasing elbow point
    pub elbow_k: Option<usize>,
    /// K range searched by BIC and CV
    pub search_range: (usize, usize),
    /// BIC per fitted candidate
    pub bic_table: Vec<BicRow>,
    /// K with minimal BIC
    pub bic_k: Option<usize>,
    /// CV scores per candidate with at least one usable fold
    pub cv_table: Vec<CvRow>,
    /// K with maximal mean CV score
    pub cv_k: Option<usize>,
    /// Skipped candidates and folds
    pub skipped: Vec<SkippedEvaluation>,
    /// Selected K
    pub chosen_k: usize,
    /// How `chosen_k` was reached
    pub rationale: SelectionRationale,
}

impl SelectionDiagnostics {
    /// CV table row for `k`.
    pub fn cv_row(&self, k: usize) -> Option<&CvRow> {
        self.cv_table.iter().find(|r| r.k == k)
    }

    /// BIC table row for `k`.
    pub fn bic_row(&self, k: usize) -> Option<&BicRow> {
        self.bic_table.iter().find(|r| r.k == k)
    }
}

/// Chooses the number of regimes for a standardized observation matrix.
#[derive(Debug, Clone)]
pub struct StateCountSelector {
    candidate_config: RegimeModelConfig,
    selection: SelectionConfig,
    initializer: Arc<dyn ClusterInitializer>,
    base_seed: u64,
}

impl StateCountSelector {
    /// Selector fitting candidates like `config` describes.
    ///
    /// Candidates never re-standardize: the selector expects the matrix the
    /// regime model has already transformed.
    pub fn new(config: &RegimeModelConfig, initializer: Arc<dyn ClusterInitializer>) -> Self {
        let base_seed = config
            .seed
            .unwrap_or_else(|| SecureRng::new().usize(0..usize::MAX) as u64);
        let mut candidate_config = config.clone();
        candidate_config.standardize = false;
        Self {
            selection: config.selection.clone(),
            candidate_config,
            initializer,
            base_seed,
        }
    }

    /// Selection settings in use.
    pub fn config(&self) -> &SelectionConfig {
        &self.selection
    }

    fn candidate(&self, stream: u64, n_iter: usize, tol: f64) -> RegimeResult<RegimeModel> {
        let mut config = self.candidate_config.clone();
        config.seed = Some(derive_seed(self.base_seed, stream));
        config.n_iter = n_iter;
        config.tol = tol;
        RegimeModel::with_initializer(config, Arc::clone(&self.initializer))
    }

    /// Run all three estimators and reconcile them.
    pub fn select(&self, x: &ObservationMatrix) -> RegimeResult<SelectionDiagnostics> {
        self.selection.validate()?;
        let (elbow_k, elbow_trace) = self.elbow(x);

        let lo = self.selection.k_min;
        let hi = match elbow_k {
            Some(e) if self.selection.elbow_upper_bound => lo.max(self.selection.k_max.min(e)),
            _ => self.selection.k_max,
        };

        let (bic_table, mut skipped) = self.bic_table(x, lo..=hi);
        let (cv_table, cv_skipped) = self.cv_table(x, lo..=hi);
        skipped.extend(cv_skipped);

        let bic_k = best_bic(&bic_table);
        let cv_k = best_cv(&cv_table);
        let (chosen_k, rationale) =
            combine(bic_k, cv_k, &cv_table).ok_or_else(|| RegimeError::ModelSelectionFailed {
                reason: format!(
                    "no candidate in {}..={} could be evaluated ({} skipped)",
                    lo,
                    hi,
                    skipped.len()
                ),
            })?;

        log::info!(
            "Selected k = {} ({:?}; elbow {:?}, BIC {:?}, CV {:?})",
            chosen_k,
            rationale,
            elbow_k,
            bic_k,
            cv_k
        );

        Ok(SelectionDiagnostics {
            elbow_trace,
            elbow_k,
            search_range: (lo, hi),
            bic_table,
            bic_k,
            cv_table,
            cv_k,
            skipped,
            chosen_k,
            rationale,
        })
    }

    /// Greedy silhouette elbow.
    ///
    /// Starts at K = max(2, k_min) and keeps increasing K while the silhouette
    /// of the decoded states does not decrease. Returns the last
    /// non-decreasing K (capped at `k_max`) and the trace.
    pub fn elbow(&self, x: &ObservationMatrix) -> (Option<usize>, Vec<ElbowPoint>) {
        let mut trace = Vec::new();
        let mut best = -1.0;
        let mut elbow_k = None;

        let start = self.selection.k_min.max(2);
        for k in start..=self.selection.k_max {
            let silhouette = match self.elbow_candidate(x, k) {
                Ok(s) => s,
                Err(e) => {
                    log::debug!("Elbow search stopped at k = {}: {}", k, e);
                    break;
                }
            };
            trace.push(ElbowPoint { k, silhouette });
            match silhouette {
                Some(s) if s >= best => {
                    best = s;
                    elbow_k = Some(k);
                }
                _ => break,
            }
        }

        (elbow_k, trace)
    }

    fn elbow_candidate(&self, x: &ObservationMatrix, k: usize) -> RegimeResult<Option<f64>> {
        let mut model = self.candidate(
            k as u64,
            self.candidate_config.n_iter,
            self.candidate_config.tol,
        )?;
        model.fit(x, Some(k))?;
        let decoded = model.decode(x)?;
        let labels: Vec<usize> = decoded.labels.iter().map(|l| l.index()).collect();
        Ok(silhouette_score(x, &labels))
    }

    /// BIC of every candidate in `ks`, fitted on the BIC training prefix.
    pub fn bic_table(
        &self,
        x: &ObservationMatrix,
        ks: RangeInclusive<usize>,
    ) -> (Vec<BicRow>, Vec<SkippedEvaluation>) {
        let train_len = self
            .selection
            .bic_train_len
            .unwrap_or(x.num_rows())
            .min(x.num_rows());
        let train = x.prefix(train_len);

        let mut rows = Vec::new();
        let mut skipped = Vec::new();
        for k in ks {
            match self.bic_candidate(&train, k) {
                Ok(row) => {
                    log::debug!("BIC(k = {}) = {:.4}", k, row.criteria.bic);
                    rows.push(row);
                }
                Err(e) => {
                    log::warn!("BIC candidate k = {} skipped: {}", k, e);
                    skipped.push(SkippedEvaluation {
                        k,
                        fold_index: None,
                        reason: e.to_string(),
                    });
                }
            }
        }
        (rows, skipped)
    }

    fn bic_candidate(&self, train: &ObservationMatrix, k: usize) -> RegimeResult<BicRow> {
        let mut model = self.candidate(
            (1 << 32) | k as u64,
            self.selection.bic_n_iter,
            self.selection.bic_tol,
        )?;
        let report = model.fit(train, Some(k))?;
        let log_likelihood = model.score(train)?;
        Ok(BicRow {
            k,
            criteria: ModelCriteria::new(log_likelihood, k, train.num_cols(), train.num_rows()),
            converged: report.converged,
        })
    }

    /// Start row of every CV fold for a series of `num_rows` rows.
    ///
    /// Folds start at `initial_train` (half the rows by default) and advance
    /// by `step` while a full test window plus one row remains.
    pub fn fold_starts(&self, num_rows: usize) -> Vec<usize> {
        let initial = self.selection.initial_train.unwrap_or(num_rows / 2);
        let horizon = self.selection.test_horizon;
        (initial..)
            .step_by(self.selection.step)
            .take_while(|&s| s + horizon < num_rows)
            .collect()
    }

    /// Rolling cross-validation of every candidate in `ks`.
    ///
    /// Degenerate or failing folds are skipped and recorded; a candidate with
    /// no usable fold is absent from the table.
    pub fn cv_table(
        &self,
        x: &ObservationMatrix,
        ks: RangeInclusive<usize>,
    ) -> (Vec<CvRow>, Vec<SkippedEvaluation>) {
        let starts = self.fold_starts(x.num_rows());
        let tasks: Vec<(usize, usize, usize)> = ks
            .clone()
            .flat_map(|k| {
                starts
                    .iter()
                    .enumerate()
                    .map(move |(fold_index, &start)| (k, fold_index, start))
            })
            .collect();

        #[cfg(feature = "parallel")]
        let results: Vec<RegimeResult<f64>> = {
            use rayon::prelude::*;
            tasks
                .par_iter()
                .map(|&(k, fold_index, start)| self.evaluate_fold(x, k, fold_index, start))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let results: Vec<RegimeResult<f64>> = tasks
            .iter()
            .map(|&(k, fold_index, start)| self.evaluate_fold(x, k, fold_index, start))
            .collect();

        let mut rows = Vec::new();
        let mut skipped = Vec::new();
        for k in ks {
            let mut folds = Vec::new();
            for (&(task_k, fold_index, start), result) in tasks.iter().zip(&results) {
                if task_k != k {
                    continue;
                }
                match result {
                    Ok(score) => folds.push(FoldScore {
                        fold_index,
                        train_len: start,
                        score: *score,
                    }),
                    Err(e) => {
                        log::warn!("CV fold {} for k = {} skipped: {}", fold_index, k, e);
                        skipped.push(SkippedEvaluation {
                            k,
                            fold_index: Some(fold_index),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if folds.is_empty() {
                skipped.push(SkippedEvaluation {
                    k,
                    fold_index: None,
                    reason: format!("no usable CV fold out of {}", starts.len()),
                });
                continue;
            }
            let mean = folds.iter().map(|f| f.score).sum::<f64>() / folds.len() as f64;
            log::debug!("CV(k = {}) = {:.4} over {} folds", k, mean, folds.len());
            rows.push(CvRow { k, folds, mean });
        }
        (rows, skipped)
    }

    /// Fit on `x[..start]` and score `x[start..start + test_horizon]`.
    pub fn evaluate_fold(
        &self,
        x: &ObservationMatrix,
        k: usize,
        fold_index: usize,
        start: usize,
    ) -> RegimeResult<f64> {
        let min_rows = k * self.candidate_config.min_samples_per_state;
        if start <= min_rows {
            return Err(RegimeError::DegenerateFold {
                fold_index,
                reason: format!(
                    "{} training rows cannot support {} states (need more than {})",
                    start, k, min_rows
                ),
            });
        }
        let train = x.prefix(start);
        let test = x.slice_rows(start..start + self.selection.test_horizon);
        if test.is_empty() {
            return Err(RegimeError::DegenerateFold {
                fold_index,
                reason: "empty test window".to_string(),
            });
        }

        let stream = (2 << 32) | ((k as u64) << 16) | fold_index as u64;
        let mut model = self.candidate(stream, self.selection.cv_n_iter, self.selection.cv_tol)?;
        model.fit(&train, Some(k))?;

        let decoded = model.decode(&train)?;
        check_class_support(&decoded.labels, k, self.selection.min_class_examples)
            .map_err(|reason| RegimeError::DegenerateFold { fold_index, reason })?;

        Ok(model.point_scores_after(&train, &test)?.iter().sum())
    }
}

/// Checks that every one of the `k` regimes is decoded at least
/// `min_examples` times.
pub fn check_class_support(
    labels: &[RegimeIdentity],
    k: usize,
    min_examples: usize,
) -> Result<(), String> {
    let mut counts = vec![0usize; k];
    for label in labels {
        if let Some(c) = counts.get_mut(label.index()) {
            *c += 1;
        }
    }
    match counts.iter().enumerate().find(|(_, &c)| c < min_examples) {
        Some((i, &c)) => Err(format!(
            "regime {} has {} decoded training example(s), need {}",
            i + 1,
            c,
            min_examples
        )),
        None => Ok(()),
    }
}

/// K with minimal BIC; the smaller K wins ties.
pub fn best_bic(table: &[BicRow]) -> Option<usize> {
    table
        .iter()
        .fold(None::<&BicRow>, |best, row| match best {
            Some(b) if b.criteria.bic <= row.criteria.bic => Some(b),
            _ => Some(row),
        })
        .map(|r| r.k)
}

/// K with maximal mean CV score; the smaller K wins ties.
pub fn best_cv(table: &[CvRow]) -> Option<usize> {
    table
        .iter()
        .fold(None::<&CvRow>, |best, row| match best {
            Some(b) if b.mean >= row.mean => Some(b),
            _ => Some(row),
        })
        .map(|r| r.k)
}

/// Reconcile the BIC and CV choices.
///
/// A candidate missing from the CV table scores −∞; ties go to the CV choice.
pub fn combine(
    bic_k: Option<usize>,
    cv_k: Option<usize>,
    cv_table: &[CvRow],
) -> Option<(usize, SelectionRationale)> {
    let cv_score = |k: usize| {
        cv_table
            .iter()
            .find(|r| r.k == k)
            .map_or(f64::NEG_INFINITY, |r| r.mean)
    };
    match (bic_k, cv_k) {
        (Some(b), Some(c)) if b == c => Some((b, SelectionRationale::Agreement)),
        (Some(b), Some(c)) => {
            if cv_score(c) >= cv_score(b) {
                Some((c, SelectionRationale::CvPreferred))
            } else {
                Some((b, SelectionRationale::BicPreferred))
            }
        }
        (Some(b), None) => Some((b, SelectionRationale::BicOnly)),
        (None, Some(c)) => Some((c, SelectionRationale::CvOnly)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::KMeansInitializer;

    fn cv_row(k: usize, mean: f64) -> CvRow {
        CvRow {
            k,
            folds: vec![FoldScore {
                fold_index: 0,
                train_len: 10,
                score: mean,
            }],
            mean,
        }
    }

    fn ids(labels: &[usize]) -> Vec<RegimeIdentity> {
        labels
            .iter()
            .map(|&l| RegimeIdentity::new(l).unwrap())
            .collect()
    }

    #[test]
    fn test_combine_rules() {
        let table = vec![cv_row(2, -10.0), cv_row(3, -12.0)];
        assert_eq!(
            combine(Some(2), Some(2), &table),
            Some((2, SelectionRationale::Agreement))
        );
        assert_eq!(
            combine(Some(3), Some(2), &table),
            Some((2, SelectionRationale::CvPreferred))
        );
        // BIC choice missing from the CV table counts as -inf
        assert_eq!(
            combine(Some(5), Some(3), &table),
            Some((3, SelectionRationale::CvPreferred))
        );
        assert_eq!(
            combine(Some(4), None, &[]),
            Some((4, SelectionRationale::BicOnly))
        );
        assert_eq!(
            combine(None, Some(3), &table),
            Some((3, SelectionRationale::CvOnly))
        );
        assert_eq!(combine(None, None, &[]), None);
    }

    #[test]
    fn test_best_cv_prefers_smaller_k_on_ties() {
        let table = vec![cv_row(2, -5.0), cv_row(3, -5.0), cv_row(4, -6.0)];
        assert_eq!(best_cv(&table), Some(2));
        assert_eq!(best_cv(&[]), None);
    }

    #[test]
    fn test_class_support() {
        assert!(check_class_support(&ids(&[1, 1, 2, 2]), 2, 2).is_ok());
        let err = check_class_support(&ids(&[1, 1, 1, 2]), 2, 2).unwrap_err();
        assert!(err.contains("regime 2 has 1"));
        // a state never decoded has zero examples
        assert!(check_class_support(&ids(&[1, 1, 1]), 2, 1).is_err());
    }

    #[test]
    fn test_fold_starts() {
        let config = RegimeModelConfig {
            selection: SelectionConfig {
                initial_train: Some(100),
                ..SelectionConfig::default()
            },
            ..RegimeModelConfig::seeded(1)
        };
        let selector = StateCountSelector::new(&config, Arc::new(KMeansInitializer::default()));
        assert_eq!(
            selector.fold_starts(200),
            vec![100, 112, 124, 136, 148, 160, 172, 184]
        );
        assert!(selector.fold_starts(110).is_empty());
    }

    #[test]
    fn test_short_training_prefix_is_degenerate() {
        let config = RegimeModelConfig::seeded(1);
        let selector = StateCountSelector::new(&config, Arc::new(KMeansInitializer::default()));
        let x = ObservationMatrix::from_rows((0..40).map(|i| vec![i as f64]).collect()).unwrap();
        assert!(matches!(
            selector.evaluate_fold(&x, 2, 0, 6),
            Err(RegimeError::DegenerateFold { fold_index: 0, .. })
        ));
    }
}
