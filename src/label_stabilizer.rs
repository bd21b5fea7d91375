//! Stable regime identities across refits.
//!
//! EM numbers its states arbitrarily, so two fits of nearly the same data can
//! swap them. The [`LabelStabilizer`] matches the regimes of a new fit to the
//! identities of the previous one by solving a min-cost assignment over
//! `C[i,j] = α·‖μ_i − μ_j‖₂ + (1 − α)·‖Σ_i − Σ_j‖_F` with the Hungarian
//! (Kuhn–Munkres) algorithm. New regimes that find no confident partner are
//! "born" with the next unused label.

use crate::{
    emission_models::RegimeDistribution,
    errors::{RegimeError, RegimeResult},
    math_utils::float_total_cmp,
    regime_config::StabilizerConfig,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable 1-based regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RegimeIdentity(usize);

impl RegimeIdentity {
    /// Identity with the given label; `None` for zero.
    pub fn new(label: usize) -> Option<Self> {
        (label > 0).then_some(Self(label))
    }

    /// Identity occupying zero-based position `index` in identity order.
    pub fn from_index(index: usize) -> Self {
        Self(index + 1)
    }

    /// The 1-based label.
    pub fn get(self) -> usize {
        self.0
    }

    /// Zero-based position in identity order.
    pub fn index(self) -> usize {
        self.0 - 1
    }
}

impl fmt::Display for RegimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Regime distributions keyed by identity 1..K.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegimeSet {
    regimes: Vec<RegimeDistribution>,
}

impl RegimeSet {
    /// Build from distributions already in identity order.
    pub fn new(regimes: Vec<RegimeDistribution>) -> Self {
        Self { regimes }
    }

    /// Number of regimes.
    pub fn len(&self) -> usize {
        self.regimes.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.regimes.is_empty()
    }

    /// Distribution of one identity.
    pub fn get(&self, identity: RegimeIdentity) -> Option<&RegimeDistribution> {
        self.regimes.get(identity.index())
    }

    /// All identities, ascending.
    pub fn identities(&self) -> Vec<RegimeIdentity> {
        (0..self.regimes.len()).map(RegimeIdentity::from_index).collect()
    }

    /// Iterate over (identity, distribution) pairs in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (RegimeIdentity, &RegimeDistribution)> + '_ {
        self.regimes
            .iter()
            .enumerate()
            .map(|(i, r)| (RegimeIdentity::from_index(i), r))
    }

    /// Distributions in identity order.
    pub fn distributions(&self) -> &[RegimeDistribution] {
        &self.regimes
    }
}

/// Result of matching a new fit's states to stable identities.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LabelMapping {
    /// Identity of each new state, indexed by state
    pub identities: Vec<RegimeIdentity>,
    /// Identities created by this mapping
    pub born: Vec<RegimeIdentity>,
    /// Assignment weight of new state `j` to old identity `i`, in [0, 1]
    pub weights: Vec<Vec<f64>>,
    /// Cost of pairing new state `j` with old identity `i`
    pub costs: Vec<Vec<f64>>,
    /// Summed cost of the matched pairs
    pub total_cost: f64,
}

impl LabelMapping {
    /// Mapping that numbers states by ascending first mean coordinate.
    ///
    /// Used when no previous identities exist; every identity is born.
    pub fn by_first_coordinate(regimes: &[RegimeDistribution]) -> Self {
        let mut order: Vec<usize> = (0..regimes.len()).collect();
        order.sort_by(|&a, &b| {
            let ma = regimes[a].mean().get(0).copied().unwrap_or(0.0);
            let mb = regimes[b].mean().get(0).copied().unwrap_or(0.0);
            float_total_cmp(&ma, &mb).then(a.cmp(&b))
        });
        let mut identities = vec![RegimeIdentity::from_index(0); regimes.len()];
        for (position, &state) in order.iter().enumerate() {
            identities[state] = RegimeIdentity::from_index(position);
        }
        let mut born = identities.clone();
        born.sort();
        Self {
            identities,
            born,
            weights: Vec::new(),
            costs: Vec::new(),
            total_cost: 0.0,
        }
    }

    /// Number of mapped states.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// True when no states are mapped.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identity of state `state`.
    pub fn identity_of(&self, state: usize) -> RegimeIdentity {
        self.identities[state]
    }

    /// True when the identities are exactly {1..K}.
    pub fn is_consecutive(&self) -> bool {
        let mut labels: Vec<usize> = self.identities.iter().map(|i| i.get()).collect();
        labels.sort_unstable();
        labels.iter().enumerate().all(|(i, &l)| l == i + 1)
    }

    /// True when every state keeps its index as identity.
    pub fn is_identity(&self) -> bool {
        self.identities
            .iter()
            .enumerate()
            .all(|(state, id)| id.index() == state)
    }

    /// State order that puts identities ascending: `order[p]` is the state
    /// whose identity sits at position `p`.
    pub fn state_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.identities.len()).collect();
        order.sort_by_key(|&s| self.identities[s]);
        order
    }
}

/// Pairing cost between two regimes.
pub fn pairing_cost(a: &RegimeDistribution, b: &RegimeDistribution, alpha: f64) -> f64 {
    alpha * a.mean_distance(b) + (1.0 - alpha) * a.covariance_distance(b)
}

/// Cost matrix with one row per new regime and one column per old identity.
pub fn cost_matrix(
    previous: &RegimeSet,
    current: &[RegimeDistribution],
    alpha: f64,
) -> Vec<Vec<f64>> {
    current
        .iter()
        .map(|new| {
            previous
                .distributions()
                .iter()
                .map(|old| pairing_cost(new, old, alpha))
                .collect()
        })
        .collect()
}

/// Rectangular min-cost assignment (Kuhn–Munkres with potentials).
///
/// Returns, for every row, the matched column; when there are more rows than
/// columns the surplus rows stay unmatched. Rows are inserted in index order
/// and column scans use strict comparisons, so among equal-cost optima the
/// lower-indexed rows keep the earlier columns.
pub fn solve_assignment(cost: &[Vec<f64>]) -> RegimeResult<Vec<Option<usize>>> {
    let rows = cost.len();
    if rows == 0 {
        return Ok(Vec::new());
    }
    let cols = cost[0].len();
    if cost.iter().any(|r| r.len() != cols) {
        return Err(RegimeError::InfeasibleAssignment {
            reason: "cost matrix rows have different lengths".to_string(),
        });
    }
    if let Some(bad) = cost.iter().flatten().find(|c| !c.is_finite()) {
        return Err(RegimeError::InfeasibleAssignment {
            reason: format!("non-finite assignment cost {}", bad),
        });
    }
    if cols == 0 {
        return Ok(vec![None; rows]);
    }

    if rows <= cols {
        hungarian(cost, rows, cols)
    } else {
        let transposed: Vec<Vec<f64>> = (0..cols)
            .map(|j| (0..rows).map(|i| cost[i][j]).collect())
            .collect();
        let col_to_row = hungarian(&transposed, cols, rows)?;
        let mut row_to_col = vec![None; rows];
        for (j, matched) in col_to_row.into_iter().enumerate() {
            if let Some(i) = matched {
                row_to_col[i] = Some(j);
            }
        }
        Ok(row_to_col)
    }
}

/// Hungarian algorithm for `n <= m`; every row is matched.
fn hungarian(cost: &[Vec<f64>], n: usize, m: usize) -> RegimeResult<Vec<Option<usize>>> {
    // 1-based potentials, column 0 is the virtual start column
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if !used[j] {
                    let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }
            if j1 == 0 || !delta.is_finite() {
                return Err(RegimeError::InfeasibleAssignment {
                    reason: format!("no augmenting path for row {}", i - 1),
                });
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![None; n];
    for j in 1..=m {
        if p[j] != 0 {
            row_to_col[p[j] - 1] = Some(j - 1);
        }
    }
    Ok(row_to_col)
}

/// Keeps regime numbering consistent across refits.
#[derive(Debug, Clone, Default)]
pub struct LabelStabilizer {
    config: StabilizerConfig,
    last_mapping: Option<LabelMapping>,
}

impl LabelStabilizer {
    /// Stabilizer with the given settings.
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            last_mapping: None,
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &StabilizerConfig {
        &self.config
    }

    /// Mapping produced by the most recent call.
    pub fn last_mapping(&self) -> Option<&LabelMapping> {
        self.last_mapping.as_ref()
    }

    /// Forget the previous mapping.
    pub fn reset(&mut self) {
        self.last_mapping = None;
    }

    /// Record a mapping produced elsewhere (identity reset or restore).
    pub fn record(&mut self, mapping: LabelMapping) {
        self.last_mapping = Some(mapping);
    }

    /// Map each regime of `current` to a stable identity.
    ///
    /// A new regime inherits the identity of its assigned old regime when the
    /// assignment weight reaches the confident-match threshold. Every other new
    /// regime is born with the next unused label, in new-regime index order.
    /// Matched weights are exactly 1, so only unmatched regimes are born.
    pub fn stabilize(
        &mut self,
        previous: &RegimeSet,
        current: &[RegimeDistribution],
    ) -> RegimeResult<LabelMapping> {
        let costs = cost_matrix(previous, current, self.config.alpha);
        let assignment = solve_assignment(&costs)?;

        let num_old = previous.len();
        let mut weights = vec![vec![0.0; num_old]; current.len()];
        for (j, matched) in assignment.iter().enumerate() {
            if let Some(i) = *matched {
                weights[j][i] = 1.0;
            }
        }

        let mut next_label = num_old + 1;
        let mut identities = Vec::with_capacity(current.len());
        let mut born = Vec::new();
        let mut total_cost = 0.0;
        for (j, matched) in assignment.iter().enumerate() {
            match *matched {
                Some(i) if weights[j][i] >= self.config.confident_match => {
                    total_cost += costs[j][i];
                    identities.push(RegimeIdentity::from_index(i));
                }
                _ => {
                    let id = RegimeIdentity(next_label);
                    next_label += 1;
                    born.push(id);
                    identities.push(id);
                }
            }
        }

        if !born.is_empty() {
            log::info!(
                "Label stabilizer: {} regime(s) born ({:?})",
                born.len(),
                born.iter().map(|b| b.get()).collect::<Vec<_>>()
            );
        }

        let mapping = LabelMapping {
            identities,
            born,
            weights,
            costs,
            total_cost,
        };
        self.last_mapping = Some(mapping.clone());
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DVector;

    fn regime(m: f64, v: f64) -> RegimeDistribution {
        RegimeDistribution::Diagonal {
            mean: DVector::from_vec(vec![m, m]),
            variances: DVector::from_vec(vec![v, v]),
        }
    }

    #[test]
    fn test_identical_sets_give_diagonal_assignment() {
        let regimes = vec![regime(0.0, 1.0), regime(3.0, 0.5), regime(-4.0, 2.0)];
        let previous = RegimeSet::new(regimes.clone());
        let mut stabilizer = LabelStabilizer::default();
        let mapping = stabilizer.stabilize(&previous, &regimes).unwrap();

        assert!(mapping.is_identity());
        assert!(mapping.born.is_empty());
        assert_approx_eq!(mapping.total_cost, 0.0, 1e-12);
        for (j, row) in mapping.weights.iter().enumerate() {
            for (i, &w) in row.iter().enumerate() {
                assert_eq!(w, if i == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_permuted_fit_recovers_identities() {
        let previous = RegimeSet::new(vec![regime(0.0, 1.0), regime(5.0, 1.0)]);
        let current = vec![regime(5.1, 1.1), regime(-0.1, 0.9)];
        let mapping = LabelStabilizer::default()
            .stabilize(&previous, &current)
            .unwrap();
        assert_eq!(mapping.identity_of(0).get(), 2);
        assert_eq!(mapping.identity_of(1).get(), 1);
        assert_eq!(mapping.state_order(), vec![1, 0]);
    }

    #[test]
    fn test_extra_regime_is_born_with_next_label() {
        let previous = RegimeSet::new(vec![regime(0.0, 1.0), regime(5.0, 1.0)]);
        let current = vec![regime(10.0, 1.0), regime(5.0, 1.0), regime(0.0, 1.0)];
        let mut stabilizer = LabelStabilizer::default();
        let mapping = stabilizer.stabilize(&previous, &current).unwrap();
        assert_eq!(mapping.identity_of(0).get(), 3);
        assert_eq!(mapping.identity_of(1).get(), 2);
        assert_eq!(mapping.identity_of(2).get(), 1);
        assert_eq!(mapping.born, vec![RegimeIdentity::from_index(2)]);
        assert!(mapping.is_consecutive());
        assert!(stabilizer.last_mapping().is_some());
    }

    #[test]
    fn test_hard_weights_make_every_threshold_accept_matches() {
        let previous = RegimeSet::new(vec![regime(0.0, 1.0), regime(5.0, 1.0)]);
        let current = vec![regime(9.0, 3.0), regime(-6.0, 0.2)];
        let mut lenient = LabelStabilizer::new(StabilizerConfig {
            confident_match: 0.0,
            ..StabilizerConfig::default()
        });
        let mut strict = LabelStabilizer::new(StabilizerConfig {
            confident_match: 1.0,
            ..StabilizerConfig::default()
        });
        let a = lenient.stabilize(&previous, &current).unwrap();
        let b = strict.stabilize(&previous, &current).unwrap();
        assert_eq!(a.identities, b.identities);
        assert!(b.born.is_empty());
    }

    #[test]
    fn test_non_finite_cost_is_infeasible() {
        let cost = vec![vec![0.0, f64::NAN], vec![1.0, 2.0]];
        assert!(matches!(
            solve_assignment(&cost),
            Err(RegimeError::InfeasibleAssignment { .. })
        ));
    }

    #[test]
    fn test_hungarian_finds_optimum() {
        let cost = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        let assignment = solve_assignment(&cost).unwrap();
        assert_eq!(assignment, vec![Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_rectangular_assignment() {
        // more rows than columns: the worst row stays unmatched
        let cost = vec![vec![1.0], vec![0.5], vec![3.0]];
        assert_eq!(solve_assignment(&cost).unwrap(), vec![None, Some(0), None]);

        let wide = vec![vec![3.0, 1.0, 2.0]];
        assert_eq!(solve_assignment(&wide).unwrap(), vec![Some(1)]);
    }

    #[test]
    fn test_ties_prefer_lowest_row_index() {
        let cost = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        assert_eq!(solve_assignment(&cost).unwrap(), vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_first_coordinate_ordering() {
        let regimes = vec![regime(2.0, 1.0), regime(-1.0, 1.0), regime(0.5, 1.0)];
        let mapping = LabelMapping::by_first_coordinate(&regimes);
        let labels: Vec<usize> = mapping.identities.iter().map(|i| i.get()).collect();
        assert_eq!(labels, vec![3, 1, 2]);
        assert_eq!(mapping.born.len(), 3);
    }

    #[test]
    fn test_identity_newtype() {
        assert!(RegimeIdentity::new(0).is_none());
        let id = RegimeIdentity::new(3).unwrap();
        assert_eq!(id.index(), 2);
        assert_eq!(id.to_string(), "3");
    }
}
