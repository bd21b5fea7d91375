//! Observation containers and standardization.
//!
//! The feature provider hands the engine a T×D matrix of standardized
//! indicators. [`ObservationMatrix`] validates and stores it row-major;
//! [`ScalerParams`] is the per-column z-score transform fitted inside
//! [`crate::regime_model::RegimeModel::fit`] and carried in the model snapshot.

use crate::errors::{validate_all_finite, RegimeError, RegimeResult};
use crate::math_utils::mean;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Column scales below this are treated as constant columns.
const MIN_SCALE: f64 = 1e-12;

/// Dense T×D observation matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ObservationMatrix {
    data: Vec<f64>,
    num_rows: usize,
    num_cols: usize,
}

impl ObservationMatrix {
    /// Build from a list of rows. All rows must share the same non-zero width
    /// and contain only finite values.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> RegimeResult<Self> {
        let num_cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if num_cols == 0 {
            return Err(RegimeError::InputShape {
                required: 1,
                actual: 0,
                states: 0,
            });
        }

        let mut data = Vec::with_capacity(rows.len() * num_cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != num_cols {
                return Err(RegimeError::DimensionMismatch {
                    expected: num_cols,
                    actual: row.len(),
                });
            }
            validate_all_finite(row, &format!("observation row {}", i))?;
            data.extend_from_slice(row);
        }

        Ok(Self {
            data,
            num_rows: rows.len(),
            num_cols,
        })
    }

    /// Build from a row-major buffer.
    pub fn from_row_major(data: Vec<f64>, num_cols: usize) -> RegimeResult<Self> {
        if num_cols == 0 || data.len() % num_cols != 0 {
            return Err(RegimeError::DimensionMismatch {
                expected: num_cols,
                actual: data.len(),
            });
        }
        validate_all_finite(&data, "observation buffer")?;
        Ok(Self {
            num_rows: data.len() / num_cols,
            data,
            num_cols,
        })
    }

    /// Number of observations (T).
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Number of features (D).
    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    /// True when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Borrow row `i`.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.num_cols..(i + 1) * self.num_cols]
    }

    /// Iterate over rows.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.data.chunks_exact(self.num_cols)
    }

    /// Copy out a contiguous block of rows.
    pub fn slice_rows(&self, range: Range<usize>) -> ObservationMatrix {
        let end = range.end.min(self.num_rows);
        let start = range.start.min(end);
        Self {
            data: self.data[start * self.num_cols..end * self.num_cols].to_vec(),
            num_rows: end - start,
            num_cols: self.num_cols,
        }
    }

    /// The first `len` rows.
    pub fn prefix(&self, len: usize) -> ObservationMatrix {
        self.slice_rows(0..len)
    }

    /// Rows of `self` followed by rows of `other`.
    pub fn concat(&self, other: &ObservationMatrix) -> RegimeResult<ObservationMatrix> {
        if other.num_cols != self.num_cols {
            return Err(RegimeError::DimensionMismatch {
                expected: self.num_cols,
                actual: other.num_cols,
            });
        }
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Ok(Self {
            data,
            num_rows: self.num_rows + other.num_rows,
            num_cols: self.num_cols,
        })
    }

    /// Append one observation.
    pub fn push_row(&mut self, row: &[f64]) -> RegimeResult<()> {
        if row.len() != self.num_cols {
            return Err(RegimeError::DimensionMismatch {
                expected: self.num_cols,
                actual: row.len(),
            });
        }
        validate_all_finite(row, "appended observation")?;
        self.data.extend_from_slice(row);
        self.num_rows += 1;
        Ok(())
    }

    /// Column `j` as an owned vector.
    pub fn column(&self, j: usize) -> Vec<f64> {
        self.rows().map(|r| r[j]).collect()
    }
}

/// Per-column z-score parameters: `z = (x - mean) / scale`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScalerParams {
    /// Column means
    pub means: Vec<f64>,
    /// Column scales (population standard deviation, 1.0 for constant columns)
    pub scales: Vec<f64>,
}

impl ScalerParams {
    /// Identity transform for `num_cols` features.
    pub fn identity(num_cols: usize) -> Self {
        Self {
            means: vec![0.0; num_cols],
            scales: vec![1.0; num_cols],
        }
    }

    /// Fit column means and population standard deviations.
    pub fn fit(x: &ObservationMatrix) -> RegimeResult<Self> {
        if x.is_empty() {
            return Err(RegimeError::InputShape {
                required: 1,
                actual: 0,
                states: 0,
            });
        }
        let n = x.num_rows() as f64;
        let mut means = Vec::with_capacity(x.num_cols());
        let mut scales = Vec::with_capacity(x.num_cols());
        for j in 0..x.num_cols() {
            let column = x.column(j);
            let m = mean(&column);
            let var = column.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n;
            let sd = var.sqrt();
            means.push(m);
            scales.push(if sd > MIN_SCALE { sd } else { 1.0 });
        }
        Ok(Self { means, scales })
    }

    /// Number of features this scaler was fitted on.
    pub fn num_features(&self) -> usize {
        self.means.len()
    }

    /// Log-Jacobian of the transform per observation, `-Σ ln scale_j`.
    ///
    /// Adding it to a log-density of `z` gives the log-density of `x`.
    pub fn log_jacobian(&self) -> f64 {
        -self.scales.iter().map(|s| s.ln()).sum::<f64>()
    }

    /// Apply the transform.
    pub fn transform(&self, x: &ObservationMatrix) -> RegimeResult<ObservationMatrix> {
        if x.num_cols() != self.num_features() {
            return Err(RegimeError::DimensionMismatch {
                expected: self.num_features(),
                actual: x.num_cols(),
            });
        }
        let mut data = Vec::with_capacity(x.num_rows() * x.num_cols());
        for row in x.rows() {
            for (j, &v) in row.iter().enumerate() {
                data.push((v - self.means[j]) / self.scales[j]);
            }
        }
        ObservationMatrix::from_row_major(data, x.num_cols())
    }

    /// Map a standardized vector back to the original units.
    pub fn inverse_transform_row(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .enumerate()
            .map(|(j, &v)| v * self.scales[j] + self.means[j])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sample() -> ObservationMatrix {
        ObservationMatrix::from_rows(vec![
            vec![1.0, 10.0],
            vec![2.0, 10.0],
            vec![3.0, 10.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_from_rows_rejects_ragged_input() {
        let result = ObservationMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(
            result,
            Err(RegimeError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_from_rows_rejects_nan() {
        let result = ObservationMatrix::from_rows(vec![vec![1.0], vec![f64::NAN]]);
        assert!(matches!(result, Err(RegimeError::NumericalError { .. })));
    }

    #[test]
    fn test_slicing_and_concat() {
        let x = sample();
        let head = x.prefix(2);
        assert_eq!(head.num_rows(), 2);
        assert_eq!(head.row(1), &[2.0, 10.0]);

        let tail = x.slice_rows(2..10);
        assert_eq!(tail.num_rows(), 1);

        let joined = head.concat(&tail).unwrap();
        assert_eq!(joined, x);
    }

    #[test]
    fn test_scaler_standardizes_and_keeps_constant_columns() {
        let x = sample();
        let scaler = ScalerParams::fit(&x).unwrap();
        assert_approx_eq!(scaler.means[0], 2.0, 1e-12);
        assert_approx_eq!(scaler.scales[1], 1.0, 1e-12);

        let z = scaler.transform(&x).unwrap();
        let col = z.column(0);
        assert_approx_eq!(col.iter().sum::<f64>(), 0.0, 1e-12);
        assert!(z.column(1).iter().all(|&v| v.abs() < 1e-12));

        let back = scaler.inverse_transform_row(z.row(2));
        assert_approx_eq!(back[0], 3.0, 1e-12);
        assert_approx_eq!(back[1], 10.0, 1e-12);
    }

    #[test]
    fn test_push_row_checks_width() {
        let mut x = sample();
        assert!(x.push_row(&[4.0]).is_err());
        x.push_row(&[4.0, 11.0]).unwrap();
        assert_eq!(x.num_rows(), 4);
    }
}
