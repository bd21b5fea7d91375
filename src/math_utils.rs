//! Mathematical utility functions and constants for regime detection.
//!
//! Small numerical building blocks shared by the HMM kernels, the clustering
//! initializer and the label stabilizer.

/// Numerical constants used across the crate.
pub mod constants {
    /// ln(2π), used by every Gaussian log-density
    pub const LN_2PI: f64 = 1.837_877_066_409_345_3;

    /// Minimum positive value for log operations
    pub const MIN_LOG_VALUE: f64 = 1e-300;

    /// Regularization parameter for ill-conditioned matrices
    pub const MATRIX_REGULARIZATION: f64 = 1e-8;

    /// Tolerance for row-stochastic checks on transition matrices
    pub const STOCHASTIC_TOLERANCE: f64 = 1e-9;

    /// Tolerance for probability vectors produced by forward-backward
    pub const POSTERIOR_TOLERANCE: f64 = 1e-6;
}

/// Safe comparison for floating point values (NaN sorts last).
pub fn float_total_cmp(a: &f64, b: &f64) -> std::cmp::Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
    }
}

/// Numerically stable `ln(Σ exp(x_i))`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|&v| (v - max).exp()).sum::<f64>().ln()
}

/// Index of the largest element; the lowest index wins ties.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Squared Euclidean distance between two equally sized slices.
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Arithmetic mean; NaN for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); zero below two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Normalizes a non-negative vector in place to sum to one.
///
/// Falls back to the uniform distribution when the total mass vanishes.
pub fn normalize_in_place(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > constants::MIN_LOG_VALUE && total.is_finite() {
        let inv = 1.0 / total;
        values.iter_mut().for_each(|v| *v *= inv);
    } else if !values.is_empty() {
        let uniform = 1.0 / values.len() as f64;
        values.iter_mut().for_each(|v| *v = uniform);
    }
}
