//! Utilities to compare gradients and results of the two execution paths.

/// Relative difference above which a gradient check is reported.
pub const GRADIENT_WARNING: f64 = 1e-7;

/// Tolerance between CPU and GPU results in full precision.
pub const FLOAT_TOLERANCE: f64 = 1e-4;

/// Tolerance between CPU and GPU results in half precision.
pub const HALF_TOLERANCE: f64 = 1e-2;

/// The approximated equality enumerated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within a hundredth of the tolerance.
    Precise = 0,

    /// Within the tolerance.
    Relative = 1,

    /// No relative equality.
    Scarce = 2,
}

/// Grades `|a - b|` scaled by the magnitude of the operands.
pub fn grade(a: f64, b: f64, tolerance: f64) -> ApproxEquality {
    let scale = a.abs().max(b.abs()).max(1.0);
    let dif = (a - b).abs() / scale;

    if dif <= tolerance * 1e-2 {
        ApproxEquality::Precise
    } else if dif <= tolerance {
        ApproxEquality::Relative
    } else {
        ApproxEquality::Scarce
    }
}

/// Worst grade over two slices. Slices of different lengths are
/// [`ApproxEquality::Scarce`].
pub fn grade_all(a: &[f64], b: &[f64], tolerance: f64) -> ApproxEquality {
    if a.len() != b.len() {
        return ApproxEquality::Scarce;
    }
    let mut eq = ApproxEquality::Precise;
    for (x, y) in a.iter().zip(b) {
        eq = eq.max(grade(*x, *y, tolerance));
        if eq == ApproxEquality::Scarce {
            break; // can't improve from here
        }
    }
    eq
}

/// Whether every pair of values agrees within `tolerance`.
pub fn approx_eq(a: &[f64], b: &[f64], tolerance: f64) -> bool {
    grade_all(a, b, tolerance) != ApproxEquality::Scarce
}

/// Largest absolute difference, infinite for slices of different lengths.
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// `‖g - ĝ‖ / (‖g‖ + ‖ĝ‖)` between analytic and approximated gradients,
/// zero when both vanish.
pub fn gradient_diff(analytic: &[f64], approx: &[f64]) -> f64 {
    let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
    let diff: f64 = analytic
        .iter()
        .zip(approx)
        .map(|(g, a)| (g - a) * (g - a))
        .sum::<f64>()
        .sqrt();
    let denom = norm(analytic) + norm(approx);
    if denom == 0.0 { 0.0 } else { diff / denom }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades() {
        assert_eq!(grade(1.0, 1.0, 1e-4), ApproxEquality::Precise);
        assert_eq!(grade(1000.0, 1000.05, 1e-4), ApproxEquality::Relative);
        assert_eq!(grade(0.0, 0.1, 1e-4), ApproxEquality::Scarce);
        assert!(approx_eq(&[1.0, 2.0], &[1.0, 2.000_01], 1e-4));
        assert!(!approx_eq(&[1.0], &[1.0, 2.0], 1e-4));
    }

    #[test]
    fn gradient_diff_is_relative() {
        assert_eq!(gradient_diff(&[0.0; 3], &[0.0; 3]), 0.0);
        assert_eq!(gradient_diff(&[1.0, -2.0], &[1.0, -2.0]), 0.0);
        assert!((gradient_diff(&[1.0], &[-1.0]) - 1.0).abs() < 1e-12);
        assert_eq!(max_abs_diff(&[1.0, 3.0], &[1.5, 2.0]), 1.0);
    }
}
