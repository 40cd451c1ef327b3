//! Numeric helpers shared by the detection head.

use ndarray::{Array2, ArrayView2, Axis};

/// Returns the index of the first maximum element, or `None` for an empty slice.
#[inline]
#[must_use]
pub fn argmax(v: &[f32]) -> Option<usize> {
    let (&first, rest) = v.split_first()?;
    let mut max_index = 0;
    let mut max_value = first;

    for (i, &value) in rest.iter().enumerate() {
        if value > max_value {
            max_index = i + 1;
            max_value = value;
        }
    }

    Some(max_index)
}

/// Returns the softmax of a slice.
///
/// The maximum is subtracted first so large logits do not overflow.
#[inline]
#[must_use]
pub fn softmax(v: &[f32]) -> Vec<f32> {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps = v.iter().map(|f| (f - max).exp()).collect::<Vec<_>>();

    let sum: f32 = exps.iter().sum();
    exps.iter().map(|x| x / sum).collect()
}

/// Natural log of the softmax of a slice.
#[must_use]
pub fn log_softmax(v: &[f32]) -> Vec<f32> {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = v.iter().map(|f| (f - max).exp()).sum::<f32>().ln() + max;
    v.iter().map(|f| f - log_sum).collect()
}

/// Row-wise softmax of a `(n, classes)` score matrix.
#[must_use]
pub fn softmax_rows(scores: ArrayView2<f32>) -> Array2<f32> {
    let mut probabilities = scores.to_owned();
    for mut row in probabilities.axis_iter_mut(Axis(0)) {
        let normalized = softmax(&row.to_vec());
        row.iter_mut()
            .zip(normalized)
            .for_each(|(value, p)| *value = p);
    }
    probabilities
}

/// Smooth L1 loss of a single residual.
///
/// Quadratic below `beta`, linear above, and plain L1 for `beta == 0`.
#[inline]
#[must_use]
pub fn smooth_l1(diff: f32, beta: f32) -> f32 {
    let diff = diff.abs();
    if diff < beta {
        0.5 * diff * diff / beta
    } else {
        diff - 0.5 * beta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn argmax_picks_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[3.0]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn log_softmax_matches_softmax() {
        let logits = [0.3, -1.2, 2.5];
        for (log_p, p) in log_softmax(&logits).into_iter().zip(softmax(&logits)) {
            assert!((log_p.exp() - p).abs() < 1e-6);
        }
    }

    #[test]
    fn rows_sum_to_one() {
        let probabilities = softmax_rows(array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]].view());
        for row in probabilities.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((probabilities[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn smooth_l1_switches_at_beta() {
        assert!((smooth_l1(0.5, 1.0) - 0.125).abs() < 1e-6);
        assert!((smooth_l1(-2.0, 1.0) - 1.5).abs() < 1e-6);
        assert_eq!(smooth_l1(-2.0, 0.0), 2.0);
    }
}
