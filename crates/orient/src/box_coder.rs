use ndarray::{Array2, ArrayView2};

use crate::{
    error::{Error, Result},
    geometry::{RotatedBox, normalize_angle, wrap_angle},
    meta::ImageShape,
};

/// Encodes rotated boxes as normalized 5-value deltas against reference boxes, and back.
///
/// A delta is `(dx, dy, dw, dh, dtheta)` with
/// `dx = (gt.cx - ref.cx) / ref.w`, `dy = (gt.cy - ref.cy) / ref.h`,
/// `dw = ln(gt.w / ref.w)`, `dh = ln(gt.h / ref.h)` and `dtheta` the wrapped angle difference,
/// each normalized as `(value - mean) / std`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxCoder {
    pub means: [f32; 5],
    pub stds: [f32; 5],
    pub bbox_xform_clip: f32,
}

impl Default for BoxCoder {
    fn default() -> Self {
        BoxCoder::new([0.0; 5], [1.0; 5])
    }
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given target means and standard deviations.
    ///
    /// This will default to a `bbox_xform_clip` of `ln(1000/16)`.
    #[must_use]
    pub fn new(means: [f32; 5], stds: [f32; 5]) -> Self {
        BoxCoder {
            means,
            stds,
            bbox_xform_clip: (1000_f32 / 16_f32).ln(),
        }
    }

    /// Create a new [`BoxCoder`] with the given normalization and clipping value.
    #[must_use]
    pub fn new_with_clip(means: [f32; 5], stds: [f32; 5], bbox_xform_clip: f32) -> Self {
        BoxCoder {
            means,
            stds,
            bbox_xform_clip,
        }
    }

    /// Computes the delta that moves `reference` onto `target`.
    pub fn encode(&self, reference: RotatedBox, target: RotatedBox) -> Result<[f32; 5]> {
        let reference = reference.validated()?;
        let target = target.validated()?;

        let raw = [
            (target.cx - reference.cx) / reference.w,
            (target.cy - reference.cy) / reference.h,
            (target.w / reference.w).ln(),
            (target.h / reference.h).ln(),
            wrap_angle(target.theta - reference.theta),
        ];

        Ok(std::array::from_fn(|i| {
            (raw[i] - self.means[i]) / self.stds[i]
        }))
    }

    /// Applies `delta` to `reference`.
    ///
    /// When `bounds` is given the decoded center is clamped into the image; extents and angle
    /// are never clamped.
    pub fn decode(
        &self,
        reference: RotatedBox,
        delta: [f32; 5],
        bounds: Option<ImageShape>,
    ) -> Result<RotatedBox> {
        let reference = reference.validated()?;
        let [dx, dy, dw, dh, dtheta]: [f32; 5] =
            std::array::from_fn(|i| delta[i] * self.stds[i] + self.means[i]);

        // clamp to avoid overflow in exp
        let dw = dw.clamp(-self.bbox_xform_clip, self.bbox_xform_clip);
        let dh = dh.clamp(-self.bbox_xform_clip, self.bbox_xform_clip);

        let mut cx = reference.cx + dx * reference.w;
        let mut cy = reference.cy + dy * reference.h;

        if let Some(shape) = bounds {
            cx = cx.clamp(0.0, (shape.width as f32 - 1.0).max(0.0));
            cy = cy.clamp(0.0, (shape.height as f32 - 1.0).max(0.0));
        }

        Ok(RotatedBox {
            cx,
            cy,
            w: reference.w * dw.exp(),
            h: reference.h * dh.exp(),
            theta: normalize_angle(reference.theta + dtheta),
        })
    }

    /// Encodes row-wise pairs of `(n, 5)` reference and target boxes into `(n, 5)` deltas.
    pub fn encode_rows(
        &self,
        references: ArrayView2<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        if references.dim() != targets.dim() || references.ncols() != 5 {
            return Err(Error::mismatch(
                format!("two (n, 5) box arrays, got {:?}", references.dim()),
                format!("{:?}", targets.dim()),
            ));
        }

        let mut deltas = Array2::zeros(references.raw_dim());
        for (i, (reference, target)) in
            references.rows().into_iter().zip(targets.rows()).enumerate()
        {
            let delta =
                self.encode(RotatedBox::from_row(reference)?, RotatedBox::from_row(target)?)?;
            deltas.row_mut(i).assign(&ndarray::aview1(&delta));
        }

        Ok(deltas)
    }

    /// Decodes `(n, 5 * k)` deltas against `(n, 5)` references into `(n, 5 * k)` boxes.
    ///
    /// Each 5-wide column group holds one class-specific delta; `k = 1` is class agnostic.
    pub fn decode_rows(
        &self,
        references: ArrayView2<f32>,
        deltas: ArrayView2<f32>,
        bounds: Option<ImageShape>,
    ) -> Result<Array2<f32>> {
        if references.ncols() != 5
            || references.nrows() != deltas.nrows()
            || deltas.ncols() % 5 != 0
        {
            return Err(Error::mismatch(
                format!("(n, 5) references and (n, 5k) deltas for n={}", references.nrows()),
                format!("{:?} and {:?}", references.dim(), deltas.dim()),
            ));
        }

        let mut boxes = Array2::zeros(deltas.raw_dim());
        for (i, reference) in references.rows().into_iter().enumerate() {
            let reference = RotatedBox::from_row(reference)?;
            for k in 0..deltas.ncols() / 5 {
                let delta = std::array::from_fn(|j| deltas[[i, 5 * k + j]]);
                let decoded = self.decode(reference, delta, bounds)?.to_array();
                for (j, value) in decoded.into_iter().enumerate() {
                    boxes[[i, 5 * k + j]] = value;
                }
            }
        }

        Ok(boxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn assert_box_close(a: RotatedBox, b: RotatedBox) {
        assert!((a.cx - b.cx).abs() < 1e-3, "{a:?} != {b:?}");
        assert!((a.cy - b.cy).abs() < 1e-3, "{a:?} != {b:?}");
        assert!((a.w - b.w).abs() < 1e-3, "{a:?} != {b:?}");
        assert!((a.h - b.h).abs() < 1e-3, "{a:?} != {b:?}");
        assert!(wrap_angle(a.theta - b.theta).abs() < 1e-4, "{a:?} != {b:?}");
    }

    fn random_box(rng: &mut StdRng) -> RotatedBox {
        RotatedBox::new(
            rng.random_range(-100.0..100.0),
            rng.random_range(-100.0..100.0),
            rng.random_range(1.0..60.0),
            rng.random_range(1.0..60.0),
            rng.random_range(-3.0..3.0),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut rng = StdRng::seed_from_u64(17);
        let coder = BoxCoder::new([0.0; 5], [0.1, 0.1, 0.2, 0.2, 0.1]);

        for _ in 0..500 {
            let anchor = random_box(&mut rng);
            let gt = random_box(&mut rng);
            let delta = coder.encode(anchor, gt).unwrap();
            assert_box_close(coder.decode(anchor, delta, None).unwrap(), gt);
        }
    }

    #[test]
    fn identical_boxes_encode_to_means() {
        let coder = BoxCoder::new([0.5, -0.5, 0.0, 0.0, 0.1], [1.0; 5]);
        let rbox = RotatedBox::new(4.0, 4.0, 2.0, 3.0, 0.2);
        let delta = coder.encode(rbox, rbox).unwrap();

        for (d, m) in delta.iter().zip(coder.means) {
            assert!((d + m).abs() < 1e-6);
        }
    }

    #[test]
    fn angle_delta_wraps_across_boundary() {
        let coder = BoxCoder::default();
        let anchor = RotatedBox::new(0.0, 0.0, 2.0, 2.0, 3.1);
        let gt = RotatedBox::new(0.0, 0.0, 2.0, 2.0, -3.1);

        let delta = coder.encode(anchor, gt).unwrap();
        assert!((delta[4] - (2.0 * std::f32::consts::PI - 6.2)).abs() < 1e-4);
        assert_box_close(coder.decode(anchor, delta, None).unwrap(), gt);
    }

    #[test]
    fn decode_clamps_center_only() {
        let coder = BoxCoder::default();
        let anchor = RotatedBox::new(10.0, 10.0, 4.0, 4.0, 0.0);
        let shape = ImageShape {
            height: 12,
            width: 20,
        };

        let decoded = coder
            .decode(anchor, [10.0, -10.0, 0.5, 0.0, 0.3], Some(shape))
            .unwrap();

        assert_eq!(decoded.cx, 19.0);
        assert_eq!(decoded.cy, 0.0);
        assert!((decoded.w - 4.0 * 0.5_f32.exp()).abs() < 1e-5);
        assert!((decoded.theta - 0.3).abs() < 1e-6);
    }

    #[test]
    fn decode_clips_huge_scale_deltas() {
        let coder = BoxCoder::default();
        let anchor = RotatedBox::new(0.0, 0.0, 1.0, 1.0, 0.0);
        let decoded = coder.decode(anchor, [0.0, 0.0, 100.0, -100.0, 0.0], None).unwrap();

        assert!(decoded.w.is_finite());
        assert!((decoded.w - 1000.0 / 16.0).abs() < 1e-2);
        assert!(decoded.h > 0.0);

        let coder = BoxCoder::new_with_clip([0.0; 5], [1.0; 5], 2_f32.ln());
        let decoded = coder.decode(anchor, [0.0, 0.0, 10.0, 0.0, 0.0], None).unwrap();
        assert!((decoded.w - 2.0).abs() < 1e-5);
        assert!((decoded.h - 1.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_reference_is_rejected() {
        let coder = BoxCoder::default();
        let bad = RotatedBox::new(0.0, 0.0, 0.0, 1.0, 0.0);
        let good = RotatedBox::new(0.0, 0.0, 1.0, 1.0, 0.0);

        assert!(matches!(
            coder.encode(bad, good),
            Err(Error::InvalidShape { .. })
        ));
        assert!(matches!(
            coder.decode(bad, [0.0; 5], None),
            Err(Error::InvalidShape { .. })
        ));
    }

    #[test]
    fn decode_rows_handles_class_specific_groups() {
        let coder = BoxCoder::default();
        let references = array![[10.0, 10.0, 4.0, 2.0, 0.0]];
        let deltas = array![[0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 0.0]];

        let boxes = coder.decode_rows(references.view(), deltas.view(), None).unwrap();
        assert_eq!(boxes.dim(), (1, 10));
        assert_eq!(boxes[[0, 0]], 10.0);
        assert_eq!(boxes[[0, 5]], 12.0);
    }

    #[test]
    fn encode_rows_rejects_mismatched_inputs() {
        let coder = BoxCoder::default();
        let references = array![[10.0, 10.0, 4.0, 2.0, 0.0]];
        let targets = array![[10.0, 10.0, 4.0, 2.0, 0.0], [1.0, 1.0, 1.0, 1.0, 0.0]];

        assert!(matches!(
            coder.encode_rows(references.view(), targets.view()),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
