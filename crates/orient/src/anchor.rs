use ndarray::{Array, Array2};

use itertools::{Itertools, iproduct};

use crate::{
    error::{Error, Result},
    geometry::RotatedBox,
    meshgrid::{Indexing, meshgrid},
};

/// Generates rotated anchors of several scales, aspect ratios and angles.
///
/// Base anchors are ordered ratio-major, then scale, then angle.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGenerator {
    pub base_size: f32,
    pub scales: Vec<f32>,
    /// Height over width.
    pub ratios: Vec<f32>,
    /// Rotations in radians.
    pub angles: Vec<f32>,
    base_anchors: Vec<RotatedBox>,
}

impl AnchorGenerator {
    pub fn new(
        base_size: f32,
        scales: Vec<f32>,
        ratios: Vec<f32>,
        angles: Vec<f32>,
    ) -> Result<Self> {
        if base_size <= 0.0 || scales.iter().chain(&ratios).any(|&v| v <= 0.0) {
            return Err(Error::invalid_shape(
                "anchor base size, scales and ratios must be positive",
            ));
        }

        let base_anchors = Self::create_base_anchors(base_size, &scales, &ratios, &angles);

        Ok(Self {
            base_size,
            scales,
            ratios,
            angles,
            base_anchors,
        })
    }

    /// Anchors centered at the origin, one per `(ratio, scale, angle)` combination.
    ///
    /// A ratio `r` keeps the area of the `base_size * scale` square: `w = s / sqrt(r)` and
    /// `h = s * sqrt(r)`.
    fn create_base_anchors(
        base_size: f32,
        scales: &[f32],
        ratios: &[f32],
        angles: &[f32],
    ) -> Vec<RotatedBox> {
        iproduct!(ratios, scales, angles)
            .map(|(ratio, scale, &angle)| {
                let side = base_size * scale;
                let h_ratio = ratio.sqrt();
                RotatedBox::new(0.0, 0.0, side / h_ratio, side * h_ratio, angle)
            })
            .collect()
    }

    #[must_use]
    pub fn base_anchors(&self) -> &[RotatedBox] {
        &self.base_anchors
    }

    #[must_use]
    pub fn num_base_anchors(&self) -> usize {
        self.base_anchors.len()
    }

    /// Shifts the base anchors to every cell of a `(height, width)` feature map.
    ///
    /// Cell `(y, x)` is centered at `((x + 0.5) * stride, (y + 0.5) * stride)`.
    pub fn grid_anchors(&self, featmap_size: (usize, usize), stride: f32) -> Result<AnchorSet> {
        let (height, width) = featmap_size;

        let shifts_x = (Array::range(0.0, width as f32, 1.0) + 0.5) * stride;
        let shifts_y = (Array::range(0.0, height as f32, 1.0) + 0.5) * stride;
        let grids = meshgrid(&[shifts_y, shifts_x], Indexing::Ij)?;

        let anchors = grids[0]
            .iter()
            .zip(grids[1].iter())
            .flat_map(|(&cy, &cx)| {
                self.base_anchors.iter().map(move |base| RotatedBox {
                    cx: base.cx + cx,
                    cy: base.cy + cy,
                    ..*base
                })
            })
            .collect_vec();

        Ok(AnchorSet {
            anchors,
            featmap_size,
            num_base_anchors: self.num_base_anchors(),
        })
    }
}

/// Anchors of one feature map, row-major over locations with the base anchors innermost.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    anchors: Vec<RotatedBox>,
    featmap_size: (usize, usize),
    num_base_anchors: usize,
}

impl AnchorSet {
    #[must_use]
    pub fn anchors(&self) -> &[RotatedBox] {
        &self.anchors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    #[must_use]
    pub fn featmap_size(&self) -> (usize, usize) {
        self.featmap_size
    }

    /// Anchor `base` at feature map cell `(y, x)`.
    #[must_use]
    pub fn get(&self, (y, x): (usize, usize), base: usize) -> Option<&RotatedBox> {
        let (height, width) = self.featmap_size;
        if y >= height || x >= width || base >= self.num_base_anchors {
            return None;
        }
        self.anchors
            .get((y * width + x) * self.num_base_anchors + base)
    }

    /// The anchors as `(n, 5)` rotated rows.
    #[must_use]
    pub fn to_rows(&self) -> Array2<f32> {
        let mut rows = Array2::zeros((self.anchors.len(), 5));
        for (mut row, anchor) in rows.rows_mut().into_iter().zip(&self.anchors) {
            row.assign(&ndarray::aview1(&anchor.to_array()));
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_4;

    #[test]
    fn base_anchors_keep_area_per_scale() {
        let generator =
            AnchorGenerator::new(8.0, vec![1.0, 2.0], vec![0.5, 1.0, 2.0], vec![0.0, FRAC_PI_4])
                .unwrap();
        assert_eq!(generator.num_base_anchors(), 12);

        for (k, anchor) in generator.base_anchors().iter().enumerate() {
            let scale = generator.scales[(k / 2) % 2];
            let expected = (8.0 * scale) * (8.0 * scale);
            assert!((anchor.area() - expected).abs() < 1e-3, "{k}: {anchor:?}");
        }

        // ratio 2.0 makes the box twice as high as wide
        let tall = generator.base_anchors()[8];
        assert!((tall.h / tall.w - 2.0).abs() < 1e-5);
        assert_eq!(generator.base_anchors()[9].theta, FRAC_PI_4);
    }

    #[test]
    fn grid_is_row_major_with_base_anchors_innermost() {
        let generator = AnchorGenerator::new(4.0, vec![1.0], vec![1.0, 2.0], vec![0.0]).unwrap();
        let set = generator.grid_anchors((2, 3), 8.0).unwrap();

        assert_eq!(set.len(), 2 * 3 * 2);
        assert_eq!(set.to_rows().dim(), (12, 5));

        let anchor = set.get((1, 2), 1).unwrap();
        assert_eq!((anchor.cx, anchor.cy), (20.0, 12.0));
        assert_eq!(anchor, &set.anchors()[(3 + 2) * 2 + 1]);
        assert!(set.get((2, 0), 0).is_none());
    }

    #[test]
    fn empty_feature_map_has_no_anchors() {
        let generator = AnchorGenerator::new(4.0, vec![1.0], vec![1.0], vec![0.0]).unwrap();
        assert!(generator.grid_anchors((0, 5), 4.0).unwrap().is_empty());
    }

    #[test]
    fn rejects_non_positive_sizes() {
        assert!(AnchorGenerator::new(0.0, vec![1.0], vec![1.0], vec![0.0]).is_err());
        assert!(AnchorGenerator::new(4.0, vec![1.0], vec![-1.0], vec![0.0]).is_err());
    }
}
