//! Region-of-interest rows.

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::{
    error::{Error, Result},
    geometry::RotatedBox,
};

/// A region tagged with the batch element it belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub batch: usize,
    pub rect: RotatedBox,
}

impl Roi {
    #[must_use]
    pub fn new(batch: usize, rect: RotatedBox) -> Self {
        Self { batch, rect }
    }

    /// Parses `(batch, x1, y1, x2, y2)` or `(batch, cx, cy, w, h, theta)`.
    pub fn from_row(row: ArrayView1<f32>) -> Result<Self> {
        let batch = row
            .first()
            .copied()
            .filter(|b| b.is_finite() && *b >= 0.0 && b.fract() == 0.0)
            .ok_or_else(|| {
                Error::mismatch("a non-negative integer batch index", format!("{row:?}"))
            })? as usize;

        let rect = match row.len() {
            5 => RotatedBox::from_xyxy(row[1], row[2], row[3], row[4]),
            6 => RotatedBox::new(row[1], row[2], row[3], row[4], row[5]),
            n => return Err(Error::mismatch("5 or 6 values per region", n)),
        };

        Ok(Self { batch, rect })
    }

    /// The region as a rotated `(batch, cx, cy, w, h, theta)` row.
    #[must_use]
    pub fn to_row(&self) -> [f32; 6] {
        let [cx, cy, w, h, theta] = self.rect.to_array();
        [self.batch as f32, cx, cy, w, h, theta]
    }
}

/// Parses every row of `rois`, see [`Roi::from_row`].
pub fn parse_rois(rois: ArrayView2<f32>) -> Result<Vec<Roi>> {
    rois.rows().into_iter().map(Roi::from_row).collect()
}

/// Packs regions into `(n, 6)` rotated rows.
#[must_use]
pub fn rois_to_rows(rois: &[Roi]) -> Array2<f32> {
    let mut rows = Array2::zeros((rois.len(), 6));
    for (mut row, roi) in rows.rows_mut().into_iter().zip(rois) {
        row.assign(&ndarray::aview1(&roi.to_row()));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn parses_axis_aligned_and_rotated_rows() {
        let axis = Roi::from_row(array![1.0, 0.0, 0.0, 10.0, 4.0].view()).unwrap();
        assert_eq!(axis.batch, 1);
        assert_eq!(axis.rect, RotatedBox::new(5.0, 2.0, 10.0, 4.0, 0.0));

        let rotated = Roi::from_row(array![0.0, 5.0, 2.0, 10.0, 4.0, 0.5].view()).unwrap();
        assert_eq!(rotated.rect.theta, 0.5);
    }

    #[test]
    fn rejects_bad_rows() {
        assert!(Roi::from_row(array![0.0, 1.0, 2.0].view()).is_err());
        assert!(Roi::from_row(array![-1.0, 0.0, 0.0, 1.0, 1.0].view()).is_err());
        assert!(Roi::from_row(array![0.5, 0.0, 0.0, 1.0, 1.0].view()).is_err());
    }

    #[test]
    fn rows_round_trip() {
        let rois = vec![Roi::new(2, RotatedBox::new(1.0, 2.0, 3.0, 4.0, 0.1))];
        assert_eq!(parse_rois(rois_to_rows(&rois).view()).unwrap(), rois);
    }
}
