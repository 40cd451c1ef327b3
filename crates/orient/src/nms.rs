//! Non-maximum suppression over quadrilateral polygons.

use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis};

use crate::{
    error::{Error, Result},
    geometry::Polygon,
};

/// A final detection: a polygon, its confidence and the 0-based foreground class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub polygon: Polygon,
    pub score: f32,
    pub class_id: usize,
}

impl Detection {
    /// The detection as a `(x1, y1, .., x4, y4, score, class_id)` row.
    #[must_use]
    pub fn to_row(&self) -> [f32; 10] {
        let flat = self.polygon.to_flat();
        std::array::from_fn(|i| match i {
            0..8 => flat[i],
            8 => self.score,
            _ => self.class_id as f32,
        })
    }
}

/// Stacks detections into `(n, 10)` rows, see [`Detection::to_row`].
#[must_use]
pub fn detections_to_rows(detections: &[Detection]) -> Array2<f32> {
    let mut rows = Array2::zeros((detections.len(), 10));
    for (mut row, detection) in rows.rows_mut().into_iter().zip(detections) {
        row.assign(&ndarray::aview1(&detection.to_row()));
    }
    rows
}

/// Indices of `scores` sorted by descending score; equal scores keep their input order.
fn descending_order(scores: impl Iterator<Item = f32>) -> Vec<usize> {
    scores
        .enumerate()
        .sorted_by(|(_, a), (_, b)| b.total_cmp(a))
        .map(|(i, _)| i)
        .collect()
}

/// Applies Non-Maximum Suppression (NMS) to the given polygons and scores.
///
/// Polygons are visited by descending score and every lower-scored survivor whose polygon IoU
/// with a kept polygon exceeds `iou_threshold` is discarded. Returns the kept `(polygon, score)`
/// pairs and their input indices, both ordered by descending score.
#[must_use]
pub fn nms(detections: &[(Polygon, f32)], iou_threshold: f32) -> (Vec<(Polygon, f32)>, Vec<usize>) {
    let order = descending_order(detections.iter().map(|(_, score)| *score));
    let areas = detections.iter().map(|(p, _)| p.area()).collect_vec();

    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::new();

    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        let (polygon_i, _) = &detections[i];
        for &j in &order[rank + 1..] {
            if suppressed[j] || areas[j] <= 0.0 {
                continue;
            }

            if polygon_i.iou(&detections[j].0) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    tracing::trace!(
        total = detections.len(),
        kept = keep.len(),
        "polygon nms"
    );

    (keep.iter().map(|&i| detections[i]).collect(), keep)
}

/// Runs [`nms`] on `(n, 9)` rows of `(x1, y1, .., x4, y4, score)`.
pub fn nms_rows(rows: ArrayView2<f32>, iou_threshold: f32) -> Result<(Array2<f32>, Vec<usize>)> {
    if rows.ncols() < 9 {
        return Err(Error::mismatch("(n, 9) polygon rows", format!("{:?}", rows.dim())));
    }

    let detections = rows
        .rows()
        .into_iter()
        .map(|row| Ok((Polygon::from_row(row)?, row[8])))
        .collect::<Result<Vec<_>>>()?;

    let (_, keep) = nms(&detections, iou_threshold);
    Ok((rows.select(Axis(0), &keep), keep))
}

/// Per-class NMS.
///
/// Entry `c` of `polygons_per_class` and `scores_per_class` holds the candidates of foreground
/// class `c`. Candidates scoring below `score_thr` are dropped, every class is suppressed on its
/// own, and the survivors of all classes are merged and truncated to the best `max_per_image`.
pub fn multiclass_nms(
    polygons_per_class: &[Vec<Polygon>],
    scores_per_class: &[Vec<f32>],
    score_thr: f32,
    iou_threshold: f32,
    max_per_image: Option<usize>,
) -> Result<Vec<Detection>> {
    if polygons_per_class.len() != scores_per_class.len() {
        return Err(Error::mismatch(
            format!("{} score sets", polygons_per_class.len()),
            scores_per_class.len(),
        ));
    }

    let mut detections = Vec::new();
    for (class_id, (polygons, scores)) in
        polygons_per_class.iter().zip(scores_per_class).enumerate()
    {
        if polygons.len() != scores.len() {
            return Err(Error::mismatch(
                format!("{} scores for class {class_id}", polygons.len()),
                scores.len(),
            ));
        }

        let candidates = polygons
            .iter()
            .zip(scores)
            .filter(|&(_, &score)| score >= score_thr)
            .map(|(&polygon, &score)| (polygon, score))
            .collect_vec();

        let (kept, _) = nms(&candidates, iou_threshold);
        detections.extend(kept.into_iter().map(|(polygon, score)| Detection {
            polygon,
            score,
            class_id,
        }));
    }

    let mut detections = detections
        .into_iter()
        .sorted_by(|a, b| b.score.total_cmp(&a.score))
        .collect_vec();

    if let Some(max) = max_per_image {
        detections.truncate(max);
    }

    tracing::debug!(detections = detections.len(), "multiclass polygon nms");
    Ok(detections)
}
