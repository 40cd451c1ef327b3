//! Merging of predictions made on several augmented copies of one image.

use itertools::Itertools;
use ndarray::{Array2, s};

use crate::{
    config::RcnnTestConfig,
    error::{Error, Result},
    geometry::{Polygon, RotatedBox, normalize_angle, wrap_angle},
    head::{DecodedBoxes, multiclass_detections},
    meta::ImageMeta,
    nms::{Detection, nms},
};

fn check_augmentations<T>(predictions: &[T], metas: &[ImageMeta]) -> Result<()> {
    if predictions.is_empty() || predictions.len() != metas.len() {
        return Err(Error::mismatch(
            format!("one prediction set per image meta ({})", metas.len()),
            predictions.len(),
        ));
    }
    Ok(())
}

/// Maps `(n, 9)` polygon proposals `(x1, y1, .., x4, y4, score)` of every augmentation back to
/// the original image, suppresses them together and keeps the best `max_num`.
pub fn merge_aug_proposals(
    aug_proposals: &[Array2<f32>],
    metas: &[ImageMeta],
    nms_thr: f32,
    max_num: usize,
) -> Result<Array2<f32>> {
    check_augmentations(aug_proposals, metas)?;

    let mut candidates = Vec::new();
    for (proposals, meta) in aug_proposals.iter().zip(metas) {
        if proposals.ncols() != 9 {
            return Err(Error::mismatch("(n, 9) proposals", format!("{:?}", proposals.dim())));
        }
        for row in proposals.rows() {
            let polygon = meta.map_polygon_back(&Polygon::from_row(row)?);
            candidates.push((polygon, row[8]));
        }
    }

    let (mut kept, _) = nms(&candidates, nms_thr);
    kept.truncate(max_num);

    tracing::debug!(
        candidates = candidates.len(),
        kept = kept.len(),
        "merged augmented proposals"
    );

    let mut merged = Array2::zeros((kept.len(), 9));
    for (mut row, (polygon, score)) in merged.rows_mut().into_iter().zip(kept) {
        row.slice_mut(s![..8]).assign(&ndarray::aview1(&polygon.to_flat()));
        row[8] = score;
    }
    Ok(merged)
}

/// Maps the `(n, 5 * k)` boxes of every augmentation back to the original image and averages
/// them row by row, together with the `(n, num_classes)` scores if given.
///
/// Row `i` of every augmentation must describe the same proposal. Every parameter is the
/// element-wise mean, with angles taken relative to the first augmentation so boxes on both
/// sides of the wrap point agree.
pub fn merge_aug_boxes(
    aug_boxes: &[Array2<f32>],
    aug_scores: Option<&[Array2<f32>]>,
    metas: &[ImageMeta],
) -> Result<(Array2<f32>, Option<Array2<f32>>)> {
    check_augmentations(aug_boxes, metas)?;
    let shape = aug_boxes[0].dim();
    if shape.1 % 5 != 0 {
        return Err(Error::mismatch("(n, 5k) boxes", format!("{shape:?}")));
    }
    if let Some(boxes) = aug_boxes.iter().find(|boxes| boxes.dim() != shape) {
        return Err(Error::mismatch(format!("{shape:?} boxes"), format!("{:?}", boxes.dim())));
    }

    let count = aug_boxes.len() as f32;
    let mut merged = Array2::zeros(shape);
    for row in 0..shape.0 {
        for group in 0..shape.1 / 5 {
            let columns = s![row, 5 * group..5 * group + 5];
            let mapped = aug_boxes
                .iter()
                .zip(metas)
                .map(|(boxes, meta)| {
                    RotatedBox::from_row(boxes.slice(columns)).map(|rbox| meta.map_box_back(rbox))
                })
                .collect::<Result<Vec<_>>>()?;

            let mean = |f: &dyn Fn(&RotatedBox) -> f32| mapped.iter().map(f).sum::<f32>() / count;
            // angles are averaged as offsets from the first augmentation so ±π agree
            let first = mapped[0].theta;
            let theta = first + mean(&|b| wrap_angle(b.theta - first));
            let average = [
                mean(&|b| b.cx),
                mean(&|b| b.cy),
                mean(&|b| b.w),
                mean(&|b| b.h),
                normalize_angle(theta),
            ];
            merged
                .slice_mut(columns)
                .assign(&ndarray::aview1(&average));
        }
    }

    let scores = match aug_scores {
        None => None,
        Some(aug_scores) => {
            check_augmentations(aug_scores, metas)?;
            let shape = aug_scores[0].dim();
            if shape.0 != merged.nrows() || aug_scores.iter().any(|scores| scores.dim() != shape) {
                return Err(Error::mismatch(
                    format!("({}, c) scores for every augmentation", merged.nrows()),
                    aug_scores.iter().map(|scores| format!("{:?}", scores.dim())).join(", "),
                ));
            }
            let sum = aug_scores
                .iter()
                .fold(Array2::zeros(shape), |acc, scores| acc + scores);
            Some(sum / count)
        }
    };

    Ok((merged, scores))
}

/// Merges boxes and scores of every augmentation with [`merge_aug_boxes`] and suppresses the
/// result per class.
pub fn merge_aug_detections(
    aug_boxes: &[Array2<f32>],
    aug_scores: &[Array2<f32>],
    metas: &[ImageMeta],
    config: &RcnnTestConfig,
) -> Result<Vec<Detection>> {
    let (boxes, scores) = merge_aug_boxes(aug_boxes, Some(aug_scores), metas)?;
    let scores = scores.ok_or_else(|| Error::mismatch("merged scores", "none"))?;
    multiclass_detections(&DecodedBoxes { boxes, scores }, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ImageShape;
    use ndarray::array;
    use std::f32::consts::PI;

    fn meta(flip: bool, scale_factor: f32) -> ImageMeta {
        ImageMeta {
            img_shape: ImageShape {
                height: 20,
                width: 20,
            },
            scale_factor,
            flip,
        }
    }

    fn proposal_row(rbox: RotatedBox, score: f32) -> Vec<f32> {
        rbox.to_polygon().to_flat().into_iter().chain([score]).collect()
    }

    #[test]
    fn flipped_proposals_map_back_and_suppress() {
        let rbox = RotatedBox::new(6.0, 10.0, 4.0, 4.0, 0.0);
        let identity = Array2::from_shape_vec((1, 9), proposal_row(rbox, 0.9)).unwrap();
        let flipped_box = RotatedBox::new(14.0, 10.0, 4.0, 4.0, 0.0);
        let flipped = Array2::from_shape_vec((1, 9), proposal_row(flipped_box, 0.8)).unwrap();

        let metas = [meta(false, 1.0), meta(true, 1.0)];
        let merged = merge_aug_proposals(&[identity, flipped], &metas, 0.5, 10).unwrap();
        assert_eq!(merged.dim(), (1, 9));
        assert_eq!(merged[[0, 8]], 0.9);
    }

    #[test]
    fn proposals_are_truncated_to_max_num() {
        let rows = (0..5)
            .flat_map(|i| {
                let rbox = RotatedBox::new(i as f32 * 20.0, 0.0, 4.0, 4.0, 0.0);
                proposal_row(rbox, 0.1 * i as f32)
            })
            .collect_vec();
        let proposals = Array2::from_shape_vec((5, 9), rows).unwrap();

        let merged = merge_aug_proposals(&[proposals], &[meta(false, 1.0)], 0.5, 2).unwrap();
        assert_eq!(merged.nrows(), 2);
        assert!((merged[[0, 8]] - 0.4).abs() < 1e-6);
        assert!((merged[[1, 8]] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn scaled_boxes_are_averaged_in_the_original_frame() {
        let a = array![[10.0, 10.0, 4.0, 4.0, 0.2]];
        let b = array![[20.0, 20.0, 8.0, 8.0, 0.2]];

        let metas = [meta(false, 1.0), meta(false, 2.0)];
        let (boxes, scores) = merge_aug_boxes(&[a, b], None, &metas).unwrap();
        assert!(scores.is_none());
        for (value, expected) in boxes.row(0).iter().zip([10.0, 10.0, 4.0, 4.0, 0.2]) {
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn angles_average_across_the_wrap_point() {
        let a = array![[10.0, 10.0, 4.0, 2.0, PI - 0.1]];
        let b = array![[10.0, 10.0, 4.0, 2.0, -PI + 0.1]];

        let metas = [meta(false, 1.0), meta(false, 1.0)];
        let (boxes, _) = merge_aug_boxes(&[a, b], None, &metas).unwrap();
        assert!((boxes[[0, 4]].abs() - PI).abs() < 1e-4, "{}", boxes[[0, 4]]);
    }

    #[test]
    fn angles_are_the_element_wise_mean() {
        let boxes = [0.0, 0.0, 1.0].map(|theta| array![[10.0, 10.0, 4.0, 2.0, theta]]);
        let metas = [meta(false, 1.0); 3];

        let (merged, _) = merge_aug_boxes(&boxes, None, &metas).unwrap();
        assert!((merged[[0, 4]] - 1.0 / 3.0).abs() < 1e-5, "{}", merged[[0, 4]]);
    }

    #[test]
    fn scores_are_averaged() {
        let boxes = array![[10.0, 10.0, 4.0, 4.0, 0.0]];
        let aug_scores = [array![[0.2, 0.8]], array![[0.4, 0.6]]];
        let (_, scores) = merge_aug_boxes(
            &[boxes.clone(), boxes],
            Some(aug_scores.as_slice()),
            &[meta(false, 1.0), meta(true, 1.0)],
        )
        .unwrap();

        let scores = scores.unwrap();
        assert!((scores[[0, 0]] - 0.3).abs() < 1e-6);
        assert!((scores[[0, 1]] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn row_count_must_match_between_augmentations() {
        let a = array![[10.0, 10.0, 4.0, 4.0, 0.0]];
        let b = array![[10.0, 10.0, 4.0, 4.0, 0.0], [1.0, 1.0, 1.0, 1.0, 0.0]];
        let result = merge_aug_boxes(&[a, b], None, &[meta(false, 1.0), meta(false, 1.0)]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));

        let single = array![[10.0, 10.0, 4.0, 4.0, 0.0]];
        assert!(merge_aug_boxes(&[single], None, &[]).is_err());
    }

    #[test]
    fn merged_detections_are_suppressed_per_class() {
        let boxes = array![[10.0, 10.0, 4.0, 4.0, 0.0], [10.5, 10.0, 4.0, 4.0, 0.0]];
        let scores = array![[0.1, 0.9], [0.2, 0.8]];
        let config = RcnnTestConfig {
            score_thr: 0.05,
            nms_thr: 0.3,
            max_per_img: 10,
        };

        let detections = merge_aug_detections(
            &[boxes.clone(), boxes],
            &[scores.clone(), scores],
            &[meta(false, 1.0), meta(false, 1.0)],
            &config,
        )
        .unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].score - 0.9).abs() < 1e-6);
    }
}
