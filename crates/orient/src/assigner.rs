//! Assignment of training targets to proposals.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2};

use crate::{
    box_coder::BoxCoder,
    config::AssignerConfig,
    error::{Error, Result},
    geometry::RotatedBox,
};

/// Outcome of matching one proposal against the ground truths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Matched to the ground truth with this index.
    Positive(usize),
    /// Background.
    Negative,
    /// Contributes to neither loss term.
    Ignored,
}

/// Decides for every proposal whether it is a positive, negative or ignored sample.
pub trait AssignmentPolicy {
    /// Returns one [`Assignment`] per proposal.
    fn assign(&self, proposals: &[RotatedBox], ground_truths: &[RotatedBox]) -> Vec<Assignment>;
}

/// Assigns every proposal to the ground truth it overlaps most, by polygon IoU.
///
/// - max IoU below `neg_iou_thr`: negative
/// - max IoU of at least `pos_iou_thr`: positive
/// - every ground truth also claims the proposals it overlaps most if that IoU is at least
///   `min_pos_iou`, so a ground truth without good proposals still gets a match
/// - anything else is ignored
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxIouAssigner {
    pub pos_iou_thr: f32,
    pub neg_iou_thr: f32,
    pub min_pos_iou: f32,
}

impl MaxIouAssigner {
    #[must_use]
    pub fn new(pos_iou_thr: f32, neg_iou_thr: f32, min_pos_iou: f32) -> Self {
        Self {
            pos_iou_thr,
            neg_iou_thr,
            min_pos_iou,
        }
    }
}

impl From<&AssignerConfig> for MaxIouAssigner {
    fn from(config: &AssignerConfig) -> Self {
        Self::new(config.pos_iou_thr, config.neg_iou_thr, config.min_pos_iou)
    }
}

impl AssignmentPolicy for MaxIouAssigner {
    fn assign(&self, proposals: &[RotatedBox], ground_truths: &[RotatedBox]) -> Vec<Assignment> {
        if ground_truths.is_empty() {
            return vec![Assignment::Negative; proposals.len()];
        }

        let proposal_polygons = proposals.iter().map(|p| p.to_polygon()).collect_vec();
        let gt_polygons = ground_truths.iter().map(|g| g.to_polygon()).collect_vec();

        // overlaps[i][j]: proposal i against ground truth j
        let overlaps = proposal_polygons
            .iter()
            .map(|p| gt_polygons.iter().map(|g| p.iou(g)).collect_vec())
            .collect_vec();

        let mut assignments = overlaps
            .iter()
            .map(|row| {
                let (best_gt, best_iou) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

                if best_iou >= self.pos_iou_thr {
                    Assignment::Positive(best_gt)
                } else if best_iou < self.neg_iou_thr {
                    Assignment::Negative
                } else {
                    Assignment::Ignored
                }
            })
            .collect_vec();

        for gt in 0..ground_truths.len() {
            let gt_max = overlaps.iter().map(|row| row[gt]).fold(f32::NEG_INFINITY, f32::max);
            if gt_max < self.min_pos_iou {
                continue;
            }
            for (assignment, row) in assignments.iter_mut().zip(&overlaps) {
                #[allow(clippy::float_cmp)]
                let is_best = row[gt] == gt_max;
                if is_best {
                    *assignment = Assignment::Positive(gt);
                }
            }
        }

        assignments
    }
}

/// Per-proposal training targets, rows in proposal order.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    /// Class label per proposal, `0` is background.
    pub labels: Array1<usize>,
    pub label_weights: Array1<f32>,
    /// Encoded `(n, 5)` deltas, only meaningful at positive rows.
    pub reg_targets: Array2<f32>,
    /// `(n, 5)`, all ones at positive rows and zero elsewhere.
    pub reg_weights: Array2<f32>,
}

impl Targets {
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of rows with a foreground label.
    #[must_use]
    pub fn num_positive(&self) -> usize {
        self.labels.iter().filter(|&&label| label > 0).count()
    }
}

/// Turns proposals and ground truths into classification and regression targets.
#[derive(Debug, Clone)]
pub struct TargetAssigner<P> {
    policy: P,
    coder: BoxCoder,
}

impl<P: AssignmentPolicy> TargetAssigner<P> {
    #[must_use]
    pub fn new(policy: P, coder: BoxCoder) -> Self {
        Self { policy, coder }
    }

    /// Computes the targets of every proposal.
    ///
    /// `gt_labels[j]` is the foreground class (at least `1`) of `ground_truths[j]`.
    pub fn assign(
        &self,
        proposals: &[RotatedBox],
        ground_truths: &[RotatedBox],
        gt_labels: &[usize],
    ) -> Result<Targets> {
        if ground_truths.len() != gt_labels.len() {
            return Err(Error::mismatch(
                format!("{} ground truth labels", ground_truths.len()),
                gt_labels.len(),
            ));
        }
        if gt_labels.contains(&0) {
            return Err(Error::invalid_shape("ground truth labels must be foreground classes"));
        }

        let assignments = self.policy.assign(proposals, ground_truths);
        if assignments.len() != proposals.len() {
            return Err(Error::mismatch(
                format!("{} assignments", proposals.len()),
                assignments.len(),
            ));
        }

        let n = proposals.len();
        let mut targets = Targets {
            labels: Array1::zeros(n),
            label_weights: Array1::zeros(n),
            reg_targets: Array2::zeros((n, 5)),
            reg_weights: Array2::zeros((n, 5)),
        };

        for (row, (assignment, proposal)) in assignments.iter().zip(proposals).enumerate() {
            match *assignment {
                Assignment::Positive(gt) => {
                    let ground_truth = ground_truths.get(gt).ok_or_else(|| {
                        Error::mismatch(
                            format!("ground truth index below {}", ground_truths.len()),
                            gt,
                        )
                    })?;
                    let delta = self.coder.encode(*proposal, *ground_truth)?;

                    targets.labels[row] = gt_labels[gt];
                    targets.label_weights[row] = 1.0;
                    targets.reg_targets.row_mut(row).assign(&ndarray::aview1(&delta));
                    targets.reg_weights.row_mut(row).fill(1.0);
                }
                Assignment::Negative => targets.label_weights[row] = 1.0,
                Assignment::Ignored => {}
            }
        }

        let counts = assignments.iter().counts_by(|a| match a {
            Assignment::Positive(_) => "positive",
            Assignment::Negative => "negative",
            Assignment::Ignored => "ignored",
        });
        tracing::debug!(?counts, "assigned proposal targets");

        Ok(targets)
    }

    /// [`TargetAssigner::assign`] for axis-aligned `(x1, y1, x2, y2, ..)` proposal rows.
    pub fn assign_axis_aligned(
        &self,
        proposals: ArrayView2<f32>,
        ground_truths: &[RotatedBox],
        gt_labels: &[usize],
    ) -> Result<Targets> {
        self.assign(&lift_axis_aligned(proposals)?, ground_truths, gt_labels)
    }
}

/// Lifts `(x1, y1, x2, y2, ..)` rows to rotated boxes with `theta = 0`, ignoring extra columns.
pub fn lift_axis_aligned(rows: ArrayView2<f32>) -> Result<Vec<RotatedBox>> {
    if rows.ncols() < 4 {
        return Err(Error::mismatch("at least 4 columns", rows.ncols()));
    }

    Ok(rows
        .rows()
        .into_iter()
        .map(|row| RotatedBox::from_xyxy(row[0], row[1], row[2], row[3]))
        .collect())
}
