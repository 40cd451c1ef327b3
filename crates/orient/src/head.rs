//! Numerics of the rotated box head: training losses and inference decoding.

use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis, s};

use crate::{
    assigner::Targets,
    box_coder::BoxCoder,
    config::{BboxHeadConfig, RcnnTestConfig},
    error::{Error, Result},
    geometry::{Polygon, RotatedBox},
    meta::ImageMeta,
    nms::{Detection, multiclass_nms},
    roi::Roi,
    util,
};

/// Whether the regressor predicts one delta shared by all classes or one delta per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionMode {
    ClassAgnostic,
    /// One 5-wide delta group per class, background included.
    ClassSpecific { num_classes: usize },
}

impl RegressionMode {
    /// Number of regression outputs per row.
    #[must_use]
    pub fn columns(&self) -> usize {
        match self {
            Self::ClassAgnostic => 5,
            Self::ClassSpecific { num_classes } => 5 * num_classes,
        }
    }

    /// First column of the delta used for rows of class `label`.
    fn group_start(&self, label: usize) -> usize {
        match self {
            Self::ClassAgnostic => 0,
            Self::ClassSpecific { .. } => 5 * label,
        }
    }
}

/// Loss terms of one batch, each already scaled by its loss weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Losses {
    pub loss_cls: f32,
    pub loss_bbox: f32,
    /// Percentage of rows whose highest scoring class is the label.
    pub acc: f32,
}

/// Decoded boxes and class probabilities before suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBoxes {
    /// `(n, 5)` or `(n, 5 * num_classes)` rotated boxes.
    pub boxes: Array2<f32>,
    /// `(n, num_classes)` probabilities, column 0 is background.
    pub scores: Array2<f32>,
}

/// Result of [`BboxHead::get_detections`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeadOutput {
    /// Returned when no suppression config is given, e.g. to merge augmentations later.
    Raw(DecodedBoxes),
    Detections(Vec<Detection>),
}

#[derive(Debug, Clone)]
pub struct BboxHead {
    /// Number of classes including background.
    pub num_classes: usize,
    pub mode: RegressionMode,
    pub coder: BoxCoder,
    pub loss_cls_weight: f32,
    pub loss_bbox_weight: f32,
    pub smooth_l1_beta: f32,
}

impl BboxHead {
    #[must_use]
    pub fn from_config(config: &BboxHeadConfig) -> Self {
        let mode = if config.reg_class_agnostic {
            RegressionMode::ClassAgnostic
        } else {
            RegressionMode::ClassSpecific {
                num_classes: config.num_classes,
            }
        };

        Self {
            num_classes: config.num_classes,
            mode,
            coder: BoxCoder::new(config.target_means, config.target_stds),
            loss_cls_weight: config.loss_cls_weight,
            loss_bbox_weight: config.loss_bbox_weight,
            smooth_l1_beta: config.smooth_l1_beta,
        }
    }

    fn check_rows(
        &self,
        name: &str,
        array: ArrayView2<f32>,
        rows: usize,
        columns: usize,
    ) -> Result<()> {
        if array.dim() != (rows, columns) {
            return Err(Error::mismatch(
                format!("{name} of shape ({rows}, {columns})"),
                format!("{:?}", array.dim()),
            ));
        }
        Ok(())
    }

    /// Classification and regression losses of `(n, num_classes)` scores and `(n, columns)`
    /// regression outputs against the assigned targets.
    ///
    /// The classification term is a weighted cross entropy averaged over the rows with a positive
    /// label weight. The regression term is a smooth L1 over the foreground rows, picking the
    /// delta of the row's class in class specific mode, averaged over all rows.
    pub fn loss(
        &self,
        cls_score: ArrayView2<f32>,
        bbox_pred: ArrayView2<f32>,
        targets: &Targets,
    ) -> Result<Losses> {
        let n = targets.len();
        if targets.label_weights.len() != n {
            return Err(Error::mismatch(
                format!("{n} label weights"),
                targets.label_weights.len(),
            ));
        }
        self.check_rows("regression targets", targets.reg_targets.view(), n, 5)?;
        self.check_rows("regression weights", targets.reg_weights.view(), n, 5)?;
        self.check_rows("classification scores", cls_score, n, self.num_classes)?;
        self.check_rows("regression outputs", bbox_pred, n, self.mode.columns())?;
        if let Some(&label) = targets.labels.iter().find(|&&label| label >= self.num_classes) {
            return Err(Error::mismatch(format!("labels below {}", self.num_classes), label));
        }
        let columns = self.mode.columns();
        if let Some(&label) = targets
            .labels
            .iter()
            .find(|&&label| label > 0 && self.mode.group_start(label) + 5 > columns)
        {
            return Err(Error::mismatch(
                format!("a regression group for every label in {columns} columns"),
                label,
            ));
        }

        let mut cls_sum = 0.0;
        let mut correct = 0;
        for ((scores, &label), &weight) in cls_score
            .rows()
            .into_iter()
            .zip(&targets.labels)
            .zip(&targets.label_weights)
        {
            let scores = scores.to_vec();
            cls_sum -= weight * util::log_softmax(&scores)[label];
            if util::argmax(&scores) == Some(label) {
                correct += 1;
            }
        }
        let cls_avg_factor = targets.label_weights.iter().filter(|&&w| w > 0.0).count().max(1);

        let mut bbox_sum = 0.0;
        for (row, &label) in targets.labels.iter().enumerate() {
            if label == 0 {
                continue;
            }
            let start = self.mode.group_start(label);
            let pred = bbox_pred.slice(s![row, start..start + 5]);
            bbox_sum += pred
                .iter()
                .zip(targets.reg_targets.row(row))
                .zip(targets.reg_weights.row(row))
                .map(|((p, t), w)| w * util::smooth_l1(p - t, self.smooth_l1_beta))
                .sum::<f32>();
        }

        Ok(Losses {
            loss_cls: self.loss_cls_weight * cls_sum / cls_avg_factor as f32,
            loss_bbox: self.loss_bbox_weight * bbox_sum / n.max(1) as f32,
            acc: if n == 0 {
                0.0
            } else {
                100.0 * correct as f32 / n as f32
            },
        })
    }

    /// Decodes the head outputs of `rois` into boxes in the original image frame.
    ///
    /// Several classification score arrays, e.g. from test time augmentation of the head, are
    /// averaged before the softmax. Without `bbox_pred` the regions themselves are the boxes.
    /// With `rescale` centers and extents are divided by the image scale factor. Without a
    /// test config the decoded boxes and probabilities are returned as they are, otherwise
    /// they are suppressed with [`multiclass_nms`].
    pub fn get_detections(
        &self,
        rois: &[Roi],
        cls_scores: &[ArrayView2<f32>],
        bbox_pred: Option<ArrayView2<f32>>,
        meta: &ImageMeta,
        rescale: bool,
        test_config: Option<&RcnnTestConfig>,
    ) -> Result<HeadOutput> {
        let n = rois.len();
        let Some((first, rest)) = cls_scores.split_first() else {
            return Err(Error::mismatch("at least one score array", 0));
        };
        self.check_rows("classification scores", *first, n, self.num_classes)?;
        let mut logits = first.to_owned();
        for scores in rest {
            self.check_rows("classification scores", *scores, n, self.num_classes)?;
            logits += scores;
        }
        logits /= cls_scores.len() as f32;
        let scores = util::softmax_rows(logits.view());

        let references = Array2::from_shape_vec(
            (n, 5),
            rois.iter().flat_map(|roi| roi.rect.to_array()).collect(),
        )
        .map_err(|error| Error::invalid_shape(error.to_string()))?;

        let mut boxes = match bbox_pred {
            Some(deltas) => {
                self.check_rows("regression outputs", deltas, n, self.mode.columns())?;
                self.coder
                    .decode_rows(references.view(), deltas, Some(meta.img_shape))?
            }
            None => references,
        };

        if rescale {
            for mut group in boxes.exact_chunks_mut((1, 5)) {
                group.slice_mut(s![0, ..4]).mapv_inplace(|v| v / meta.scale_factor);
            }
        }

        let decoded = DecodedBoxes { boxes, scores };
        match test_config {
            None => Ok(HeadOutput::Raw(decoded)),
            Some(config) => Ok(HeadOutput::Detections(multiclass_detections(
                &decoded, config,
            )?)),
        }
    }
}

/// Converts decoded boxes to polygons and suppresses them per foreground class.
///
/// `boxes` holds either one shared group of 5 columns or one group per class; the background
/// column 0 of `scores` is skipped and detections report 0-based foreground classes.
pub fn multiclass_detections(
    decoded: &DecodedBoxes,
    config: &RcnnTestConfig,
) -> Result<Vec<Detection>> {
    let DecodedBoxes { boxes, scores } = decoded;
    let num_classes = scores.ncols();
    let groups = boxes.ncols() / 5;
    if boxes.nrows() != scores.nrows()
        || boxes.ncols() % 5 != 0
        || (groups != 1 && groups != num_classes)
    {
        return Err(Error::mismatch(
            format!("(n, 5) or (n, {}) boxes for (n, {num_classes}) scores", 5 * num_classes),
            format!("{:?}", boxes.dim()),
        ));
    }

    let polygons_of = |class: usize| -> Vec<Polygon> {
        let start = if groups == 1 { 0 } else { 5 * class };
        boxes
            .rows()
            .into_iter()
            .map(|row| {
                let group = row.slice(s![start..start + 5]);
                RotatedBox::new(group[0], group[1], group[2], group[3], group[4]).to_polygon()
            })
            .collect()
    };

    let foreground = 1..num_classes;
    let polygons_per_class = foreground.clone().map(polygons_of).collect_vec();
    let scores_per_class = foreground
        .map(|class| scores.index_axis(Axis(1), class).to_vec())
        .collect_vec();

    multiclass_nms(
        &polygons_per_class,
        &scores_per_class,
        config.score_thr,
        config.nms_thr,
        Some(config.max_per_img),
    )
}
