//! Runs the inference path of the rotated detection core on synthetic data.

use std::f32::consts::FRAC_PI_6;

use ndarray::{Array2, Array4};
use orient::{
    config::{BboxHeadConfig, RcnnTestConfig, RoiExtractorConfig, RoiLayerConfig},
    prelude::*,
};

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let extractor_config = RoiExtractorConfig {
        out_channels: 4,
        featmap_strides: vec![4.0, 8.0, 16.0, 32.0],
        finest_scale: 56.0,
        w_enlarge: 1.2,
        h_enlarge: 1.4,
        roi_layer: RoiLayerConfig::PsRoiPool {
            pooled_size: (3, 3),
            group_size: 3,
            mode: PoolMode::Max,
        },
    };
    let head_config = BboxHeadConfig {
        num_classes: 3,
        target_means: [0.0; 5],
        target_stds: [0.1, 0.1, 0.2, 0.2, 0.1],
        reg_class_agnostic: false,
        loss_cls_weight: 1.0,
        loss_bbox_weight: 1.0,
        smooth_l1_beta: 1.0,
    };

    let meta = ImageMeta::identity(ImageShape {
        height: 256,
        width: 256,
    });

    // a feature pyramid where every cell holds its column index
    let features = extractor_config
        .featmap_strides
        .iter()
        .map(|&stride| {
            let size = (256.0 / stride) as usize;
            let channels = extractor_config.out_channels * 9;
            FeatureLevel::new(
                Array4::from_shape_fn((1, channels, size, size), |(_, _, _, x)| x as f32),
                stride,
            )
        })
        .collect::<Vec<_>>();

    // proposals are the anchors of the coarsest level
    let anchors = AnchorGenerator::new(48.0, vec![1.0, 2.0], vec![0.5, 1.0], vec![0.0, FRAC_PI_6])?
        .grid_anchors((2, 2), 128.0)?;
    let rois = anchors
        .anchors()
        .iter()
        .map(|&rect| Roi::new(0, rect))
        .collect::<Vec<_>>();

    let extractor = MultiLevelRoiExtractor::from_config(&extractor_config)?;
    let pooled = extractor.extract(&features, &rois, extractor_config.enlarge())?;
    tracing::info!(shape = ?pooled.dim(), "pooled region features");

    // a stand-in classifier that prefers class 1 for wide boxes and class 2 otherwise
    let head = BboxHead::from_config(&head_config);
    let cls_score = Array2::from_shape_fn((rois.len(), 3), |(row, class)| {
        let rect = rois[row].rect;
        match class {
            1 if rect.w > rect.h => 2.0,
            2 if rect.w <= rect.h => 2.0,
            _ => 0.0,
        }
    });
    let bbox_pred = Array2::zeros((rois.len(), head.mode.columns()));

    let test_config = RcnnTestConfig {
        score_thr: 0.3,
        nms_thr: 0.1,
        max_per_img: 100,
    };
    let output = head.get_detections(
        &rois,
        &[cls_score.view()],
        Some(bbox_pred.view()),
        &meta,
        true,
        Some(&test_config),
    )?;

    if let HeadOutput::Detections(detections) = output {
        for detection in detections {
            tracing::info!(
                class_id = detection.class_id,
                score = detection.score,
                polygon = ?detection.polygon.to_flat(),
                "detection"
            );
        }
    }

    Ok(())
}
