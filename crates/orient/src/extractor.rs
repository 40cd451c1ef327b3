//! Pooling of regions from a feature pyramid.

use itertools::Itertools;
use ndarray::{Array4, s};

use crate::{
    config::RoiExtractorConfig,
    error::{Error, Result},
    level_mapper::LevelMapper,
    pool::{ConfiguredRoiLayer, RoiLayer},
    roi::Roi,
};

/// One level of a feature pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLevel {
    /// Features of shape `(batch, channels, height, width)`.
    pub features: Array4<f32>,
    /// Image pixels per feature map cell.
    pub stride: f32,
}

impl FeatureLevel {
    #[must_use]
    pub fn new(features: Array4<f32>, stride: f32) -> Self {
        Self { features, stride }
    }
}

/// Routes every region to the pyramid level matching its scale and pools it there.
///
/// One layer is kept per level, sampling with `spatial_scale = 1 / stride`.
#[derive(Debug, Clone)]
pub struct MultiLevelRoiExtractor<L> {
    layers: Vec<L>,
    featmap_strides: Vec<f32>,
    out_channels: usize,
    mapper: LevelMapper,
}

impl<L: RoiLayer> MultiLevelRoiExtractor<L> {
    /// Builds one copy of `layer` per stride, finest level first.
    pub fn new(
        layer: &L,
        featmap_strides: Vec<f32>,
        out_channels: usize,
        finest_scale: f32,
    ) -> Result<Self> {
        if featmap_strides.is_empty() || featmap_strides.iter().any(|&stride| stride <= 0.0) {
            return Err(Error::invalid_shape(format!(
                "feature map strides must be positive, got {featmap_strides:?}"
            )));
        }

        let layers = featmap_strides
            .iter()
            .map(|stride| layer.with_spatial_scale(1.0 / stride))
            .collect();

        Ok(Self {
            layers,
            mapper: LevelMapper::new(finest_scale, featmap_strides.len()),
            featmap_strides,
            out_channels,
        })
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Pools every region into row `i` of a `(rois.len(), out_channels, pooled_h, pooled_w)`
    /// tensor, in input order.
    ///
    /// Levels are chosen from the regions as given. When `enlarge` holds `(w_factor, h_factor)`
    /// the regions are grown by those factors before pooling. With a single level every region is
    /// pooled as is.
    pub fn extract(
        &self,
        features: &[FeatureLevel],
        rois: &[Roi],
        enlarge: Option<(f32, f32)>,
    ) -> Result<Array4<f32>> {
        self.check_levels(features)?;

        if let ([layer], [level]) = (self.layers.as_slice(), features) {
            let pooled = layer.pool(level.features.view(), rois)?;
            self.check_pooled(&pooled, rois.len())?;
            return Ok(pooled);
        }

        let (pooled_h, pooled_w) = self.layers[0].pooled_size();
        let mut output = Array4::zeros((rois.len(), self.out_channels, pooled_h, pooled_w));

        let levels = rois
            .iter()
            .map(|roi| self.mapper.assign_level(&roi.rect))
            .collect_vec();
        let pooled_rois = rois
            .iter()
            .map(|roi| match enlarge {
                Some((w_factor, h_factor)) => {
                    Roi::new(roi.batch, roi.rect.rescaled(w_factor, h_factor))
                }
                None => *roi,
            })
            .collect_vec();

        let mut routed = 0;
        let mut histogram = vec![0; self.layers.len()];
        for (level, (layer, feature_level)) in self.layers.iter().zip(features).enumerate() {
            let indices = levels
                .iter()
                .positions(|&assigned| assigned == level)
                .collect_vec();
            histogram[level] = indices.len();
            routed += indices.len();
            if indices.is_empty() {
                continue;
            }

            let subset = indices.iter().map(|&i| pooled_rois[i]).collect_vec();
            let pooled = layer.pool(feature_level.features.view(), &subset)?;
            self.check_pooled(&pooled, subset.len())?;

            for (k, &row) in indices.iter().enumerate() {
                output
                    .slice_mut(s![row, .., .., ..])
                    .assign(&pooled.slice(s![k, .., .., ..]));
            }
        }

        if routed != rois.len() {
            return Err(Error::mismatch(
                format!("{} regions routed to levels", rois.len()),
                routed,
            ));
        }

        tracing::debug!(?histogram, "routed regions to pyramid levels");

        Ok(output)
    }

    #[allow(clippy::float_cmp)]
    fn check_levels(&self, features: &[FeatureLevel]) -> Result<()> {
        if features.len() != self.layers.len() {
            return Err(Error::mismatch(
                format!("{} feature levels", self.layers.len()),
                features.len(),
            ));
        }

        for (level, (feature_level, &stride)) in
            features.iter().zip(&self.featmap_strides).enumerate()
        {
            if feature_level.stride != stride {
                return Err(Error::mismatch(
                    format!("stride {stride} at level {level}"),
                    feature_level.stride,
                ));
            }
        }

        Ok(())
    }

    fn check_pooled(&self, pooled: &Array4<f32>, rows: usize) -> Result<()> {
        let (pooled_rows, channels, _, _) = pooled.dim();
        if pooled_rows != rows || channels != self.out_channels {
            return Err(Error::mismatch(
                format!("{rows} pooled rows with {} channels", self.out_channels),
                format!("{pooled_rows} rows with {channels} channels"),
            ));
        }
        Ok(())
    }
}

impl MultiLevelRoiExtractor<ConfiguredRoiLayer> {
    pub fn from_config(config: &RoiExtractorConfig) -> Result<Self> {
        let layer = ConfiguredRoiLayer::from_config(&config.roi_layer, 1.0);
        Self::new(
            &layer,
            config.featmap_strides.clone(),
            config.out_channels,
            config.finest_scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RoiLayerConfig,
        geometry::RotatedBox,
        pool::{PoolMode, PsRoiPool, RoiAlignRotated},
    };

    fn square(batch: usize, cx: f32, cy: f32, side: f32) -> Roi {
        Roi::new(batch, RotatedBox::new(cx, cy, side, side, 0.2))
    }

    /// Levels of a 256 pixel image where level `k` is filled with the value `k + 1`.
    fn constant_pyramid(strides: &[f32], channels: usize) -> Vec<FeatureLevel> {
        strides
            .iter()
            .enumerate()
            .map(|(k, &stride)| {
                let size = (256.0 / stride) as usize;
                FeatureLevel::new(
                    Array4::from_elem((1, channels, size, size), (k + 1) as f32),
                    stride,
                )
            })
            .collect()
    }

    #[test]
    fn output_keeps_region_order_across_levels() {
        let strides = vec![4.0, 8.0, 16.0];
        let layer = RoiAlignRotated::new((2, 2), 1.0, 2);
        let extractor = MultiLevelRoiExtractor::new(&layer, strides.clone(), 3, 56.0).unwrap();
        let features = constant_pyramid(&strides, 3);

        let rois = [
            square(0, 128.0, 128.0, 130.0),
            square(0, 100.0, 140.0, 30.0),
            square(0, 120.0, 120.0, 230.0),
            square(0, 128.0, 128.0, 50.0),
        ];
        let output = extractor.extract(&features, &rois, None).unwrap();

        assert_eq!(output.dim(), (4, 3, 2, 2));
        for (row, expected) in [2.0, 1.0, 3.0, 1.0].into_iter().enumerate() {
            assert!(
                output
                    .slice(s![row, .., .., ..])
                    .iter()
                    .all(|v| (v - expected).abs() < 1e-5),
                "row {row}"
            );
        }
    }

    #[test]
    fn enlargement_does_not_change_the_level() {
        let strides = vec![4.0, 8.0];
        let layer = PsRoiPool::new((1, 1), 1.0, 1, PoolMode::Max);
        let extractor = MultiLevelRoiExtractor::new(&layer, strides.clone(), 1, 56.0).unwrap();
        let features = constant_pyramid(&strides, 1);

        // 100 would route to level 1 after enlarging by 1.2 but stays on level 0
        let rois = [square(0, 128.0, 128.0, 100.0)];
        let output = extractor.extract(&features, &rois, Some((1.2, 1.2))).unwrap();
        assert_eq!(output[[0, 0, 0, 0]], 1.0);
    }

    #[test]
    fn single_level_pools_directly() {
        let layer = PsRoiPool::new((2, 2), 1.0, 2, PoolMode::Average);
        let extractor = MultiLevelRoiExtractor::new(&layer, vec![8.0], 2, 56.0).unwrap();
        let features = constant_pyramid(&[8.0], 8);

        let rois = [square(0, 128.0, 128.0, 500.0), square(0, 64.0, 64.0, 16.0)];
        let output = extractor.extract(&features, &rois, Some((2.0, 2.0))).unwrap();
        assert_eq!(output.dim(), (2, 2, 2, 2));
        assert!(output.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn empty_region_list_gives_empty_output() {
        let layer = RoiAlignRotated::new((7, 7), 1.0, 0);
        let extractor = MultiLevelRoiExtractor::new(&layer, vec![4.0, 8.0], 4, 56.0).unwrap();
        let output = extractor
            .extract(&constant_pyramid(&[4.0, 8.0], 4), &[], None)
            .unwrap();
        assert_eq!(output.dim(), (0, 4, 7, 7));
    }

    #[test]
    fn region_outside_its_level_gives_zero_row() {
        let layer = RoiAlignRotated::new((2, 2), 1.0, 2);
        let extractor = MultiLevelRoiExtractor::new(&layer, vec![4.0, 8.0], 1, 56.0).unwrap();
        let rois = [square(0, 5000.0, 5000.0, 20.0), square(0, 128.0, 128.0, 20.0)];

        let output = extractor
            .extract(&constant_pyramid(&[4.0, 8.0], 1), &rois, None)
            .unwrap();
        assert!(output.slice(s![0, .., .., ..]).iter().all(|&v| v == 0.0));
        assert!(output.slice(s![1, .., .., ..]).iter().all(|v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn mismatched_channels_or_levels_are_errors() {
        let layer = RoiAlignRotated::new((2, 2), 1.0, 2);
        let extractor = MultiLevelRoiExtractor::new(&layer, vec![4.0, 8.0], 5, 56.0).unwrap();
        let rois = [square(0, 128.0, 128.0, 20.0)];

        let wrong_channels = constant_pyramid(&[4.0, 8.0], 3);
        assert!(matches!(
            extractor.extract(&wrong_channels, &rois, None),
            Err(Error::ShapeMismatch { .. })
        ));

        let wrong_levels = constant_pyramid(&[4.0], 5);
        assert!(extractor.extract(&wrong_levels, &rois, None).is_err());

        let wrong_stride = constant_pyramid(&[4.0, 16.0], 5);
        assert!(extractor.extract(&wrong_stride, &rois, None).is_err());
    }

    #[test]
    fn out_of_range_batch_index_is_an_error() {
        let layer = RoiAlignRotated::new((2, 2), 1.0, 2);
        let extractor = MultiLevelRoiExtractor::new(&layer, vec![4.0, 8.0], 1, 56.0).unwrap();
        let rois = [square(3, 128.0, 128.0, 20.0)];
        assert!(matches!(
            extractor.extract(&constant_pyramid(&[4.0, 8.0], 1), &rois, None),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn builds_from_config() {
        let config = RoiExtractorConfig {
            out_channels: 2,
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
        let extractor = MultiLevelRoiExtractor::from_config(&config).unwrap();
        assert_eq!(extractor.num_levels(), 4);
        assert_eq!(extractor.layers[3].spatial_scale(), 1.0 / 32.0);

        let features = constant_pyramid(&config.featmap_strides, 18);
        let rois = [square(0, 128.0, 128.0, 40.0), square(0, 128.0, 128.0, 300.0)];
        let output = extractor
            .extract(&features, &rois, config.enlarge())
            .unwrap();
        assert_eq!(output.dim(), (2, 2, 3, 3));
        assert_eq!(output[[1, 0, 1, 1]], 3.0);
    }
}
