//! Pooling of fixed-size feature patches for rotated or axis-aligned regions.
//!
//! Two operators are provided:
//! - [`PsRoiPool`], position-sensitive max/average pooling with an explicit index map for the
//!   backward pass.
//! - [`RoiAlignRotated`], bilinear sampling inside rotated bins.
//!
//! Both implement [`RoiLayer`], the seam used by the multi-level extractor.

mod psroi_pool;
mod roi_align_rotated;

pub use psroi_pool::{PoolIndex, PsRoiPool, PsRoiPoolOutput};
pub use roi_align_rotated::RoiAlignRotated;

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::{
    config::RoiLayerConfig,
    error::{Error, Result},
    geometry::{Point, RotatedBox},
    roi::Roi,
};

/// Regions smaller than this (in feature map cells) are grown to it.
const MIN_REGION_EXTENT: f32 = 0.1;

/// Reduction applied over the cells of one bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    #[default]
    Max,
    Average,
}

/// A pooling operator that turns every region into a `(channels, pooled_h, pooled_w)` patch.
pub trait RoiLayer {
    /// `(pooled_height, pooled_width)` of every output patch.
    fn pooled_size(&self) -> (usize, usize);

    /// Scale from image coordinates to feature map coordinates.
    fn spatial_scale(&self) -> f32;

    /// The same operator, sampling a feature map with a different `spatial_scale`.
    #[must_use]
    fn with_spatial_scale(&self, spatial_scale: f32) -> Self
    where
        Self: Sized;

    /// Number of output channels for a feature map with `input_channels` channels.
    fn output_channels(&self, input_channels: usize) -> Result<usize>;

    /// Pools every region from `features` of shape `(batch, channels, height, width)`.
    fn pool(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<Array4<f32>>;
}

/// Either pooling operator, as selected by a [`RoiLayerConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfiguredRoiLayer {
    PsRoiPool(PsRoiPool),
    RoiAlignRotated(RoiAlignRotated),
}

impl ConfiguredRoiLayer {
    /// Builds the configured layer sampling at `spatial_scale`.
    #[must_use]
    pub fn from_config(config: &RoiLayerConfig, spatial_scale: f32) -> Self {
        match *config {
            RoiLayerConfig::PsRoiPool {
                pooled_size,
                group_size,
                mode,
            } => Self::PsRoiPool(PsRoiPool::new(pooled_size, spatial_scale, group_size, mode)),
            RoiLayerConfig::RoiAlignRotated {
                pooled_size,
                sample_num,
            } => Self::RoiAlignRotated(RoiAlignRotated::new(
                pooled_size,
                spatial_scale,
                sample_num,
            )),
        }
    }
}

impl RoiLayer for ConfiguredRoiLayer {
    fn pooled_size(&self) -> (usize, usize) {
        match self {
            Self::PsRoiPool(layer) => layer.pooled_size(),
            Self::RoiAlignRotated(layer) => layer.pooled_size(),
        }
    }

    fn spatial_scale(&self) -> f32 {
        match self {
            Self::PsRoiPool(layer) => layer.spatial_scale(),
            Self::RoiAlignRotated(layer) => layer.spatial_scale(),
        }
    }

    fn with_spatial_scale(&self, spatial_scale: f32) -> Self {
        match self {
            Self::PsRoiPool(layer) => Self::PsRoiPool(layer.with_spatial_scale(spatial_scale)),
            Self::RoiAlignRotated(layer) => {
                Self::RoiAlignRotated(layer.with_spatial_scale(spatial_scale))
            }
        }
    }

    fn output_channels(&self, input_channels: usize) -> Result<usize> {
        match self {
            Self::PsRoiPool(layer) => layer.output_channels(input_channels),
            Self::RoiAlignRotated(layer) => layer.output_channels(input_channels),
        }
    }

    fn pool(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<Array4<f32>> {
        match self {
            Self::PsRoiPool(layer) => layer.pool(features, rois),
            Self::RoiAlignRotated(layer) => layer.pool(features, rois),
        }
    }
}

/// Fails if a region refers to a batch element that is not in the feature map.
pub(crate) fn check_batch_indices(rois: &[Roi], batch_size: usize) -> Result<()> {
    match rois.iter().find(|roi| roi.batch >= batch_size) {
        Some(roi) => Err(Error::mismatch(
            format!("batch index below {batch_size}"),
            roi.batch,
        )),
        None => Ok(()),
    }
}

/// One region in feature map coordinates, split into a `pooled_h x pooled_w` grid of bins.
///
/// Bin `(i, j)` covers the half-open local rectangle `[j * bin_w, (j + 1) * bin_w) x
/// [i * bin_h, (i + 1) * bin_h)` of the region frame. A feature cell `(y, x)` belongs to a bin
/// iff its center `(x + 0.5, y + 0.5)` lies in that rectangle, so the bins of a region never
/// share a cell.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BinGrid {
    pub frame: RotatedBox,
    pub bin_w: f32,
    pub bin_h: f32,
}

impl BinGrid {
    pub fn new(
        rect: &RotatedBox,
        spatial_scale: f32,
        (pooled_h, pooled_w): (usize, usize),
    ) -> Self {
        let mut frame = rect.scaled(spatial_scale);
        frame.w = frame.w.max(MIN_REGION_EXTENT);
        frame.h = frame.h.max(MIN_REGION_EXTENT);

        Self {
            frame,
            bin_w: frame.w / pooled_w as f32,
            bin_h: frame.h / pooled_h as f32,
        }
    }

    /// Local `(u, v)` origin of bin `(i, j)`.
    pub fn bin_origin(&self, i: usize, j: usize) -> (f32, f32) {
        (j as f32 * self.bin_w, i as f32 * self.bin_h)
    }

    /// Cells `(y, x)` of a `height x width` map that belong to bin `(i, j)`, in row-major order.
    ///
    /// Candidates are the cells whose centers fall in the bin's bounding box, found with
    /// `floor`/`ceil`; the exact half-open membership test then decides.
    pub fn support(&self, i: usize, j: usize, height: usize, width: usize) -> Vec<(usize, usize)> {
        if height == 0 || width == 0 {
            return Vec::new();
        }

        let (u0, v0) = self.bin_origin(i, j);
        let (u1, v1) = self.bin_origin(i + 1, j + 1);
        let corners: [Point; 4] = [
            self.frame.from_local(u0, v0),
            self.frame.from_local(u1, v0),
            self.frame.from_local(u1, v1),
            self.frame.from_local(u0, v1),
        ];

        let (min_x, max_x, min_y, max_y) = corners.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, f32::INFINITY, f32::NEG_INFINITY),
            |(min_x, max_x, min_y, max_y), p| {
                (min_x.min(p.x), max_x.max(p.x), min_y.min(p.y), max_y.max(p.y))
            },
        );

        let Some(xs) = cell_range(min_x, max_x, width) else {
            return Vec::new();
        };
        let Some(ys) = cell_range(min_y, max_y, height) else {
            return Vec::new();
        };

        let mut cells = Vec::new();
        for y in ys.0..=ys.1 {
            for x in xs.0..=xs.1 {
                let (u, v) = self
                    .frame
                    .to_local(Point::new(x as f32 + 0.5, y as f32 + 0.5));
                if (u0..u1).contains(&u) && (v0..v1).contains(&v) {
                    cells.push((y, x));
                }
            }
        }

        cells
    }
}

/// Inclusive range of cell indices whose centers may lie in `[lo, hi]`, clamped to `0..len`.
fn cell_range(lo: f32, hi: f32, len: usize) -> Option<(usize, usize)> {
    let first = (lo - 0.5).floor().max(0.0);
    let last = (hi - 0.5).ceil().min(len as f32 - 1.0);

    if !first.is_finite() || !last.is_finite() || last < first {
        None
    } else {
        Some((first as usize, last as usize))
    }
}
