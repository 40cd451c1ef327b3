use ndarray::{Array4, ArrayView4, s};

use super::{BinGrid, RoiLayer, check_batch_indices};
use crate::{
    error::{Error, Result},
    roi::Roi,
};

/// Rotated RoI align: every bin averages bilinear samples on a regular grid inside the bin.
///
/// Sample points are placed in the region frame and rotated with it. A sample at image position
/// `(px, py)` reads the feature map at index coordinates `(px - 0.5, py - 0.5)`, so cell `(y, x)`
/// is sampled exactly at its center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiAlignRotated {
    pub pooled_height: usize,
    pub pooled_width: usize,
    pub spatial_scale: f32,
    /// Samples per bin along each axis, `0` picks `ceil(bin extent)` per region.
    pub sample_num: usize,
}

/// The four neighbors of a sample with their bilinear weights.
type Neighbors = [((usize, usize), f32); 4];

impl RoiAlignRotated {
    #[must_use]
    pub fn new(
        (pooled_height, pooled_width): (usize, usize),
        spatial_scale: f32,
        sample_num: usize,
    ) -> Self {
        Self {
            pooled_height,
            pooled_width,
            spatial_scale,
            sample_num,
        }
    }

    /// Invokes `visit` with the neighbors of every sample of bin `(i, j)`, and returns the
    /// number of samples taken, including those that fall outside the map.
    fn for_each_sample(
        &self,
        grid: &BinGrid,
        (i, j): (usize, usize),
        (height, width): (usize, usize),
        mut visit: impl FnMut(&Neighbors),
    ) -> usize {
        let samples = |extent: f32| {
            if self.sample_num > 0 {
                self.sample_num
            } else {
                (extent.ceil() as usize).max(1)
            }
        };
        let (grid_h, grid_w) = (samples(grid.bin_h), samples(grid.bin_w));
        let (u0, v0) = grid.bin_origin(i, j);

        for iy in 0..grid_h {
            let v = v0 + (iy as f32 + 0.5) * grid.bin_h / grid_h as f32;
            for ix in 0..grid_w {
                let u = u0 + (ix as f32 + 0.5) * grid.bin_w / grid_w as f32;
                let point = grid.frame.from_local(u, v);
                if let Some(neighbors) =
                    bilinear_neighbors(point.y - 0.5, point.x - 0.5, height, width)
                {
                    visit(&neighbors);
                }
            }
        }

        grid_h * grid_w
    }

    fn grid(&self, roi: &Roi) -> BinGrid {
        BinGrid::new(
            &roi.rect,
            self.spatial_scale,
            (self.pooled_height, self.pooled_width),
        )
    }

    pub fn forward(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<Array4<f32>> {
        if self.pooled_height == 0 || self.pooled_width == 0 {
            return Err(Error::invalid_shape("pooled size must be positive"));
        }
        let (batch, channels, height, width) = features.dim();
        check_batch_indices(rois, batch)?;

        let shape = (rois.len(), channels, self.pooled_height, self.pooled_width);
        let mut output = Array4::zeros(shape);

        for (r, roi) in rois.iter().enumerate() {
            let grid = self.grid(roi);
            let image = features.slice(s![roi.batch, .., .., ..]);
            for i in 0..self.pooled_height {
                for j in 0..self.pooled_width {
                    let mut acc = output.slice_mut(s![r, .., i, j]);
                    let count = self.for_each_sample(&grid, (i, j), (height, width), |neighbors| {
                        for &((y, x), weight) in neighbors {
                            acc.scaled_add(weight, &image.slice(s![.., y, x]));
                        }
                    });
                    acc.mapv_inplace(|v| v / count as f32);
                }
            }
        }

        Ok(output)
    }

    /// Gradient with respect to the input features, scattering every output gradient over the
    /// bilinear neighbors of the samples it averaged.
    pub fn backward(
        &self,
        grad_output: ArrayView4<f32>,
        rois: &[Roi],
        input_shape: (usize, usize, usize, usize),
    ) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = input_shape;
        check_batch_indices(rois, batch)?;

        let expected = (rois.len(), channels, self.pooled_height, self.pooled_width);
        if grad_output.dim() != expected {
            return Err(Error::mismatch(
                format!("{expected:?}"),
                format!("{:?}", grad_output.dim()),
            ));
        }

        let mut grad_input = Array4::zeros(input_shape);

        for (r, roi) in rois.iter().enumerate() {
            let grid = self.grid(roi);
            for i in 0..self.pooled_height {
                for j in 0..self.pooled_width {
                    let mut contributions = Vec::new();
                    let count = self.for_each_sample(&grid, (i, j), (height, width), |neighbors| {
                        contributions.extend_from_slice(neighbors);
                    });

                    let grad = grad_output.slice(s![r, .., i, j]);
                    for ((y, x), weight) in contributions {
                        grad_input
                            .slice_mut(s![roi.batch, .., y, x])
                            .scaled_add(weight / count as f32, &grad);
                    }
                }
            }
        }

        Ok(grad_input)
    }
}

/// Bilinear neighbors of index coordinates `(y, x)`, or `None` when the sample is more than one
/// cell outside the map.
fn bilinear_neighbors(y: f32, x: f32, height: usize, width: usize) -> Option<Neighbors> {
    if height == 0 || width == 0 || y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return None;
    }

    let (y_low, y_high, ly) = axis_neighbors(y.max(0.0), height);
    let (x_low, x_high, lx) = axis_neighbors(x.max(0.0), width);
    let (hy, hx) = (1.0 - ly, 1.0 - lx);

    Some([
        ((y_low, x_low), hy * hx),
        ((y_low, x_high), hy * lx),
        ((y_high, x_low), ly * hx),
        ((y_high, x_high), ly * lx),
    ])
}

/// Lower and upper index along one axis and the fractional weight of the upper one.
fn axis_neighbors(coord: f32, len: usize) -> (usize, usize, f32) {
    let low = coord.floor() as usize;
    if low + 1 >= len {
        (len - 1, len - 1, 0.0)
    } else {
        (low, low + 1, coord - low as f32)
    }
}

impl RoiLayer for RoiAlignRotated {
    fn pooled_size(&self) -> (usize, usize) {
        (self.pooled_height, self.pooled_width)
    }

    fn spatial_scale(&self) -> f32 {
        self.spatial_scale
    }

    fn with_spatial_scale(&self, spatial_scale: f32) -> Self {
        Self {
            spatial_scale,
            ..*self
        }
    }

    fn output_channels(&self, input_channels: usize) -> Result<usize> {
        Ok(input_channels)
    }

    fn pool(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<Array4<f32>> {
        self.forward(features, rois)
    }
}
