use ndarray::{Array4, ArrayView4};

use super::{BinGrid, PoolMode, RoiLayer, check_batch_indices};
use crate::{
    error::{Error, Result},
    roi::Roi,
};

/// Position-sensitive RoI pooling.
///
/// The input has `group_size² * O` channels. Output channel `o` of bin `(i, j)` reads input
/// channel `(o * group_size + gi) * group_size + gj`, where `(gi, gj)` is the group cell that
/// bin `(i, j)` falls into. With `group_size = 1` this is plain RoI pooling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsRoiPool {
    pub pooled_height: usize,
    pub pooled_width: usize,
    pub spatial_scale: f32,
    pub group_size: usize,
    pub mode: PoolMode,
}

/// What the backward pass needs to route gradients, returned alongside the forward output.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolIndex {
    /// Flattened spatial offset `y * width + x` of the maximum for every output cell, `None`
    /// for empty bins.
    Argmax(Array4<Option<usize>>),
    /// Number of cells averaged into every output cell.
    Population(Array4<usize>),
}

/// Forward result of [`PsRoiPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct PsRoiPoolOutput {
    /// Pooled features of shape `(num_rois, out_channels, pooled_height, pooled_width)`.
    pub output: Array4<f32>,
    pub index: PoolIndex,
}

impl PsRoiPool {
    #[must_use]
    pub fn new(
        (pooled_height, pooled_width): (usize, usize),
        spatial_scale: f32,
        group_size: usize,
        mode: PoolMode,
    ) -> Self {
        Self {
            pooled_height,
            pooled_width,
            spatial_scale,
            group_size,
            mode,
        }
    }

    fn grid(&self, roi: &Roi) -> BinGrid {
        BinGrid::new(
            &roi.rect,
            self.spatial_scale,
            (self.pooled_height, self.pooled_width),
        )
    }

    /// Input channel read by output channel `o` at bin `(i, j)`.
    fn input_channel(&self, o: usize, i: usize, j: usize) -> usize {
        let g = self.group_size;
        let gi = (i * g / self.pooled_height).min(g - 1);
        let gj = (j * g / self.pooled_width).min(g - 1);
        (o * g + gi) * g + gj
    }

    fn validate(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<usize> {
        if self.pooled_height == 0 || self.pooled_width == 0 {
            return Err(Error::invalid_shape("pooled size must be positive"));
        }
        let out_channels = self.output_channels(features.dim().1)?;
        check_batch_indices(rois, features.dim().0)?;
        Ok(out_channels)
    }

    /// Pools every region and records the index map needed by [`PsRoiPool::backward`].
    pub fn forward(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<PsRoiPoolOutput> {
        let out_channels = self.validate(features, rois)?;
        let (_, _, height, width) = features.dim();
        let shape = (rois.len(), out_channels, self.pooled_height, self.pooled_width);

        let mut output = Array4::zeros(shape);
        let mut argmax = Array4::from_elem(shape, None);
        let mut population = Array4::zeros(shape);

        for (r, roi) in rois.iter().enumerate() {
            let grid = self.grid(roi);
            for i in 0..self.pooled_height {
                for j in 0..self.pooled_width {
                    let cells = grid.support(i, j, height, width);
                    if cells.is_empty() {
                        continue;
                    }

                    for o in 0..out_channels {
                        let input_channel = self.input_channel(o, i, j);
                        let channel = features.slice(ndarray::s![roi.batch, input_channel, .., ..]);
                        match self.mode {
                            PoolMode::Max => {
                                // seeded from the first cell so the arg-max stays in the bin
                                let best = cells
                                    .iter()
                                    .map(|&(y, x)| (y * width + x, channel[[y, x]]))
                                    .reduce(|acc, cur| if cur.1 > acc.1 { cur } else { acc });
                                if let Some((offset, value)) = best {
                                    output[[r, o, i, j]] = value;
                                    argmax[[r, o, i, j]] = Some(offset);
                                }
                            }
                            PoolMode::Average => {
                                let sum: f32 = cells.iter().map(|&(y, x)| channel[[y, x]]).sum();
                                output[[r, o, i, j]] = sum / cells.len() as f32;
                                population[[r, o, i, j]] = cells.len();
                            }
                        }
                    }
                }
            }
        }

        let index = match self.mode {
            PoolMode::Max => PoolIndex::Argmax(argmax),
            PoolMode::Average => PoolIndex::Population(population),
        };

        Ok(PsRoiPoolOutput { output, index })
    }

    /// Gradient with respect to the input features.
    ///
    /// Max pooling adds every output gradient to exactly the recorded arg-max cell. Average
    /// pooling spreads it evenly over the bin support, derived with the same bin geometry as the
    /// forward pass. Region coordinates are treated as constants.
    pub fn backward(
        &self,
        grad_output: ArrayView4<f32>,
        rois: &[Roi],
        index: &PoolIndex,
        input_shape: (usize, usize, usize, usize),
    ) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = input_shape;
        let out_channels = self.output_channels(channels)?;
        check_batch_indices(rois, batch)?;

        let expected = (rois.len(), out_channels, self.pooled_height, self.pooled_width);
        let index_shape = match index {
            PoolIndex::Argmax(map) => map.dim(),
            PoolIndex::Population(map) => map.dim(),
        };
        if grad_output.dim() != expected || index_shape != expected {
            return Err(Error::mismatch(
                format!("gradient and index map of shape {expected:?}"),
                format!("{:?} and {:?}", grad_output.dim(), index_shape),
            ));
        }

        let mut grad_input = Array4::zeros(input_shape);

        match index {
            PoolIndex::Argmax(argmax) => {
                for ((r, o, i, j), offset) in argmax.indexed_iter() {
                    let Some(offset) = *offset else {
                        continue;
                    };
                    let channel = self.input_channel(o, i, j);
                    grad_input[[rois[r].batch, channel, offset / width, offset % width]] +=
                        grad_output[[r, o, i, j]];
                }
            }
            PoolIndex::Population(population) => {
                for (r, roi) in rois.iter().enumerate() {
                    let grid = self.grid(roi);
                    for i in 0..self.pooled_height {
                        for j in 0..self.pooled_width {
                            let cells = grid.support(i, j, height, width);
                            for o in 0..out_channels {
                                let count = population[[r, o, i, j]];
                                if count == 0 || count != cells.len() {
                                    continue;
                                }
                                let share = grad_output[[r, o, i, j]] / count as f32;
                                let channel = self.input_channel(o, i, j);
                                for &(y, x) in &cells {
                                    grad_input[[roi.batch, channel, y, x]] += share;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(grad_input)
    }
}

impl RoiLayer for PsRoiPool {
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
        let groups = self.group_size * self.group_size;
        if groups == 0 || input_channels % groups != 0 {
            return Err(Error::invalid_shape(format!(
                "{input_channels} channels are not divisible by group_size² = {groups}"
            )));
        }
        Ok(input_channels / groups)
    }

    fn pool(&self, features: ArrayView4<f32>, rois: &[Roi]) -> Result<Array4<f32>> {
        Ok(self.forward(features, rois)?.output)
    }
}
