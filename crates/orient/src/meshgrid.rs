use ndarray::{Array, Array1, ArrayD, IxDyn};

use itertools::Itertools;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indexing {
    Xy,
    Ij,
}

/// Coordinate grids from one-dimensional coordinate vectors.
///
/// With [`Indexing::Ij`] grid `k` has the shape `(len_0, len_1, ..)` and varies along axis `k`.
/// [`Indexing::Xy`] swaps the first two axes of every grid.
pub fn meshgrid<T>(xi: &[Array1<T>], indexing: Indexing) -> Result<Vec<ArrayD<T>>>
where
    T: Copy,
{
    let ndim = xi.len();
    let product = xi.iter().map(|x| x.iter()).multi_cartesian_product();
    let grid_shape = xi.iter().map(Array1::len).collect_vec();

    let mut grids = Vec::with_capacity(ndim);
    for dim_index in 0..ndim {
        let values = product.clone().map(|p| *p[dim_index]).collect_vec();
        let grid = Array::from_shape_vec(IxDyn(&grid_shape), values)
            .map_err(|error| Error::invalid_shape(error.to_string()))?;
        grids.push(grid);
    }

    if indexing == Indexing::Xy && ndim > 1 {
        for grid in &mut grids {
            grid.swap_axes(0, 1);
        }
    }

    Ok(grids)
}
