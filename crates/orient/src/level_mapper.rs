//! Routing of regions to feature pyramid levels by scale.

use crate::geometry::RotatedBox;

const LEVEL_EPS: f32 = 1e-6;

/// Maps regions to pyramid levels.
///
/// - scale < finest_scale * 2: level 0
/// - finest_scale * 2 <= scale < finest_scale * 4: level 1
/// - finest_scale * 4 <= scale < finest_scale * 8: level 2
/// - and so on, clamped to the last level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelMapper {
    pub finest_scale: f32,
    pub num_levels: usize,
}

impl LevelMapper {
    #[must_use]
    pub fn new(finest_scale: f32, num_levels: usize) -> Self {
        Self {
            finest_scale,
            num_levels,
        }
    }

    /// Level index of `region`, `floor(log2(sqrt(w * h) / finest_scale + eps))` clamped to the
    /// available levels.
    #[must_use]
    pub fn assign_level(&self, region: &RotatedBox) -> usize {
        assign_level(region, self.finest_scale, self.num_levels)
    }
}

/// See [`LevelMapper::assign_level`].
#[must_use]
pub fn assign_level(region: &RotatedBox, finest_scale: f32, num_levels: usize) -> usize {
    let max_level = num_levels.saturating_sub(1);
    let level = (region.scale() / finest_scale + LEVEL_EPS).log2().floor();

    // NaN and negative levels (tiny or empty regions) land on the finest level
    if level.is_nan() || level <= 0.0 {
        0
    } else {
        (level as usize).min(max_level)
    }
}

/// Scales width and height of a region, keeping its center and angle.
#[must_use]
pub fn rescale(region: &RotatedBox, w_factor: f32, h_factor: f32) -> RotatedBox {
    region.rescaled(w_factor, h_factor)
}
