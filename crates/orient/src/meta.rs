//! Per-image metadata and mappings between the original and an augmented image frame.

use serde::{Deserialize, Serialize};

use crate::geometry::{Polygon, RotatedBox};

/// Height and width of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

/// Read-only description of how one augmented copy was produced from the original image.
///
/// `img_shape` is the shape after rescaling, `scale_factor` the applied isotropic scale and
/// `flip` whether the rescaled image was mirrored horizontally.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ImageMeta {
    pub img_shape: ImageShape,
    pub scale_factor: f32,
    pub flip: bool,
}

impl ImageMeta {
    /// Meta of an un-augmented image.
    #[must_use]
    pub fn identity(img_shape: ImageShape) -> Self {
        Self {
            img_shape,
            scale_factor: 1.0,
            flip: false,
        }
    }

    fn flip_x(&self, x: f32) -> f32 {
        self.img_shape.width as f32 - x
    }

    /// Maps a box from the original frame into this augmentation's frame.
    #[must_use]
    pub fn map_box(&self, rbox: RotatedBox) -> RotatedBox {
        let scaled = rbox.scaled(self.scale_factor);
        if self.flip {
            RotatedBox::new(self.flip_x(scaled.cx), scaled.cy, scaled.w, scaled.h, -scaled.theta)
        } else {
            scaled
        }
    }

    /// Maps a box from this augmentation's frame back into the original frame.
    #[must_use]
    pub fn map_box_back(&self, rbox: RotatedBox) -> RotatedBox {
        let unflipped = if self.flip {
            RotatedBox::new(self.flip_x(rbox.cx), rbox.cy, rbox.w, rbox.h, -rbox.theta)
        } else {
            rbox
        };
        unflipped.scaled(self.scale_factor.recip())
    }

    /// Maps every vertex of a polygon from this augmentation's frame back into the original frame.
    #[must_use]
    pub fn map_polygon_back(&self, polygon: &Polygon) -> Polygon {
        let mut mapped = *polygon;
        for vertex in &mut mapped.0 {
            if self.flip {
                vertex.x = self.flip_x(vertex.x);
            }
            vertex.x /= self.scale_factor;
            vertex.y /= self.scale_factor;
        }
        mapped
    }
}
