//! Numerical core of a rotated object detector.
//!
//! Boxes are `(cx, cy, w, h, theta)` [`RotatedBox`]es with the angle in radians. The crate covers
//! the delta codec used for regression, polygon non-maximum suppression, routing of regions to
//! pyramid levels, RoI pooling with an explicit backward pass, target assignment, the detection
//! head losses and decoding, and merging of test-time augmentations.
//!
//! ## Example
//! ```
//! use orient::prelude::*;
//!
//! let coder = BoxCoder::default();
//! let anchor = RotatedBox::new(50.0, 50.0, 20.0, 10.0, 0.0);
//! let gt = RotatedBox::new(52.0, 49.0, 24.0, 9.0, 0.3);
//!
//! let delta = coder.encode(anchor, gt)?;
//! let decoded = coder.decode(anchor, delta, None)?;
//! assert!((decoded.cx - gt.cx).abs() < 1e-4);
//! # Ok::<(), orient::Error>(())
//! ```

pub mod anchor;
pub mod assigner;
pub mod box_coder;
pub mod config;
mod error;
pub mod extractor;
pub mod geometry;
pub mod head;
pub mod level_mapper;
pub mod merge;
pub mod meshgrid;
pub mod meta;
pub mod nms;
pub mod pool;
pub mod roi;
pub mod util;

pub use error::{Error, Result};
pub use geometry::{Polygon, RotatedBox};

#[allow(missing_docs)]
pub mod prelude {
    pub use crate::anchor::{AnchorGenerator, AnchorSet};
    pub use crate::assigner::{
        Assignment, AssignmentPolicy, MaxIouAssigner, TargetAssigner, Targets,
    };
    pub use crate::box_coder::BoxCoder;
    pub use crate::config::{Config, DetectorConfig};
    pub use crate::error::{Error, Result};
    pub use crate::extractor::{FeatureLevel, MultiLevelRoiExtractor};
    pub use crate::geometry::{Polygon, RotatedBox};
    pub use crate::head::{BboxHead, DecodedBoxes, HeadOutput, Losses, RegressionMode};
    pub use crate::level_mapper::LevelMapper;
    pub use crate::merge::{merge_aug_boxes, merge_aug_detections, merge_aug_proposals};
    pub use crate::meta::{ImageMeta, ImageShape};
    pub use crate::nms::{Detection, detections_to_rows, multiclass_nms, nms};
    pub use crate::pool::{PoolIndex, PoolMode, PsRoiPool, RoiAlignRotated, RoiLayer};
    pub use crate::roi::Roi;
}
