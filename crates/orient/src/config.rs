//! Detector configuration loaded from TOML.
//!
//! Every config type names its file through [`Config::PATH`]. A config can be loaded from a single
//! directory, or from a main directory with an overlay directory whose values replace the main
//! values key by key.
//!
//! ```toml
//! # config/rotated_detection.toml
//! [roi_extractor]
//! out_channels = 10
//! featmap_strides = [4, 8, 16, 32]
//! finest_scale = 56.0
//! w_enlarge = 1.2
//! h_enlarge = 1.4
//! roi_layer = { type = "ps_roi_pool", pooled_size = [7, 7], group_size = 7, mode = "max" }
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use toml::Table;

use crate::{
    error::{Error, Result},
    pool::PoolMode,
};

/// A configuration struct stored as a TOML file.
pub trait Config: DeserializeOwned {
    /// File name of the config, relative to the config directory.
    const PATH: &'static str;

    /// Loads the config from `dir`.
    fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let table = read_table::<Self>(&dir.as_ref().join(Self::PATH))?;
        deserialize::<Self>(table, dir.as_ref())
    }

    /// Loads the config from `main_dir`, with the values found in `overlay_dir` taking precedence.
    ///
    /// A missing or unreadable overlay file is not an error, the main config is used as is.
    fn load_with_overlay(
        main_dir: impl AsRef<Path>,
        overlay_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let main = read_table::<Self>(&main_dir.as_ref().join(Self::PATH))?;
        let overlay_path = overlay_dir.as_ref().join(Self::PATH);

        let table = match read_table::<Self>(&overlay_path) {
            Ok(overlay) => merge_tables(main, overlay),
            Err(Error::ConfigIo { name, path, .. }) => {
                tracing::debug!("`{name}`: failed to read overlay from `{path}`");
                main
            }
            Err(error) => return Err(error),
        };

        deserialize::<Self>(table, overlay_dir.as_ref())
    }
}

fn read_table<T: Config>(path: &Path) -> Result<Table> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ConfigIo {
        name: T::PATH,
        path: path.display().to_string(),
        source,
    })?;

    toml::from_str(&contents).map_err(|source| Error::ConfigParse {
        name: T::PATH,
        path: path.display().to_string(),
        source,
    })
}

fn deserialize<T: Config>(table: Table, dir: &Path) -> Result<T> {
    toml::Value::Table(table).try_into().map_err(|source| Error::ConfigParse {
        name: T::PATH,
        path: dir.join(T::PATH).display().to_string(),
        source,
    })
}

/// Merges `overlay` into `main`. Sub-tables present in both are merged recursively, any other
/// overlay value replaces the main value. Keys only present in the overlay are added.
#[must_use]
pub fn merge_tables(mut main: Table, overlay: Table) -> Table {
    for (key, overlay_value) in overlay {
        let merged = match (main.remove(&key), overlay_value) {
            (Some(toml::Value::Table(main_table)), toml::Value::Table(overlay_table)) => {
                toml::Value::Table(merge_tables(main_table, overlay_table))
            }
            (_, value) => value,
        };
        main.insert(key, merged);
    }

    main
}

/// Configuration of the whole rotated detection core.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    pub roi_extractor: RoiExtractorConfig,
    pub bbox_head: BboxHeadConfig,
    #[serde(default)]
    pub assigner: AssignerConfig,
    #[serde(default)]
    pub rpn_test: RpnTestConfig,
    #[serde(default)]
    pub rcnn_test: RcnnTestConfig,
}

impl Config for DetectorConfig {
    const PATH: &'static str = "rotated_detection.toml";
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoiExtractorConfig {
    pub out_channels: usize,
    /// One stride per pyramid level, finest first.
    pub featmap_strides: Vec<f32>,
    #[serde(default = "default_finest_scale")]
    pub finest_scale: f32,
    /// Width factor applied to every region before pooling.
    #[serde(default = "one")]
    pub w_enlarge: f32,
    /// Height factor applied to every region before pooling.
    #[serde(default = "one")]
    pub h_enlarge: f32,
    pub roi_layer: RoiLayerConfig,
}

impl RoiExtractorConfig {
    /// The enlargement factors, or `None` if regions are pooled as they are.
    #[must_use]
    pub fn enlarge(&self) -> Option<(f32, f32)> {
        #[allow(clippy::float_cmp)]
        let identity = self.w_enlarge == 1.0 && self.h_enlarge == 1.0;
        (!identity).then_some((self.w_enlarge, self.h_enlarge))
    }
}

fn default_finest_scale() -> f32 {
    56.0
}

fn one() -> f32 {
    1.0
}

/// The pooling operator of the extractor, without its spatial scale which follows from the
/// feature map stride.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoiLayerConfig {
    PsRoiPool {
        pooled_size: (usize, usize),
        group_size: usize,
        #[serde(default)]
        mode: PoolMode,
    },
    RoiAlignRotated {
        pooled_size: (usize, usize),
        #[serde(default)]
        sample_num: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BboxHeadConfig {
    /// Number of classes including the background class 0.
    pub num_classes: usize,
    #[serde(default)]
    pub target_means: [f32; 5],
    #[serde(default = "default_target_stds")]
    pub target_stds: [f32; 5],
    #[serde(default)]
    pub reg_class_agnostic: bool,
    #[serde(default = "one")]
    pub loss_cls_weight: f32,
    #[serde(default = "one")]
    pub loss_bbox_weight: f32,
    #[serde(default = "one")]
    pub smooth_l1_beta: f32,
}

fn default_target_stds() -> [f32; 5] {
    [0.1, 0.1, 0.2, 0.2, 0.1]
}

/// Thresholds of the max-IoU assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AssignerConfig {
    pub pos_iou_thr: f32,
    pub neg_iou_thr: f32,
    pub min_pos_iou: f32,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            pos_iou_thr: 0.5,
            neg_iou_thr: 0.5,
            min_pos_iou: 0.5,
        }
    }
}

/// Proposal post-processing at test time.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpnTestConfig {
    pub nms_thr: f32,
    pub max_num: usize,
}

impl Default for RpnTestConfig {
    fn default() -> Self {
        Self {
            nms_thr: 0.7,
            max_num: 2000,
        }
    }
}

/// Detection post-processing at test time.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RcnnTestConfig {
    pub score_thr: f32,
    pub nms_thr: f32,
    pub max_per_img: usize,
}

impl Default for RcnnTestConfig {
    fn default() -> Self {
        Self {
            score_thr: 0.05,
            nms_thr: 0.1,
            max_per_img: 2000,
        }
    }
}
