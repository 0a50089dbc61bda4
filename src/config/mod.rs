//! Run configuration: board geometry, camera resolutions and every stage's
//! tunables, loaded from YAML.
//!
//! ```yaml
//! board:
//!   columns: 7
//!   rows: 6
//!   square_size: 0.06
//! cameras:
//!   - { id: 0, width: 640, height: 480 }
//!   - { id: 1, width: 640, height: 480 }
//! bundle:
//!   weighting: per_frame
//!   huber_scale: 2.0
//! ```
//!
//! Every stage section may be omitted and falls back to its defaults.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::board::{BoardError, BoardGeometry};
use crate::bundle::BundleConfig;
use crate::camera::{CameraId, Resolution};
use crate::intrinsics::IntrinsicsConfig;
use crate::stereo::PairwiseConfig;
use crate::trajectory::TrajectoryConfig;
use crate::triangulation::TriangulationConfig;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid board: {0}")]
    Board(#[from] BoardError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: CameraId,
    pub width: u32,
    pub height: u32,
}

impl CameraSpec {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub board: BoardGeometry,
    #[serde(default)]
    pub cameras: Vec<CameraSpec>,
    #[serde(default)]
    pub intrinsics: IntrinsicsConfig,
    #[serde(default)]
    pub pairwise: PairwiseConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub triangulation: TriangulationConfig,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
}

impl CalibrationConfig {
    /// Default tunables for the given board and cameras.
    pub fn new(board: BoardGeometry, cameras: Vec<CameraSpec>) -> Self {
        CalibrationConfig {
            board,
            cameras,
            intrinsics: IntrinsicsConfig::default(),
            pairwise: PairwiseConfig::default(),
            bundle: BundleConfig::default(),
            triangulation: TriangulationConfig::default(),
            trajectory: TrajectoryConfig::default(),
        }
    }

    /// Reads and validates a YAML configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] / [`ConfigError::Yaml`] if the file cannot be read
    /// or parsed, otherwise whatever [`CalibrationConfig::validate`] reports.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: CalibrationConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Checks the values no stage can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.board.validate()?;

        let mut ids = BTreeSet::new();
        for camera in &self.cameras {
            if !ids.insert(camera.id) {
                return Err(ConfigError::Invalid(format!("camera {} listed twice", camera.id)));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "camera {} has an empty resolution",
                    camera.id
                )));
            }
        }

        let positive = [
            ("pairwise.inlier_threshold_px", self.pairwise.inlier_threshold_px),
            ("bundle.max_camera_rms", self.bundle.max_camera_rms),
            ("intrinsics.max_rms", self.intrinsics.max_rms),
            ("triangulation.max_residual_px", self.triangulation.max_residual_px),
            ("trajectory.max_displacement", self.trajectory.max_displacement),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::Invalid(format!("{} must be positive, got {}", name, value)));
            }
        }
        if let Some(scale) = self.bundle.huber_scale {
            if !(scale > 0.0 && scale.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "bundle.huber_scale must be positive, got {}",
                    scale
                )));
            }
        }
        if self.intrinsics.min_frames < 2 {
            return Err(ConfigError::Invalid(
                "intrinsics.min_frames must be at least 2".to_string(),
            ));
        }
        if self.intrinsics.coverage_grid == 0 || self.intrinsics.scale_buckets == 0 {
            return Err(ConfigError::Invalid(
                "intrinsics coverage grid and scale buckets must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.triangulation.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "triangulation.min_confidence must lie in [0, 1], got {}",
                self.triangulation.min_confidence
            )));
        }
        Ok(())
    }
}
