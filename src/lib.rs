//! Capture Volume
//!
//! Multi-camera calibration and landmark triangulation for a synchronized
//! camera rig observing a planar calibration board. The pipeline runs in
//! stages, each producing an immutable result:
//!
//! - Board observation store ([`board`])
//! - Per-camera intrinsic calibration ([`intrinsics`])
//! - Pairwise relative poses ([`stereo`])
//! - Pose graph composition into one world frame ([`pose_graph`])
//! - Joint refinement of all poses ([`bundle`])
//! - Landmark triangulation ([`triangulation`])
//! - Trajectory post-processing ([`trajectory`])
//!
//! [`session`] chains the stages, and every nonlinear least-squares problem
//! is solved with the tiny-solver Levenberg-Marquardt optimizer.

pub mod board;
pub mod bundle;
pub mod camera;
pub mod config;
pub mod geometry;
pub mod intrinsics;
pub mod io;
pub mod optimization;
pub mod pose_graph;
pub mod progress;
pub mod session;
pub mod stereo;
pub mod synthetic;
pub mod trajectory;
pub mod triangulation;

// Re-export commonly used types
pub use board::{BoardGeometry, BoardTemplate, ObservationStore};
pub use camera::{
    CalibrationStatus, Camera, CameraArray, CameraId, CameraModel, CameraModelError, Intrinsics,
    RadTanModel, Resolution,
};
pub use config::CalibrationConfig;
pub use geometry::Pose;
pub use progress::{CancellationToken, ProgressEvent, ProgressObserver};
pub use session::{
    process_landmarks, run_calibration, CalibrationReport, CalibrationResult, CalibrationSession,
    PipelineError,
};
