//! Calibration board geometry and the per-camera store of board detections.
//!
//! The board template is built once from its [`BoardGeometry`] and shared
//! read-only (`Arc`) by every stage. [`ObservationStore`] accumulates corner
//! detections per camera and frame, dropping and counting anything malformed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraId, Resolution};

/// Capture frame index, shared by all time-aligned cameras.
pub type FrameId = u64;

/// Identifier of an inner board corner.
pub type CornerId = u32;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("board needs at least 2 columns and 2 rows, got {columns}x{rows}")]
    TooSmall { columns: u32, rows: u32 },
    #[error("square size must be positive and finite, got {0}")]
    InvalidSquareSize(f64),
}

/// ChArUco-style board layout: `columns x rows` squares of side `square_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    pub columns: u32,
    pub rows: u32,
    pub square_size: f64,
}

impl BoardGeometry {
    pub fn validate(&self) -> Result<(), BoardError> {
        if self.columns < 2 || self.rows < 2 {
            return Err(BoardError::TooSmall {
                columns: self.columns,
                rows: self.rows,
            });
        }
        if !(self.square_size > 0.0 && self.square_size.is_finite()) {
            return Err(BoardError::InvalidSquareSize(self.square_size));
        }
        Ok(())
    }

    /// Inner corners per row.
    pub fn corners_per_row(&self) -> u32 {
        self.columns - 1
    }

    pub fn corner_count(&self) -> usize {
        ((self.columns - 1) * (self.rows - 1)) as usize
    }

    /// Physical extent of the board along its longer side.
    pub fn extent(&self) -> f64 {
        self.columns.max(self.rows) as f64 * self.square_size
    }
}

/// Corner id to board-frame position lookup (`z = 0` for every corner).
#[derive(Debug, Clone, PartialEq)]
pub struct BoardTemplate {
    geometry: BoardGeometry,
    corners: BTreeMap<CornerId, Point3<f64>>,
}

impl BoardTemplate {
    /// Lays out the inner corners row by row: corner `r * (columns - 1) + c`
    /// sits at `((c + 1) * s, (r + 1) * s, 0)`.
    pub fn new(geometry: BoardGeometry) -> Result<Self, BoardError> {
        geometry.validate()?;
        Ok(Self::layout(geometry))
    }

    /// Unchecked layout for geometries known to be valid.
    pub(crate) fn layout(geometry: BoardGeometry) -> Self {
        let per_row = geometry.corners_per_row();
        let s = geometry.square_size;
        let corners = (0..geometry.rows - 1)
            .flat_map(|r| (0..per_row).map(move |c| (r, c)))
            .map(|(r, c)| {
                (
                    r * per_row + c,
                    Point3::new((c + 1) as f64 * s, (r + 1) as f64 * s, 0.0),
                )
            })
            .collect();
        BoardTemplate { geometry, corners }
    }

    pub fn shared(geometry: BoardGeometry) -> Result<Arc<Self>, BoardError> {
        Ok(Arc::new(Self::new(geometry)?))
    }

    pub fn geometry(&self) -> &BoardGeometry {
        &self.geometry
    }

    pub fn corner(&self, id: CornerId) -> Option<&Point3<f64>> {
        self.corners.get(&id)
    }

    pub fn corners(&self) -> impl Iterator<Item = (CornerId, &Point3<f64>)> {
        self.corners.iter().map(|(id, p)| (*id, p))
    }

    pub fn len(&self) -> usize {
        self.corners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }

    /// Pairs of corners that lie on a common grid line, `(lower, higher)` id.
    pub fn connected_corners(&self) -> BTreeSet<(CornerId, CornerId)> {
        let per_row = self.geometry.corners_per_row();
        let rows = self.geometry.rows - 1;
        let mut pairs = BTreeSet::new();
        for r in 0..rows {
            for c0 in 0..per_row {
                for c1 in c0 + 1..per_row {
                    pairs.insert((r * per_row + c0, r * per_row + c1));
                }
            }
        }
        for c in 0..per_row {
            for r0 in 0..rows {
                for r1 in r0 + 1..rows {
                    pairs.insert((r0 * per_row + c, r1 * per_row + c));
                }
            }
        }
        pairs
    }
}

/// Corners of the board seen by one camera in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardObservation {
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub corners: BTreeMap<CornerId, Point2<f64>>,
}

impl BoardObservation {
    pub fn new(camera_id: CameraId, frame_id: FrameId) -> Self {
        BoardObservation {
            camera_id,
            frame_id,
            corners: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.corners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }

    /// Board-frame / pixel correspondences in corner id order.
    pub fn correspondences(&self, template: &BoardTemplate) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
        self.corners
            .iter()
            .filter_map(|(id, px)| template.corner(*id).map(|p| (*p, *px)))
            .unzip()
    }

    /// Correspondences restricted to the given corner ids.
    pub fn correspondences_for(
        &self,
        template: &BoardTemplate,
        ids: &[CornerId],
    ) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
        ids.iter()
            .filter_map(|id| Some((*template.corner(*id)?, *self.corners.get(id)?)))
            .unzip()
    }

    /// Corner ids present in both observations, ascending.
    pub fn common_corners(&self, other: &BoardObservation) -> Vec<CornerId> {
        self.corners
            .keys()
            .filter(|id| other.corners.contains_key(id))
            .copied()
            .collect()
    }

    pub fn centroid(&self) -> Option<Point2<f64>> {
        if self.corners.is_empty() {
            return None;
        }
        let n = self.corners.len() as f64;
        let sum = self
            .corners
            .values()
            .fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords);
        Some(Point2::from(sum / n))
    }
}

/// Why a corner detection was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DropReason {
    UnknownCamera,
    UnknownCorner,
    NonFinite,
    Duplicate,
}

/// All board detections, grouped by camera then frame.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    template: Arc<BoardTemplate>,
    resolutions: BTreeMap<CameraId, Resolution>,
    observations: BTreeMap<CameraId, BTreeMap<FrameId, BoardObservation>>,
    dropped: BTreeMap<DropReason, usize>,
}

impl ObservationStore {
    pub fn new(template: Arc<BoardTemplate>) -> Self {
        ObservationStore {
            template,
            resolutions: BTreeMap::new(),
            observations: BTreeMap::new(),
            dropped: BTreeMap::new(),
        }
    }

    pub fn register_camera(&mut self, camera_id: CameraId, resolution: Resolution) {
        self.resolutions.insert(camera_id, resolution);
        self.observations.entry(camera_id).or_default();
    }

    /// Stores one corner detection. Returns `false` (and counts the drop) if
    /// the camera is unregistered, the corner id is not on the board, the
    /// pixel is not finite, or the corner was already seen in that frame.
    pub fn add_corner(
        &mut self,
        camera_id: CameraId,
        frame_id: FrameId,
        corner_id: CornerId,
        pixel: Point2<f64>,
    ) -> bool {
        let reason = if !self.resolutions.contains_key(&camera_id) {
            Some(DropReason::UnknownCamera)
        } else if self.template.corner(corner_id).is_none() {
            Some(DropReason::UnknownCorner)
        } else if !(pixel.x.is_finite() && pixel.y.is_finite()) {
            Some(DropReason::NonFinite)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.record_drop(reason);
            return false;
        }

        let frames = self.observations.entry(camera_id).or_default();
        let obs = frames
            .entry(frame_id)
            .or_insert_with(|| BoardObservation::new(camera_id, frame_id));
        if obs.corners.contains_key(&corner_id) {
            self.record_drop(DropReason::Duplicate);
            return false;
        }
        obs.corners.insert(corner_id, pixel);
        true
    }

    fn record_drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason).or_insert(0) += 1;
    }

    pub fn template(&self) -> &Arc<BoardTemplate> {
        &self.template
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.resolutions.keys().copied()
    }

    pub fn resolution(&self, camera_id: CameraId) -> Option<Resolution> {
        self.resolutions.get(&camera_id).copied()
    }

    /// Frames of one camera in frame order (empty if unknown).
    pub fn observations_for(&self, camera_id: CameraId) -> Vec<&BoardObservation> {
        self.observations
            .get(&camera_id)
            .map(|frames| frames.values().collect())
            .unwrap_or_default()
    }

    pub fn observation(&self, camera_id: CameraId, frame_id: FrameId) -> Option<&BoardObservation> {
        self.observations.get(&camera_id)?.get(&frame_id)
    }

    /// Total number of dropped detections.
    pub fn dropped(&self) -> usize {
        self.dropped.values().sum()
    }

    pub fn dropped_by_reason(&self) -> &BTreeMap<DropReason, usize> {
        &self.dropped
    }

    /// Number of stored corner detections across all cameras.
    pub fn corner_count(&self) -> usize {
        self.observations
            .values()
            .flat_map(|frames| frames.values())
            .map(BoardObservation::len)
            .sum()
    }

    /// Frames in which both cameras saw at least `min_common` of the same
    /// corners, with those corner ids.
    pub fn shared_frames(
        &self,
        a: CameraId,
        b: CameraId,
        min_common: usize,
    ) -> Vec<(FrameId, Vec<CornerId>)> {
        let (Some(frames_a), Some(frames_b)) = (self.observations.get(&a), self.observations.get(&b))
        else {
            return Vec::new();
        };
        let shared: Vec<_> = frames_a
            .iter()
            .filter_map(|(frame_id, obs_a)| {
                let obs_b = frames_b.get(frame_id)?;
                let common = obs_a.common_corners(obs_b);
                (common.len() >= min_common).then_some((*frame_id, common))
            })
            .collect();
        debug!(
            "Cameras {} and {} share {} usable frames",
            a,
            b,
            shared.len()
        );
        shared
    }

    /// Frames seen by at least one camera, ascending.
    pub fn frame_ids(&self) -> BTreeSet<FrameId> {
        self.observations
            .values()
            .flat_map(|frames| frames.keys().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geometry() -> BoardGeometry {
        BoardGeometry {
            columns: 4,
            rows: 5,
            square_size: 0.05,
        }
    }

    fn store() -> ObservationStore {
        let mut store = ObservationStore::new(BoardTemplate::shared(geometry()).unwrap());
        store.register_camera(
            0,
            Resolution {
                width: 640,
                height: 480,
            },
        );
        store
    }

    #[test]
    fn test_template_layout() {
        let template = BoardTemplate::new(geometry()).unwrap();
        assert_eq!(template.len(), 12);
        let p = template.corner(4).unwrap();
        // id 4 = row 1, column 1
        assert_relative_eq!(p.x, 0.10);
        assert_relative_eq!(p.y, 0.10);
        assert_relative_eq!(p.z, 0.0);
        assert!(template.corner(12).is_none());
    }

    #[test]
    fn test_connected_corners() {
        let template = BoardTemplate::new(geometry()).unwrap();
        let pairs = template.connected_corners();
        // 4 rows of 3 corners: 4 * 3 pairs; 3 columns of 4 corners: 3 * 6 pairs.
        assert_eq!(pairs.len(), 12 + 18);
        assert!(pairs.contains(&(0, 2)));
        assert!(pairs.contains(&(1, 10)));
        assert!(!pairs.contains(&(0, 4)));
    }

    #[test]
    fn test_invalid_geometry() {
        let bad = BoardGeometry {
            columns: 1,
            rows: 5,
            square_size: 0.05,
        };
        assert!(matches!(
            BoardTemplate::new(bad),
            Err(BoardError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_malformed_detections_are_dropped_and_counted() {
        let mut store = store();
        assert!(store.add_corner(0, 1, 0, Point2::new(10.0, 20.0)));
        assert!(!store.add_corner(0, 1, 0, Point2::new(11.0, 20.0)));
        assert!(!store.add_corner(7, 1, 0, Point2::new(10.0, 20.0)));
        assert!(!store.add_corner(0, 1, 99, Point2::new(10.0, 20.0)));
        assert!(!store.add_corner(0, 1, 1, Point2::new(f64::NAN, 20.0)));

        assert_eq!(store.dropped(), 4);
        assert_eq!(store.corner_count(), 1);
        assert_eq!(store.dropped_by_reason()[&DropReason::Duplicate], 1);
        assert_relative_eq!(store.observation(0, 1).unwrap().corners[&0].x, 10.0);
    }

    #[test]
    fn test_shared_frames() {
        let mut store = store();
        store.register_camera(
            1,
            Resolution {
                width: 640,
                height: 480,
            },
        );
        for id in 0..6 {
            store.add_corner(0, 1, id, Point2::new(id as f64, 0.0));
            store.add_corner(1, 1, id, Point2::new(id as f64, 1.0));
        }
        store.add_corner(0, 2, 0, Point2::new(0.0, 0.0));
        store.add_corner(1, 2, 0, Point2::new(0.0, 0.0));

        let shared = store.shared_frames(0, 1, 6);
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].0, 1);
        assert_eq!(shared[0].1.len(), 6);
    }
}
