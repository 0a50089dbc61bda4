//! Picks a small set of board views that cover the image and vary in scale
//! and tilt.

use std::collections::BTreeSet;

use log::debug;
use nalgebra::{Point2, Vector3};

use crate::board::{BoardObservation, BoardTemplate, FrameId};
use crate::camera::Resolution;
use crate::geometry::estimate_homography;

use super::IntrinsicsConfig;

/// Where in the image a frame's board sits, how large it appears, and which
/// way it is tilted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoverageSignature {
    pub cell: (u32, u32),
    pub scale_bucket: u32,
    pub tilt: (i8, i8),
}

/// Computes the coverage signature of one observation.
///
/// Returns `None` when the board-to-image homography cannot be estimated.
pub fn coverage_signature(
    observation: &BoardObservation,
    template: &BoardTemplate,
    resolution: Resolution,
    config: &IntrinsicsConfig,
) -> Option<CoverageSignature> {
    let (object, image) = observation.correspondences(template);
    let plane: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let h = estimate_homography(&plane, &image).ok()?;

    let grid = config.coverage_grid.max(1);
    let centroid = observation.centroid()?;
    let (w, h_px) = (resolution.width.max(1) as f64, resolution.height.max(1) as f64);
    let cell_of = |v: f64, extent: f64| ((v / extent * grid as f64).floor().max(0.0) as u32).min(grid - 1);
    let cell = (cell_of(centroid.x, w), cell_of(centroid.y, h_px));

    // Local magnification at the board center, in pixels per board unit.
    let extent = template.geometry().extent();
    let center = Vector3::new(0.5 * extent, 0.5 * extent, 1.0);
    let mapped = h * center;
    if mapped.z.abs() < f64::EPSILON {
        return None;
    }
    let jacobian_det = {
        let (x, y, z) = (mapped.x, mapped.y, mapped.z);
        let du_dx = (h[(0, 0)] * z - x * h[(2, 0)]) / (z * z);
        let du_dy = (h[(0, 1)] * z - x * h[(2, 1)]) / (z * z);
        let dv_dx = (h[(1, 0)] * z - y * h[(2, 0)]) / (z * z);
        let dv_dy = (h[(1, 1)] * z - y * h[(2, 1)]) / (z * z);
        (du_dx * dv_dy - du_dy * dv_dx).abs()
    };
    let diagonal = (w * w + h_px * h_px).sqrt();
    let apparent_size = jacobian_det.sqrt() * extent / diagonal;
    let buckets = config.scale_buckets.max(1);
    let scale_bucket = ((apparent_size * buckets as f64).floor().max(0.0) as u32).min(buckets - 1);

    let h_norm = h / h[(2, 2)];
    let tilt_of = |v: f64| {
        let v = v * extent;
        if v > config.tilt_threshold {
            1
        } else if v < -config.tilt_threshold {
            -1
        } else {
            0
        }
    };
    let tilt = (tilt_of(h_norm[(2, 0)]), tilt_of(h_norm[(2, 1)]));

    Some(CoverageSignature {
        cell,
        scale_bucket,
        tilt,
    })
}

/// Greedily keeps frames, most corners first, whose coverage signature has
/// not been seen yet. Frames with fewer than `min_corners_per_frame` corners
/// are ignored; at most `max_frames` are kept. The result is in frame order.
pub fn select_diverse_frames<'a>(
    observations: &[&'a BoardObservation],
    template: &BoardTemplate,
    resolution: Resolution,
    config: &IntrinsicsConfig,
) -> Vec<&'a BoardObservation> {
    let mut candidates: Vec<&BoardObservation> = observations
        .iter()
        .copied()
        .filter(|obs| obs.len() >= config.min_corners_per_frame.max(4))
        .collect();
    candidates.sort_by(|a, b| b.len().cmp(&a.len()).then(a.frame_id.cmp(&b.frame_id)));

    let mut seen = BTreeSet::new();
    let mut kept: Vec<&BoardObservation> = Vec::new();
    for obs in candidates {
        if kept.len() >= config.max_frames {
            break;
        }
        let Some(signature) = coverage_signature(obs, template, resolution, config) else {
            continue;
        };
        if seen.insert(signature) {
            kept.push(obs);
        }
    }
    kept.sort_by_key(|obs| obs.frame_id);
    debug!(
        "Selected {} of {} frames: {:?}",
        kept.len(),
        observations.len(),
        kept.iter().map(|o| o.frame_id).collect::<Vec<FrameId>>()
    );
    kept
}
