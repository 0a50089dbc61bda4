//! Closed-form intrinsics from planar homographies (Zhang).
//!
//! Homographies are estimated in a resolution-normalized pixel frame
//! (`u' = (u - w/2) / s`, `s = max(w, h)`) so that the linear system is well
//! conditioned regardless of image size. Zero skew is enforced as an extra
//! constraint row.

use nalgebra::{DMatrix, Matrix3, Point2};

use crate::camera::{Intrinsics, Resolution};
use crate::geometry::{estimate_homography, null_vector, pose_from_homography, GeometryError, Pose};

use super::PlanarView;

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Solves for `K` (zero skew) from at least two plane homographies.
pub fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Result<Matrix3<f64>, GeometryError> {
    if homographies.len() < 2 {
        return Err(GeometryError::NotEnoughPoints {
            required: 2,
            found: homographies.len(),
        });
    }

    let mut v = DMatrix::<f64>::zeros(2 * homographies.len() + 1, 6);
    for (i, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }
    // B12 = 0
    v[(2 * homographies.len(), 1)] = 1.0;

    let b = null_vector(&v)?;
    let mut b = [b[0], b[1], b[2], b[3], b[4], b[5]];

    let solve = |b: &[f64; 6]| -> Option<(f64, f64, f64, f64, f64)> {
        let [b11, b12, b22, b13, b23, b33] = *b;
        let denom = b11 * b22 - b12 * b12;
        if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
            return None;
        }
        let v0 = (b12 * b13 - b11 * b23) / denom;
        let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
        Some((b11, denom, v0, lambda, b13))
    };

    let (mut b11, mut denom, mut v0, mut lambda, mut b13) = solve(&b)
        .ok_or_else(|| GeometryError::Degenerate("singular calibration system".to_string()))?;
    // The null vector's sign is arbitrary.
    if lambda <= 0.0 {
        b.iter_mut().for_each(|x| *x = -*x);
        (b11, denom, v0, lambda, b13) = solve(&b)
            .ok_or_else(|| GeometryError::Degenerate("singular calibration system".to_string()))?;
    }
    if lambda <= 0.0 || b11 <= 0.0 || denom <= 0.0 {
        return Err(GeometryError::Degenerate(
            "calibration system has no positive-definite solution".to_string(),
        ));
    }

    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;
    if !(alpha.is_finite() && beta.is_finite() && u0.is_finite() && v0.is_finite()) {
        return Err(GeometryError::Degenerate(
            "non-finite focal length".to_string(),
        ));
    }
    Ok(Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0))
}

/// Maps pixels into the resolution-normalized frame.
fn pixel_normalization(resolution: Resolution) -> Matrix3<f64> {
    let (w, h) = (resolution.width as f64, resolution.height as f64);
    let s = w.max(h).max(1.0);
    Matrix3::new(1.0 / s, 0.0, -0.5 * w / s, 0.0, 1.0 / s, -0.5 * h / s, 0.0, 0.0, 1.0)
}

/// Closed-form intrinsics and one camera-from-board pose per view.
///
/// Distortion is assumed zero at this stage.
pub fn linear_init(views: &[PlanarView], resolution: Resolution) -> Result<(Intrinsics, Vec<Pose>), GeometryError> {
    let n = pixel_normalization(resolution);
    let homographies = views
        .iter()
        .map(|view| {
            let plane: Vec<Point2<f64>> = view.board_points.iter().map(|p| Point2::new(p.x, p.y)).collect();
            let image: Vec<Point2<f64>> = view
                .pixels
                .iter()
                .map(|p| {
                    let q = n * p.to_homogeneous();
                    Point2::new(q.x / q.z, q.y / q.z)
                })
                .collect();
            estimate_homography(&plane, &image)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let k_norm = intrinsics_from_homographies(&homographies)?;
    let poses = homographies
        .iter()
        .map(|h| pose_from_homography(&k_norm, h))
        .collect::<Result<Vec<_>, _>>()?;

    let n_inv = n
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("invalid resolution".to_string()))?;
    let k = n_inv * k_norm;
    Ok((
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        },
        poses,
    ))
}
