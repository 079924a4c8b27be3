//! Rigid transforms for vehicle-mounted cameras
//!
//! Rotations are Euler angles in degrees applied in X, then Y, then Z order,
//! so the rotation matrix of an angle triple is `Rz · Ry · Rx`. A mount's
//! world rotation is the vehicle matrix multiplied by the mount matrix,
//! decomposed back into angles in `(-180, 180]`.

use glam::{DMat3, DMat4, DVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Below this the Y rotation is treated as ±90° (gimbal lock).
const GIMBAL_EPSILON: f64 = 1e-6;

/// Position plus Euler rotation (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Vec3) -> Self {
        Self { position, rotation }
    }

    /// Map a point expressed in this transform's local frame to world space.
    pub fn apply_to_point(&self, local: Vec3) -> Vec3 {
        let rotated = rotation_matrix(self.rotation) * local.as_dvec3();
        (rotated + self.position.as_dvec3()).as_vec3()
    }
}

/// Rotation matrix for Euler angles in degrees (`Rz · Ry · Rx`).
pub fn rotation_matrix(degrees: Vec3) -> DMat3 {
    let radians = DVec3::new(
        f64::from(degrees.x).to_radians(),
        f64::from(degrees.y).to_radians(),
        f64::from(degrees.z).to_radians(),
    );
    DMat3::from_rotation_z(radians.z)
        * DMat3::from_rotation_y(radians.y)
        * DMat3::from_rotation_x(radians.x)
}

/// Decompose a rotation matrix into Euler angles in degrees.
///
/// Inverse of [`rotation_matrix`] for angles inside the principal range.
/// When the matrix is at gimbal lock the Z angle is fixed at zero and the
/// whole in-plane rotation is attributed to X.
pub fn matrix_to_degrees(m: &DMat3) -> Vec3 {
    // glam is column-major: r[row][col] == m.col(col)[row]
    let r00 = m.x_axis.x;
    let r10 = m.x_axis.y;
    let r20 = m.x_axis.z;
    let r11 = m.y_axis.y;
    let r21 = m.y_axis.z;
    let r12 = m.z_axis.y;
    let r22 = m.z_axis.z;

    let sy = (r00 * r00 + r10 * r10).sqrt();
    let (x, y, z) = if sy >= GIMBAL_EPSILON {
        (r21.atan2(r22), (-r20).atan2(sy), r10.atan2(r00))
    } else {
        ((-r12).atan2(r11), (-r20).atan2(sy), 0.0)
    };

    Vec3::new(
        x.to_degrees() as f32,
        y.to_degrees() as f32,
        z.to_degrees() as f32,
    )
}

/// World rotation of a mount rigidly attached to a body.
pub fn compose_rotation(body: Vec3, relative: Vec3) -> Vec3 {
    matrix_to_degrees(&(rotation_matrix(body) * rotation_matrix(relative)))
}

/// Unit forward direction (+Y) for a rotation in degrees.
pub fn forward_direction(rotation: Vec3) -> Vec3 {
    (rotation_matrix(rotation) * DVec3::Y).as_vec3()
}

/// Derive `(view, projection)` from the combined matrices a renderer
/// exposes: `view = WV · W⁻¹`, `projection = WVP · WV⁻¹`.
///
/// Returns `None` when either inverse does not exist.
pub fn split_view_projection(
    world: &DMat4,
    world_view: &DMat4,
    world_view_projection: &DMat4,
) -> Option<(DMat4, DMat4)> {
    if world.determinant().abs() < f64::EPSILON || world_view.determinant().abs() < f64::EPSILON
    {
        return None;
    }
    let view = *world_view * world.inverse();
    let projection = *world_view_projection * world_view.inverse();
    Some((view, projection))
}

/// Shortest signed difference between two angles in degrees.
pub fn angle_delta(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}
