use nalgebra::{RealField, Vector3};

/// Returns the angle between two normals in radians.
///
/// # Arguments
///
/// * lfs - Left normal.
/// * rfs - Right normal.
///
/// # Returns
///
/// * Angle between the two normals in radians, in `[0, pi]`.
pub fn angle_between_normals<T: RealField + Copy>(lfs: &Vector3<T>, rfs: &Vector3<T>) -> T {
    lfs.dot(rfs).clamp(-T::one(), T::one()).acos()
}

/// Angle between two vectors of any length. Zero if one of them is zero.
pub fn angle_between_vecs(lfs: &Vector3<f32>, rfs: &Vector3<f32>) -> f32 {
    let (lfs_norm, rfs_norm) = (lfs.norm(), rfs.norm());
    if lfs_norm == 0.0 || rfs_norm == 0.0 {
        return 0.0;
    }
    angle_between_normals(&(lfs / lfs_norm), &(rfs / rfs_norm))
}
