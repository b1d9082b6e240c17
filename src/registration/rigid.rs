use nalgebra::{Matrix3, Vector3};

use crate::transform::Transform;

/// Least squares rigid transform that maps `source[i]` onto `target[i]` (Kabsch).
///
/// Returns `None` when there are less than 3 pairs, the lengths differ, or the SVD
/// does not give a proper rotation.
pub fn estimate_rigid_transform(
    source: &[Vector3<f32>],
    target: &[Vector3<f32>],
) -> Option<Transform> {
    if source.len() != target.len() || source.len() < 3 {
        return None;
    }

    let n = source.len() as f64;
    let source_centroid = source
        .iter()
        .fold(Vector3::<f64>::zeros(), |acc, p| acc + p.cast::<f64>())
        / n;
    let target_centroid = target
        .iter()
        .fold(Vector3::<f64>::zeros(), |acc, p| acc + p.cast::<f64>())
        / n;

    let covariance = source
        .iter()
        .zip(target)
        .fold(Matrix3::<f64>::zeros(), |acc, (s, t)| {
            acc + (t.cast::<f64>() - target_centroid) * (s.cast::<f64>() - source_centroid).transpose()
        });

    let svd = covariance.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    // Avoid reflections.
    let mut correction = Matrix3::<f64>::identity();
    if (u * v_t).determinant() < 0.0 {
        correction[(2, 2)] = -1.0;
    }
    let rotation = u * correction * v_t;
    let translation = target_centroid - rotation * source_centroid;

    Transform::from_rotation_matrix(&rotation.cast::<f32>(), &translation.cast::<f32>())
}
