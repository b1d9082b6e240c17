use crate::transform::Transform;

/// Metrics for comparing two transforms.
#[derive(Clone, Debug, Default)]
pub struct TransformMetrics {
    /// Angle between the two transforms in radians.
    pub angle: f32,
    /// Translation vector size between the two transforms.
    pub translation: f32,
}

impl TransformMetrics {
    /// Creates a new `TransformMetrics` from two transforms.
    pub fn new(lfs: &Transform, rhs: &Transform) -> Self {
        let lfs_inv = lfs.inverse();
        let diff = &lfs_inv * rhs;

        Self {
            angle: diff.angle(),
            translation: diff.translation().norm(),
        }
    }

    /// Returns the total error of the two transforms.
    pub fn total(&self) -> f32 {
        self.angle + self.translation
    }
}

impl std::fmt::Display for TransformMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "angle: {:.2}°, translation: {:.5}",
            self.angle.to_degrees(),
            self.translation
        )
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{UnitQuaternion, Vector3};

    use super::*;

    #[test]
    fn test_transform_metrics() {
        let sample0 = Transform::new(
            &Vector3::new(0.2, 0.07, -1.5),
            &UnitQuaternion::from_scaled_axis(Vector3::new(0.01, 0.3, 0.0)),
        );
        let metrics = TransformMetrics::new(&sample0, &sample0.clone());
        assert!(metrics.angle.abs() < 1e-6);
        assert!(metrics.translation.abs() < 1e-6);

        let sample1 = &Transform::new(
            &Vector3::new(0.0, 0.0, 1.0),
            &UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 0.5)),
        ) * &sample0;
        let metrics = TransformMetrics::new(&sample0, &sample1);
        assert!((metrics.angle - 0.5).abs() < 1e-4);
        assert!(metrics.total() > metrics.angle);
    }
}
