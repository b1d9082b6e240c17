use nalgebra::{
    Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3,
};

use std::ops;

use crate::error::{Error, Result};

/// Tolerance used to accept a 3x3 block as a rotation.
const ORTHONORMAL_TOLERANCE: f32 = 1e-3;

/// Checks whether `matrix` is orthonormal with determinant +1.
pub fn is_rotation(matrix: &Matrix3<f32>) -> bool {
    if matrix.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let gram = matrix.transpose() * matrix;
    (gram - Matrix3::identity()).amax() < ORTHONORMAL_TOLERANCE
        && (matrix.determinant() - 1.0).abs() < ORTHONORMAL_TOLERANCE
}

/// Rigid transformation (rotation followed by translation).
#[derive(Clone, Debug, PartialEq)]
pub struct Transform(Isometry3<f32>);

impl Transform {
    pub fn eye() -> Self {
        Self(Isometry3::identity())
    }

    /// Creates a transform from a translation and a rotation.
    pub fn new(translation: &Vector3<f32>, rotation: &UnitQuaternion<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(*translation),
            *rotation,
        ))
    }

    /// Creates a transform from a translation and Euler angles in radians. The rotation
    /// turns `rx` about x, then `ry` about y, then `rz` about z, all on fixed axes.
    pub fn from_euler(translation: &Vector3<f32>, rx: f32, ry: f32, rz: f32) -> Self {
        Self::new(translation, &UnitQuaternion::from_euler_angles(rx, ry, rz))
    }

    /// Creates a transform from a rotation matrix and a translation. Returns `None` when
    /// the matrix is not a proper rotation.
    pub fn from_rotation_matrix(
        rotation: &Matrix3<f32>,
        translation: &Vector3<f32>,
    ) -> Option<Self> {
        if !is_rotation(rotation) || translation.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let rotation = Rotation3::from_matrix_unchecked(*rotation);
        Some(Self(Isometry3::from_parts(
            Translation3::from(*translation),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )))
    }

    /// Creates a transform from a 4x4 homogeneous matrix.
    ///
    /// # Errors
    ///
    /// * `InvalidParameter` if the rotation block is not orthonormal with determinant +1 or
    ///   the last row is not `[0, 0, 0, 1]`.
    pub fn from_matrix4(matrix: &Matrix4<f32>) -> Result<Self> {
        let last_row_ok = (matrix[(3, 0)].abs() + matrix[(3, 1)].abs() + matrix[(3, 2)].abs())
            < ORTHONORMAL_TOLERANCE
            && (matrix[(3, 3)] - 1.0).abs() < ORTHONORMAL_TOLERANCE;
        if !last_row_ok {
            return Err(Error::invalid_parameter(
                "the last row of a rigid transform must be [0, 0, 0, 1]",
            ));
        }
        let rotation: Matrix3<f32> = matrix.fixed_slice::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]);
        Self::from_rotation_matrix(&rotation, &translation).ok_or_else(|| {
            Error::invalid_parameter("the rotation block is not orthonormal with determinant +1")
        })
    }

    /// Homogeneous 4x4 matrix of the transform.
    pub fn matrix(&self) -> Matrix4<f32> {
        self.0.to_homogeneous()
    }

    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        self.0.rotation.to_rotation_matrix().into_inner()
    }

    pub fn translation(&self) -> Vector3<f32> {
        self.0.translation.vector
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f32 {
        self.0.rotation.angle()
    }

    pub fn inverse(&self) -> Self {
        Self(self.0.inverse())
    }

    /// Applies the rotation and translation to a point.
    pub fn transform_vector(&self, vector: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * vector + self.0.translation.vector
    }

    /// Applies only the rotation, for directions such as normals.
    pub fn transform_normal(&self, normal: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * normal
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::eye()
    }
}

impl ops::Mul<&Vector3<f32>> for &Transform {
    type Output = Vector3<f32>;

    fn mul(self, rhs: &Vector3<f32>) -> Self::Output {
        self.transform_vector(rhs)
    }
}

impl ops::Mul<&Transform> for &Transform {
    type Output = Transform;

    fn mul(self, rhs: &Transform) -> Self::Output {
        Transform(self.0 * rhs.0)
    }
}

impl From<Transform> for Matrix4<f32> {
    fn from(transform: Transform) -> Self {
        transform.0.into()
    }
}

impl std::fmt::Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let matrix = self.matrix();
        for row in matrix.row_iter() {
            writeln!(
                f,
                "{:>12.6} {:>12.6} {:>12.6} {:>12.6}",
                row[0], row[1], row[2], row[3]
            )?;
        }
        Ok(())
    }
}
