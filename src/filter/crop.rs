use log::debug;
use nalgebra::Vector3;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pointcloud::PointCloud;

/// Quantity compared against the crop threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropAxis {
    X,
    Y,
    Z,
    /// Distance to the z axis, in the xy plane.
    Radius,
}

impl CropAxis {
    fn value(&self, point: &Vector3<f32>) -> f32 {
        match self {
            CropAxis::X => point[0],
            CropAxis::Y => point[1],
            CropAxis::Z => point[2],
            CropAxis::Radius => point.xy().norm(),
        }
    }
}

/// Parameters of [`crop`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropParams {
    pub axis: CropAxis,
    pub threshold: f32,
    /// Keeps the points with a value `>= threshold` when set, `<= threshold` otherwise.
    pub keep_above: bool,
}

impl CropParams {
    pub fn new(axis: CropAxis, threshold: f32, keep_above: bool) -> Self {
        Self {
            axis,
            threshold,
            keep_above,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(Error::invalid_parameter(format!(
                "crop threshold must be finite, got {}",
                self.threshold
            )));
        }
        if self.axis == CropAxis::Radius && self.threshold < 0.0 {
            return Err(Error::invalid_parameter(format!(
                "crop radius must not be negative, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    fn keeps(&self, point: &Vector3<f32>) -> bool {
        let value = self.axis.value(point);
        if self.keep_above {
            value >= self.threshold
        } else {
            value <= self.threshold
        }
    }
}

/// Indices of the points on the kept side of the threshold, in order. Boundary points are
/// kept and invalid points never are.
///
/// # Errors
///
/// * `InvalidParameter` for a non finite threshold or a negative radius.
pub fn find_cropped(cloud: &PointCloud, params: &CropParams) -> Result<Vec<usize>> {
    params.validate()?;
    Ok((0..cloud.len())
        .filter(|index| cloud.is_valid(*index) && params.keeps(&cloud.points[*index]))
        .collect())
}

/// Cuts the cloud along an axis aligned plane, or a cylinder around the z axis, keeping
/// the side selected by `params`.
///
/// # Returns
///
/// The number of removed points.
///
/// # Errors
///
/// * `InvalidParameter` for a non finite threshold or a negative radius.
pub fn crop(cloud: &mut PointCloud, params: &CropParams) -> Result<usize> {
    let keep = find_cropped(cloud, params)?;
    let removed = cloud.len() - keep.len();
    if removed > 0 {
        *cloud = cloud.select(&keep);
    }
    debug!(
        "Crop on {:?}: {} points kept, {} removed",
        params.axis,
        keep.len(),
        removed
    );
    Ok(removed)
}
