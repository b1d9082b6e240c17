use log::{debug, warn};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use ndarray::Array1;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::error::Result;
use crate::kdtree::{R3dTree, SearchParams};
use crate::pointcloud::PointCloud;
use crate::viewpoint::Viewpoints;

/// Below this ratio between the middle and largest eigenvalues the neighborhood is
/// considered a line (or a single point).
const COLLINEAR_RATIO: f64 = 1e-6;

/// Parameters for normal estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalEstimationParams {
    /// Neighborhood used to fit the local plane. The query point is included.
    pub neighborhood: SearchParams,
}

impl Default for NormalEstimationParams {
    fn default() -> Self {
        Self {
            neighborhood: SearchParams::Knn(20),
        }
    }
}

/// How the sign of the normals is chosen.
#[derive(Debug, Clone, Copy)]
pub enum NormalOrientation<'a> {
    /// Keep the sign given by the eigen decomposition.
    Unoriented,
    /// Flip normals so they face the viewpoint that acquired each point.
    TowardsViewpoints(&'a Viewpoints),
}

/// Outcome of a normal estimation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalReport {
    /// Points whose neighborhood could not define a plane. They have a zero normal
    /// and zero curvature.
    pub degenerate: Vec<usize>,
}

/// Local plane fit of a neighborhood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFit {
    pub normal: Vector3<f32>,
    /// Surface variation: smallest eigenvalue over the eigenvalue sum.
    pub curvature: f32,
}

/// Fits a plane to `points` with principal component analysis. Returns `None` for
/// neighborhoods with less than 3 points or whose points are (nearly) collinear.
pub fn fit_plane<'a, I>(points: I) -> Option<PlaneFit>
where
    I: IntoIterator<Item = &'a Vector3<f32>>,
    I::IntoIter: Clone,
{
    let points = points.into_iter();
    let count = points.clone().count();
    if count < 3 {
        return None;
    }

    let centroid = points
        .clone()
        .fold(Vector3::<f64>::zeros(), |acc, p| acc + p.cast::<f64>())
        / count as f64;
    let covariance = points.fold(Matrix3::<f64>::zeros(), |acc, p| {
        let d = p.cast::<f64>() - centroid;
        acc + d * d.transpose()
    }) / count as f64;

    let eigen = SymmetricEigen::new(covariance);
    let mut order = [0usize, 1, 2];
    order.sort_by(|a, b| eigen.eigenvalues[*a].total_cmp(&eigen.eigenvalues[*b]));
    let [smallest, middle, largest] = order.map(|i| eigen.eigenvalues[i].max(0.0));

    if !(largest > 0.0) || middle <= COLLINEAR_RATIO * largest {
        return None;
    }

    let normal = eigen.eigenvectors.column(order[0]).into_owned();
    let norm = normal.norm();
    if !(norm > 0.0) {
        return None;
    }

    Some(PlaneFit {
        normal: (normal / norm).cast::<f32>(),
        curvature: (smallest / (smallest + middle + largest)) as f32,
    })
}

/// Estimates a normal and a curvature for every point of the cloud and attaches
/// them to it, replacing existing ones.
///
/// # Errors
///
/// * `InvalidParameter` for an invalid neighborhood, or viewpoints that do not cover the
///   cloud. The cloud is untouched in that case.
pub fn estimate_normals(
    cloud: &mut PointCloud,
    params: &NormalEstimationParams,
    orientation: NormalOrientation,
) -> Result<NormalReport> {
    params.neighborhood.validate()?;
    if let NormalOrientation::TowardsViewpoints(viewpoints) = orientation {
        viewpoints.validate_for(cloud.len())?;
    }

    let tree = R3dTree::new(cloud.points.iter());
    let points = &cloud.points;

    let fits: Vec<Option<PlaneFit>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let point = &points[i];
            if !crate::pointcloud::is_finite(point) {
                return None;
            }
            let neighbors = tree.search(point, &params.neighborhood);
            let mut fit = fit_plane(neighbors.iter().map(|(index, _)| &points[*index]))?;

            if let NormalOrientation::TowardsViewpoints(viewpoints) = orientation {
                if let Some(origin) = viewpoints.origin_of(i) {
                    if fit.normal.dot(&(origin - point)) < 0.0 {
                        fit.normal = -fit.normal;
                    }
                }
            }
            Some(fit)
        })
        .collect();

    let mut report = NormalReport::default();
    let mut normals = Array1::from_elem(fits.len(), Vector3::zeros());
    let mut curvatures = Array1::zeros(fits.len());
    for (i, fit) in fits.into_iter().enumerate() {
        match fit {
            Some(fit) => {
                normals[i] = fit.normal;
                curvatures[i] = fit.curvature;
            }
            None => report.degenerate.push(i),
        }
    }
    cloud.set_normals(normals, curvatures)?;

    debug!(
        "Normals estimated for {} points, {} degenerate",
        cloud.len(),
        report.degenerate.len()
    );
    if !cloud.is_empty() && report.degenerate.len() * 2 > cloud.len() {
        warn!(
            "{} of {} points have degenerate neighborhoods, consider a larger neighborhood",
            report.degenerate.len(),
            cloud.len()
        );
    }
    Ok(report)
}
