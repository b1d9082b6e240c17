//! Fast Point Feature Histograms.
//!
//! Each point gets a 33 bin signature made of three 11 bin histograms, one for each
//! angular feature of the Darboux frame between the point and its neighbors. A first
//! pass builds the simplified histogram (SPFH) of every point from its own neighbors,
//! a second pass adds the inverse distance weighted SPFH of the neighbors.
use std::f32::consts::PI;

use log::debug;
use nalgebra::{SVector, Vector3};
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kdtree::R3dTree;
use crate::pointcloud::PointCloud;

/// Number of bins of each angular feature histogram.
pub const FPFH_BINS_PER_FEATURE: usize = 11;
/// Length of a signature.
pub const FPFH_LENGTH: usize = 3 * FPFH_BINS_PER_FEATURE;

/// Sum of each sub histogram after normalization.
const HISTOGRAM_MASS: f32 = 100.0;

pub type FpfhSignature = SVector<f32, FPFH_LENGTH>;

/// Parameters of [`compute_fpfh`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FpfhParams {
    /// Neighborhood radius. Should be larger than the one used for normals.
    pub radius: f32,
    /// Caps the number of neighbors, keeping the nearest.
    pub max_neighbors: Option<usize>,
}

impl Default for FpfhParams {
    fn default() -> Self {
        Self {
            radius: 0.025,
            max_neighbors: None,
        }
    }
}

impl FpfhParams {
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "feature radius must be positive, got {}",
                self.radius
            )));
        }
        if self.max_neighbors == Some(0) {
            return Err(Error::invalid_parameter(
                "the maximum number of feature neighbors must be positive",
            ));
        }
        Ok(())
    }
}

/// Descriptors of a cloud, in the same order as its points.
#[derive(Debug, Clone, Default)]
pub struct FeatureCloud {
    pub descriptors: Vec<FpfhSignature>,
    /// `false` for points whose descriptor could not be computed (no neighbor or no normal).
    /// Their descriptor is all zeros.
    pub valid: Vec<bool>,
}

impl FeatureCloud {
    /// Wraps descriptors that are all valid.
    pub fn from_descriptors(descriptors: Vec<FpfhSignature>) -> Self {
        let valid = vec![true; descriptors.len()];
        Self { descriptors, valid }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

/// Angular and distance features between two oriented points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairFeatures {
    /// Angle in `[-pi, pi]` between the normals around the frame's `v` axis.
    pub theta: f32,
    /// Cosine between the frame's `v` axis and the second normal.
    pub alpha: f32,
    /// Cosine between the source normal and the direction between the points.
    pub phi: f32,
    /// Euclidean distance between the points.
    pub distance: f32,
}

/// Computes the Darboux frame features of the pair. The source of the frame is the point
/// whose normal makes the smaller angle with the connecting line, which makes the result
/// independent of the argument order. Returns `None` for coincident points.
pub fn pair_features(
    p1: &Vector3<f32>,
    n1: &Vector3<f32>,
    p2: &Vector3<f32>,
    n2: &Vector3<f32>,
) -> Option<PairFeatures> {
    let mut dp2p1 = p2 - p1;
    let distance = dp2p1.norm();
    if !(distance > 0.0) {
        return None;
    }

    let angle1 = n1.dot(&dp2p1) / distance;
    let angle2 = n2.dot(&dp2p1) / distance;
    let (source_normal, target_normal, phi) =
        if angle1.abs().min(1.0).acos() > angle2.abs().min(1.0).acos() {
            dp2p1 = -dp2p1;
            (n2, n1, -angle2)
        } else {
            (n1, n2, angle1)
        };

    let v = dp2p1.cross(source_normal);
    let v_norm = v.norm();
    if v_norm == 0.0 {
        return Some(PairFeatures {
            theta: 0.0,
            alpha: 0.0,
            phi,
            distance,
        });
    }
    let v = v / v_norm;
    let w = source_normal.cross(&v);

    Some(PairFeatures {
        theta: w.dot(target_normal).atan2(source_normal.dot(target_normal)),
        alpha: v.dot(target_normal),
        phi,
        distance,
    })
}

fn bin(value: f32, lower: f32, upper: f32) -> usize {
    let scaled = FPFH_BINS_PER_FEATURE as f32 * (value - lower) / (upper - lower);
    (scaled.floor().max(0.0) as usize).min(FPFH_BINS_PER_FEATURE - 1)
}

/// Simplified histogram of a point from its neighbors.
fn compute_spfh(cloud: &PointCloud, index: usize, neighbors: &[(usize, f32)]) -> FpfhSignature {
    let mut histogram = FpfhSignature::zeros();
    let normals = match &cloud.normals {
        Some(normals) => normals,
        None => return histogram,
    };

    let point = &cloud.points[index];
    let normal = &normals[index];
    let features: Vec<PairFeatures> = neighbors
        .iter()
        .filter_map(|(neighbor, _)| {
            pair_features(point, normal, &cloud.points[*neighbor], &normals[*neighbor])
        })
        .collect();

    if features.is_empty() {
        return histogram;
    }

    let increment = HISTOGRAM_MASS / features.len() as f32;
    for feature in features {
        histogram[bin(feature.theta, -PI, PI)] += increment;
        histogram[FPFH_BINS_PER_FEATURE + bin(feature.alpha, -1.0, 1.0)] += increment;
        histogram[2 * FPFH_BINS_PER_FEATURE + bin(feature.phi, -1.0, 1.0)] += increment;
    }
    histogram
}

/// Computes the FPFH signature of every point of the cloud. The cloud must have normals.
///
/// Points without neighbors in the radius, invalid points and points with a zero normal
/// get a zero signature flagged as invalid.
///
/// # Errors
///
/// * `InvalidParameter` if the cloud has no normals or the parameters are invalid.
pub fn compute_fpfh(cloud: &PointCloud, params: &FpfhParams) -> Result<FeatureCloud> {
    params.validate()?;
    if cloud.normals.is_none() {
        return Err(Error::invalid_parameter(
            "feature computation needs a cloud with normals",
        ));
    }

    let tree = R3dTree::new(cloud.points.iter());

    let neighborhoods: Vec<Vec<(usize, f32)>> = (0..cloud.len())
        .into_par_iter()
        .map(|i| {
            if !cloud.is_valid(i) || !cloud.has_valid_normal(i) {
                return Vec::new();
            }
            let query = &cloud.points[i];
            let found = match params.max_neighbors {
                // One more for the query point itself.
                Some(max) => tree.hybrid(query, params.radius, max + 1),
                None => tree.radius(query, params.radius),
            };
            found
                .into_iter()
                .filter(|(index, sqr_dist)| {
                    *index != i && *sqr_dist > 0.0 && cloud.has_valid_normal(*index)
                })
                .collect()
        })
        .collect();

    let spfh: Vec<FpfhSignature> = neighborhoods
        .par_iter()
        .enumerate()
        .map(|(i, neighbors)| compute_spfh(cloud, i, neighbors))
        .collect();

    let (descriptors, valid): (Vec<FpfhSignature>, Vec<bool>) = neighborhoods
        .par_iter()
        .enumerate()
        .map(|(i, neighbors)| {
            if neighbors.is_empty() {
                return (FpfhSignature::zeros(), false);
            }

            let mut weighted = FpfhSignature::zeros();
            for (neighbor, sqr_dist) in neighbors {
                weighted += spfh[*neighbor] * (1.0 / sqr_dist);
            }

            for feature in 0..3 {
                let range = feature * FPFH_BINS_PER_FEATURE..(feature + 1) * FPFH_BINS_PER_FEATURE;
                let sum: f32 = weighted.as_slice()[range.clone()].iter().sum();
                if sum > 0.0 {
                    let scale = HISTOGRAM_MASS / sum;
                    for b in range {
                        weighted[b] *= scale;
                    }
                }
            }
            (spfh[i] + weighted, true)
        })
        .unzip();

    let features = FeatureCloud { descriptors, valid };
    debug!(
        "FPFH computed for {} points, {} valid",
        features.len(),
        features.valid_count()
    );
    Ok(features)
}

#[cfg(test)]
mod tests {
    use nalgebra::UnitQuaternion;
    use rstest::*;

    use super::*;
    use crate::normals::{estimate_normals, NormalEstimationParams, NormalOrientation};
    use crate::pointcloud::Point;
    use crate::transform::Transform;
    use crate::unit_test::sample_sphere;

    #[test]
    fn should_compute_symmetric_pair_features() {
        let p1 = Vector3::new(0.0, 0.0, 0.0);
        let n1 = Vector3::new(0.0, 0.0, 1.0);
        let p2 = Vector3::new(1.0, 0.0, 0.0);
        let n2 = Vector3::new(0.6, 0.0, 0.8);

        let forward = pair_features(&p1, &n1, &p2, &n2).unwrap();
        let backward = pair_features(&p2, &n2, &p1, &n1).unwrap();
        assert!((forward.distance - 1.0).abs() < 1e-6);
        assert!((forward.theta - backward.theta).abs() < 1e-5);
        assert!((forward.alpha - backward.alpha).abs() < 1e-5);
        assert!((forward.phi - backward.phi).abs() < 1e-5);

        assert!(pair_features(&p1, &n1, &p1, &n2).is_none());
    }

    #[test]
    fn should_bin_limits_inside_range() {
        assert_eq!(bin(-PI, -PI, PI), 0);
        assert_eq!(bin(PI, -PI, PI), FPFH_BINS_PER_FEATURE - 1);
        assert_eq!(bin(0.0, -1.0, 1.0), 5);
        assert_eq!(bin(1.5, -1.0, 1.0), FPFH_BINS_PER_FEATURE - 1);
    }

    fn sphere_with_normals(sample_sphere: PointCloud) -> PointCloud {
        let mut cloud = sample_sphere;
        let viewpoints = crate::viewpoint::Viewpoints::single(Vector3::zeros(), cloud.len());
        estimate_normals(
            &mut cloud,
            &NormalEstimationParams::default(),
            NormalOrientation::TowardsViewpoints(&viewpoints),
        )
        .unwrap();
        cloud
    }

    #[rstest]
    fn should_normalize_histograms(sample_sphere: PointCloud) {
        let cloud = sphere_with_normals(sample_sphere);
        let features = compute_fpfh(
            &cloud,
            &FpfhParams {
                radius: 0.2,
                max_neighbors: None,
            },
        )
        .unwrap();

        assert_eq!(features.len(), cloud.len());
        assert_eq!(features.valid_count(), cloud.len());
        for descriptor in features.descriptors.iter() {
            for feature in 0..3 {
                let sum: f32 = descriptor.as_slice()
                    [feature * FPFH_BINS_PER_FEATURE..(feature + 1) * FPFH_BINS_PER_FEATURE]
                    .iter()
                    .sum();
                assert!((sum - 2.0 * HISTOGRAM_MASS).abs() < 1e-2, "sum {sum}");
            }
        }
    }

    #[rstest]
    fn should_be_rotation_invariant(sample_sphere: PointCloud) {
        let cloud = sphere_with_normals(sample_sphere);
        let transform = Transform::new(
            &Vector3::new(1.0, -2.0, 0.5),
            &UnitQuaternion::from_scaled_axis(Vector3::new(0.3, -0.7, 1.1)),
        );
        let moved = &transform * &cloud;
        let params = FpfhParams {
            radius: 0.2,
            max_neighbors: None,
        };

        let features = compute_fpfh(&cloud, &params).unwrap();
        let moved_features = compute_fpfh(&moved, &params).unwrap();
        let mut total_diff = 0.0;
        for (a, b) in features
            .descriptors
            .iter()
            .zip(moved_features.descriptors.iter())
        {
            total_diff += (a - b).norm() / a.norm();
        }
        let mean_relative_diff = total_diff / features.len() as f32;
        assert!(mean_relative_diff < 0.01, "difference {mean_relative_diff}");
    }

    #[test]
    fn should_flag_isolated_points() {
        let cloud = PointCloud::from_points(&[
            Point::new(0.0, 0.0, 0.0).with_normal(Vector3::z(), 0.0),
            Point::new(0.05, 0.0, 0.0).with_normal(Vector3::z(), 0.0),
            Point::new(0.0, 0.05, 0.0).with_normal(Vector3::x(), 0.0),
            Point::new(10.0, 0.0, 0.0).with_normal(Vector3::z(), 0.0),
            Point::new(0.0, 0.0, 0.05).with_normal(Vector3::zeros(), 0.0),
        ])
        .unwrap();

        let features = compute_fpfh(&cloud, &FpfhParams::default().with_radius(0.1)).unwrap();
        assert_eq!(features.valid, vec![true, true, true, false, false]);
        assert_eq!(features.descriptors[3], FpfhSignature::zeros());
        assert_eq!(features.descriptors[4], FpfhSignature::zeros());
        assert!(features.descriptors.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn should_require_normals() {
        let cloud = PointCloud::from_positions(vec![Vector3::zeros()]);
        assert!(matches!(
            compute_fpfh(&cloud, &FpfhParams::default()),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn should_validate_params() {
        assert!(FpfhParams::default().with_radius(0.0).validate().is_err());
        assert!(FpfhParams {
            radius: 1.0,
            max_neighbors: Some(0)
        }
        .validate()
        .is_err());
    }
}
