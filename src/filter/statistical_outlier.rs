use log::debug;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kdtree::R3dTree;
use crate::pointcloud::PointCloud;

/// Parameters of [`remove_statistical_outliers`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalOutlierParams {
    /// Number of neighbors used to compute the mean distance of a point.
    pub neighbors: usize,
    /// Points farther than `mean + threshold * stddev` are removed.
    pub threshold: f32,
}

impl Default for StatisticalOutlierParams {
    fn default() -> Self {
        Self {
            neighbors: 50,
            threshold: 0.3,
        }
    }
}

impl StatisticalOutlierParams {
    pub fn validate(&self) -> Result<()> {
        if self.neighbors == 0 {
            return Err(Error::invalid_parameter(
                "outlier removal needs a positive neighbor count",
            ));
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "outlier removal needs a positive threshold, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Mean distance of every point to its `neighbors` nearest neighbors, excluding itself.
/// Invalid points, or points without neighbors, get infinity.
pub(crate) fn mean_neighbor_distances(cloud: &PointCloud, neighbors: usize) -> Vec<f32> {
    let tree = R3dTree::new(cloud.points.iter());
    (0..cloud.len())
        .into_par_iter()
        .map(|i| {
            if !cloud.is_valid(i) {
                return f32::INFINITY;
            }
            // The query point itself comes first.
            let found = tree.knn(&cloud.points[i], neighbors + 1);
            let distances: Vec<f32> = found
                .iter()
                .filter(|(index, _)| *index != i)
                .take(neighbors)
                .map(|(_, sqr_dist)| sqr_dist.sqrt())
                .collect();
            if distances.is_empty() {
                f32::INFINITY
            } else {
                distances.iter().sum::<f32>() / distances.len() as f32
            }
        })
        .collect()
}

/// Indices of the points that [`remove_statistical_outliers`] keeps, in increasing order.
///
/// # Errors
///
/// * `InvalidParameter` for a zero neighbor count or a non positive threshold.
pub fn find_statistical_inliers(
    cloud: &PointCloud,
    params: &StatisticalOutlierParams,
) -> Result<Vec<usize>> {
    params.validate()?;

    if cloud.len() < params.neighbors {
        debug!(
            "Outlier removal skipped: {} points, {} neighbors",
            cloud.len(),
            params.neighbors
        );
        return Ok((0..cloud.len()).collect());
    }

    let mean_distances = mean_neighbor_distances(cloud, params.neighbors);

    let finite: Vec<f64> = mean_distances
        .iter()
        .filter(|d| d.is_finite())
        .map(|d| *d as f64)
        .collect();

    let max_distance = if finite.is_empty() {
        f32::INFINITY
    } else {
        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let variance = if finite.len() > 1 {
            finite.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        (mean + params.threshold as f64 * variance.sqrt()) as f32
    };

    let keep: Vec<usize> = mean_distances
        .iter()
        .enumerate()
        .filter(|(_, d)| d.is_finite() && **d <= max_distance)
        .map(|(i, _)| i)
        .collect();
    debug!(
        "Outlier removal: {} of {} points kept, max mean distance {max_distance}",
        keep.len(),
        cloud.len()
    );
    Ok(keep)
}

/// Removes the points whose mean distance to their neighbors exceeds
/// `mean + threshold * stddev` of the whole cloud. Invalid points are always removed.
///
/// A cloud with fewer points than `params.neighbors` is left untouched.
///
/// # Returns
///
/// The number of removed points.
///
/// # Errors
///
/// * `InvalidParameter` for a zero neighbor count or a non positive threshold.
pub fn remove_statistical_outliers(
    cloud: &mut PointCloud,
    params: &StatisticalOutlierParams,
) -> Result<usize> {
    let keep = find_statistical_inliers(cloud, params)?;
    let removed = cloud.len() - keep.len();
    if removed > 0 {
        *cloud = cloud.select(&keep);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;
    use crate::unit_test::grid_points;

    fn cluster_with_outlier() -> PointCloud {
        let mut points = grid_points(5, 0.1);
        points.push(Vector3::new(100.0, 100.0, 100.0));
        PointCloud::from_positions(points)
    }

    #[test]
    fn should_remove_outliers() {
        let mut cloud = cluster_with_outlier();
        let removed = remove_statistical_outliers(
            &mut cloud,
            &StatisticalOutlierParams {
                neighbors: 8,
                threshold: 1.0,
            },
        )
        .unwrap();

        assert!(removed >= 1);
        assert!(cloud.points.iter().all(|p| p.norm() < 10.0));
    }

    #[test]
    fn should_only_remove_points_above_the_limit() {
        let original = cluster_with_outlier();
        let params = StatisticalOutlierParams {
            neighbors: 6,
            threshold: 0.5,
        };
        let distances = mean_neighbor_distances(&original, params.neighbors);
        let n = distances.len() as f32;
        let mean = distances.iter().sum::<f32>() / n;
        let stddev = (distances.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / (n - 1.0)).sqrt();
        let limit = mean + params.threshold * stddev;

        let mut cloud = original.clone();
        let removed = remove_statistical_outliers(&mut cloud, &params).unwrap();
        assert_eq!(removed, original.len() - cloud.len());

        let kept: Vec<Vector3<f32>> = cloud.points.to_vec();
        for (point, distance) in original.points.iter().zip(distances.iter()) {
            if !kept.contains(point) {
                assert!(*distance > limit);
            }
        }
    }

    #[test]
    fn should_keep_regular_grid() {
        let mut cloud = PointCloud::from_positions(grid_points(3, 1.0));
        let removed = remove_statistical_outliers(
            &mut cloud,
            &StatisticalOutlierParams {
                neighbors: 5,
                threshold: 3.0,
            },
        )
        .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(cloud.len(), 27);
    }

    #[test]
    fn should_skip_small_clouds() {
        let mut cloud = PointCloud::from_positions(vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(50.0, 0.0, 0.0),
        ]);
        let removed =
            remove_statistical_outliers(&mut cloud, &StatisticalOutlierParams::default()).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(cloud.len(), 3);
    }

    #[test]
    fn should_remove_invalid_points() {
        let mut points = grid_points(3, 1.0);
        points.push(Vector3::new(f32::NAN, 0.0, 0.0));
        let mut cloud = PointCloud::from_positions(points);
        let removed = remove_statistical_outliers(
            &mut cloud,
            &StatisticalOutlierParams {
                neighbors: 4,
                threshold: 10.0,
            },
        )
        .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cloud.valid_indices().len(), cloud.len());
    }

    #[test]
    fn should_reject_invalid_parameters() {
        let mut cloud = cluster_with_outlier();
        let before = cloud.len();
        for params in [
            StatisticalOutlierParams {
                neighbors: 0,
                threshold: 1.0,
            },
            StatisticalOutlierParams {
                neighbors: 5,
                threshold: 0.0,
            },
            StatisticalOutlierParams {
                neighbors: 5,
                threshold: -1.0,
            },
        ] {
            assert!(matches!(
                remove_statistical_outliers(&mut cloud, &params),
                Err(Error::InvalidParameter(_))
            ));
        }
        assert_eq!(cloud.len(), before);
    }
}
