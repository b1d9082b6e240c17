use std::collections::HashMap;

use log::debug;
use nalgebra::Vector3;
use ndarray::Array1;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pointcloud::PointCloud;

/// Voxel edge length used when none is given.
pub const DEFAULT_VOXEL_SIZE: f32 = 0.01;

/// Parameters of [`voxel_downsample`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxelGridParams {
    /// Edge length of the cubic cells.
    pub voxel_size: f32,
}

impl Default for VoxelGridParams {
    fn default() -> Self {
        Self {
            voxel_size: DEFAULT_VOXEL_SIZE,
        }
    }
}

impl VoxelGridParams {
    pub fn new(voxel_size: f32) -> Self {
        Self { voxel_size }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "voxel size must be positive, got {}",
                self.voxel_size
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct VoxelAccum {
    position: Vector3<f64>,
    color: Vector3<u32>,
    normal: Vector3<f64>,
    curvature: f64,
    count: usize,
}

/// Replaces all the points inside each occupied voxel by their centroid. Colors, normals
/// and curvatures are averaged when the cloud has them; averaged normals are renormalized.
/// Invalid points are dropped.
///
/// The output keeps the order in which cells are first occupied.
///
/// # Returns
///
/// The number of removed points.
///
/// # Errors
///
/// * `InvalidParameter` for a non positive voxel size.
pub fn voxel_downsample(cloud: &mut PointCloud, params: &VoxelGridParams) -> Result<usize> {
    params.validate()?;

    if cloud.is_empty() {
        return Ok(0);
    }

    let inv_size = 1.0 / params.voxel_size as f64;
    let mut cell_slots: HashMap<(i64, i64, i64), usize> = HashMap::new();
    let mut accums: Vec<VoxelAccum> = Vec::new();

    for i in 0..cloud.len() {
        if !cloud.is_valid(i) {
            continue;
        }
        let point = cloud.points[i].cast::<f64>();
        let key = (
            (point[0] * inv_size).floor() as i64,
            (point[1] * inv_size).floor() as i64,
            (point[2] * inv_size).floor() as i64,
        );

        let slot = *cell_slots.entry(key).or_insert_with(|| {
            accums.push(VoxelAccum::default());
            accums.len() - 1
        });

        let accum = &mut accums[slot];
        accum.position += point;
        if let Some(colors) = &cloud.colors {
            accum.color += colors[i].cast::<u32>();
        }
        if let Some(normals) = &cloud.normals {
            accum.normal += normals[i].cast::<f64>();
        }
        if let Some(curvatures) = &cloud.curvatures {
            accum.curvature += curvatures[i] as f64;
        }
        accum.count += 1;
    }

    let positions: Array1<Vector3<f32>> = accums
        .iter()
        .map(|a| (a.position / a.count as f64).cast::<f32>())
        .collect();
    let colors = cloud.colors.as_ref().map(|_| {
        accums
            .iter()
            .map(|a| {
                let count = a.count as u32;
                // Rounded average.
                a.color.map(|c| ((c + count / 2) / count).min(255) as u8)
            })
            .collect::<Array1<Vector3<u8>>>()
    });
    let normals = cloud.normals.as_ref().map(|_| {
        accums
            .iter()
            .map(|a| {
                let norm = a.normal.norm();
                if norm > 1e-12 {
                    (a.normal / norm).cast::<f32>()
                } else {
                    Vector3::zeros()
                }
            })
            .collect::<Array1<Vector3<f32>>>()
    });
    let curvatures = cloud.curvatures.as_ref().map(|_| {
        accums
            .iter()
            .map(|a| (a.curvature / a.count as f64) as f32)
            .collect::<Array1<f32>>()
    });

    let removed = cloud.len() - positions.len();
    *cloud = PointCloud {
        points: positions,
        colors,
        normals,
        curvatures,
    };

    debug!(
        "Voxel grid ({}): {removed} removed, {} cells",
        params.voxel_size,
        cloud.len()
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::pointcloud::Point;

    fn occupied_cells(cloud: &PointCloud, size: f32) -> usize {
        cloud
            .points
            .iter()
            .map(|p| {
                (
                    (p[0] as f64 / size as f64).floor() as i64,
                    (p[1] as f64 / size as f64).floor() as i64,
                    (p[2] as f64 / size as f64).floor() as i64,
                )
            })
            .collect::<HashSet<_>>()
            .len()
    }

    fn random_cloud(n: usize) -> PointCloud {
        let mut rng = SmallRng::seed_from_u64(7);
        PointCloud::from_positions(
            (0..n)
                .map(|_| {
                    Vector3::new(
                        rng.gen_range(-1.0..1.0),
                        rng.gen_range(-1.0..1.0),
                        rng.gen_range(-1.0..1.0),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn should_average_cells() {
        let mut cloud = PointCloud::from_points(&[
            Point::new(0.0, 0.0, 0.0).with_color(0, 0, 100),
            Point::new(0.5, 0.0, 0.0).with_color(10, 0, 200),
            Point::new(0.0, 0.5, 0.5).with_color(20, 0, 0),
            Point::new(0.5, 0.5, 0.5).with_color(30, 255, 0),
            Point::new(1.5, 0.5, 0.5).with_color(1, 2, 3),
        ])
        .unwrap();

        let removed = voxel_downsample(&mut cloud, &VoxelGridParams::new(1.0)).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(cloud.len(), 2);

        let first = cloud.get(0);
        assert!((first.position - Vector3::new(0.25, 0.25, 0.25)).norm() < 1e-6);
        assert_eq!(first.color, Some(Vector3::new(15, 64, 75)));
        assert_eq!(cloud.get(1).color, Some(Vector3::new(1, 2, 3)));
    }

    #[test]
    fn should_not_exceed_occupied_cells() {
        let original = random_cloud(3000);
        let mut cloud = original.clone();
        voxel_downsample(&mut cloud, &VoxelGridParams::new(0.25)).unwrap();
        assert!(cloud.len() <= occupied_cells(&original, 0.25));
        assert!(cloud.len() <= original.len());
    }

    #[test]
    fn should_be_idempotent() {
        let mut cloud = random_cloud(3000);
        let params = VoxelGridParams::new(0.3);
        voxel_downsample(&mut cloud, &params).unwrap();
        let once = cloud.clone();

        let removed = voxel_downsample(&mut cloud, &params).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(cloud.len(), once.len());
        for (a, b) in cloud.points.iter().zip(once.points.iter()) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn should_average_normals() {
        let mut cloud = PointCloud::from_points(&[
            Point::new(0.1, 0.1, 0.1).with_normal(Vector3::x(), 0.2),
            Point::new(0.2, 0.2, 0.2).with_normal(Vector3::y(), 0.4),
        ])
        .unwrap();
        voxel_downsample(&mut cloud, &VoxelGridParams::new(1.0)).unwrap();

        let point = cloud.get(0);
        let expected = Vector3::new(1.0, 1.0, 0.0).normalize();
        assert!((point.normal.unwrap() - expected).norm() < 1e-6);
        assert!((point.curvature.unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn should_handle_empty_and_invalid() {
        let mut empty = PointCloud::default();
        assert_eq!(voxel_downsample(&mut empty, &VoxelGridParams::default()).unwrap(), 0);

        let mut cloud = PointCloud::from_positions(vec![
            Vector3::new(f32::NAN, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
        ]);
        assert_eq!(voxel_downsample(&mut cloud, &VoxelGridParams::new(1.0)).unwrap(), 1);
        assert_eq!(cloud.len(), 1);
    }

    #[test]
    fn should_reject_invalid_size() {
        let mut cloud = random_cloud(10);
        for size in [0.0, -1.0, f32::NAN] {
            assert!(matches!(
                voxel_downsample(&mut cloud, &VoxelGridParams::new(size)),
                Err(Error::InvalidParameter(_))
            ));
        }
        assert_eq!(cloud.len(), 10);
    }
}
