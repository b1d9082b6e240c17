#![allow(dead_code)]

use nalgebra::Vector3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use scanalign::{
    filter::VoxelGridParams,
    fpfh::FpfhParams,
    kdtree::SearchParams,
    normals::NormalEstimationParams,
    pipeline::PipelineConfig,
    pointcloud::PointCloud,
    registration::AlignParams,
};

/// Jittered `n x n` samples of a height field without symmetries over `[-1, 1]^2`.
pub fn terrain(n: usize, seed: u64) -> PointCloud {
    let mut rng = SmallRng::seed_from_u64(seed);
    let step = 2.0 / (n - 1) as f32;
    let mut points = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            let x = -1.0 + i as f32 * step + rng.gen_range(-0.2..0.2) * step;
            let y = -1.0 + j as f32 * step + rng.gen_range(-0.2..0.2) * step;
            let z = 0.3 * (3.0 * x).sin() * (2.0 * y).cos() + 0.2 * x * x - 0.1 * y;
            points.push(Vector3::new(x, y, z));
        }
    }
    PointCloud::from_positions(points)
}

/// Pipeline tuned for [`terrain`] clouds of 30 x 30 points.
pub fn terrain_config(seed: u64) -> PipelineConfig {
    PipelineConfig {
        voxel_grid: Some(VoxelGridParams::new(0.01)),
        normals: NormalEstimationParams {
            neighborhood: SearchParams::Knn(15),
        },
        fpfh: FpfhParams::default().with_radius(0.3),
        align: AlignParams {
            max_iterations: 20_000,
            seed: Some(seed),
            ..AlignParams::default().with_point_spacing(0.02)
        },
        ..Default::default()
    }
}
