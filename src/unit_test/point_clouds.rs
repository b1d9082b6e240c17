use nalgebra::Vector3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rstest::fixture;

use crate::fpfh::{FeatureCloud, FpfhSignature};
use crate::pointcloud::PointCloud;

/// `n x n x n` regular grid starting at the origin.
pub fn grid_points(n: usize, spacing: f32) -> Vec<Vector3<f32>> {
    let mut points = Vec::with_capacity(n * n * n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                points.push(Vector3::new(i as f32, j as f32, k as f32) * spacing);
            }
        }
    }
    points
}

/// Jittered samples of a tilted plane and its unit normal.
#[fixture]
pub fn sample_plane() -> (PointCloud, Vector3<f32>) {
    let normal = Vector3::new(1.0, 2.0, 3.0).normalize();
    let u = normal.cross(&Vector3::x()).normalize();
    let v = normal.cross(&u);
    let origin = Vector3::new(0.5, 0.2, -0.1);

    let mut rng = SmallRng::seed_from_u64(3);
    let mut points = Vec::new();
    for i in 0..30 {
        for j in 0..30 {
            let x = i as f32 * 0.01 + rng.gen_range(-0.002..0.002);
            let y = j as f32 * 0.01 + rng.gen_range(-0.002..0.002);
            points.push(origin + u * x + v * y);
        }
    }
    (PointCloud::from_positions(points), normal)
}

/// Unit sphere centered at the origin, sampled with a Fibonacci lattice.
#[fixture]
pub fn sample_sphere() -> PointCloud {
    const N: usize = 2000;
    let golden_angle = std::f32::consts::PI * (3.0 - 5.0f32.sqrt());
    PointCloud::from_positions(
        (0..N)
            .map(|i| {
                let z = 1.0 - 2.0 * (i as f32 + 0.5) / N as f32;
                let radius = (1.0 - z * z).sqrt();
                let theta = golden_angle * i as f32;
                Vector3::new(radius * theta.cos(), radius * theta.sin(), z)
            })
            .collect(),
    )
}

/// Corners of the unit cube.
#[fixture]
pub fn unit_cube() -> PointCloud {
    PointCloud::from_positions(grid_points(2, 1.0))
}

/// Random points in the unit cube with random descriptors.
#[fixture]
pub fn sample_blob() -> (PointCloud, FeatureCloud) {
    let mut rng = SmallRng::seed_from_u64(17);
    let points = (0..300)
        .map(|_| Vector3::new(rng.gen(), rng.gen(), rng.gen()))
        .collect();
    let descriptors = (0..300)
        .map(|_| FpfhSignature::from_fn(|_, _| rng.gen_range(0.0..100.0)))
        .collect();
    (
        PointCloud::from_positions(points),
        FeatureCloud::from_descriptors(descriptors),
    )
}

/// Jittered height field without symmetries, as seen from above.
#[fixture]
pub fn sample_terrain() -> PointCloud {
    let mut rng = SmallRng::seed_from_u64(29);
    let mut points = Vec::new();
    let step = 2.0 / 29.0;
    for i in 0..30 {
        for j in 0..30 {
            let x = -1.0 + i as f32 * step + rng.gen_range(-0.2..0.2) * step;
            let y = -1.0 + j as f32 * step + rng.gen_range(-0.2..0.2) * step;
            let z = 0.3 * (3.0 * x).sin() * (2.0 * y).cos() + 0.2 * x * x - 0.1 * y;
            points.push(Vector3::new(x, y, z));
        }
    }
    PointCloud::from_positions(points)
}
