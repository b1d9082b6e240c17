use nalgebra::Vector3;

/// Height over length ratio below which a sample is considered collinear.
const COLLINEARITY_TOLERANCE: f32 = 1e-2;

/// Checks that a sample of object points can define a rigid transform: points must be
/// at least `min_distance` apart and must not lie on a line.
pub fn is_degenerate_sample(points: &[Vector3<f32>], min_distance: f32) -> bool {
    if points.len() < 3 {
        return true;
    }

    let min_sqr_distance = min_distance * min_distance;
    let mut farthest = (0, 0, 0.0f32);
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            let sqr_dist = (points[i] - points[j]).norm_squared();
            if sqr_dist <= min_sqr_distance || sqr_dist == 0.0 {
                return true;
            }
            if sqr_dist > farthest.2 {
                farthest = (i, j, sqr_dist);
            }
        }
    }

    let (a, b, sqr_length) = farthest;
    let axis = points[b] - points[a];
    let max_height = points
        .iter()
        .map(|p| axis.cross(&(p - points[a])).norm())
        .fold(0.0f32, f32::max)
        / sqr_length.sqrt();
    max_height < COLLINEARITY_TOLERANCE * sqr_length.sqrt()
}

/// Rejects correspondence samples whose pairwise distances do not agree between the
/// object and the scene. A rigid transform preserves distances, so for a good sample
/// every `min(d_object, d_scene) / max(d_object, d_scene)` is close to 1.
#[derive(Debug, Clone, Copy)]
pub struct EdgeLengthRejector {
    /// Minimum accepted ratio, in `(0, 1]`.
    pub similarity_threshold: f32,
}

impl EdgeLengthRejector {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            similarity_threshold,
        }
    }

    /// Returns true if all the pairwise distances among `object` match the ones among `scene`.
    pub fn is_consistent(&self, object: &[Vector3<f32>], scene: &[Vector3<f32>]) -> bool {
        if object.len() != scene.len() {
            return false;
        }

        for i in 0..object.len() {
            for j in i + 1..object.len() {
                let object_length = (object[i] - object[j]).norm();
                let scene_length = (scene[i] - scene[j]).norm();
                let longest = object_length.max(scene_length);
                if !(longest > 0.0) {
                    return false;
                }
                if object_length.min(scene_length) / longest < self.similarity_threshold {
                    return false;
                }
            }
        }
        true
    }
}
