use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parameters of the [`super::GlobalAligner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignParams {
    /// Number of sample consensus trials.
    pub max_iterations: usize,
    /// Number of correspondences drawn to fit each hypothesis. At least 3.
    pub num_samples: usize,
    /// Each sampled object point is matched to a random one of its `correspondence_randomness`
    /// most similar scene descriptors.
    pub correspondence_randomness: usize,
    /// Edge length ratio in `(0, 1]` used by the pre-rejection test.
    pub similarity_threshold: f32,
    /// Expected spacing between points, usually the voxel size of the downsampling.
    pub point_spacing: f32,
    /// Distance below which a transformed object point counts as an inlier. Defaults to
    /// `2.5 * point_spacing`.
    pub max_correspondence_distance: Option<f32>,
    /// Minimum distance between sampled object points. Defaults to `point_spacing`.
    pub min_sample_distance: Option<f32>,
    /// Hypotheses with a lower inlier fraction are not accepted as a result.
    pub min_inlier_fraction: f32,
    /// The search stops as soon as a hypothesis reaches this inlier fraction, and the best
    /// hypothesis is then refined over its inliers. Use a value above 1 to always run all
    /// the trials.
    pub early_stop_fraction: f32,
    /// Seed of the random generators. A random one is used when `None`.
    pub seed: Option<u64>,
}

impl Default for AlignParams {
    fn default() -> Self {
        Self {
            max_iterations: 50_000,
            num_samples: 3,
            correspondence_randomness: 5,
            similarity_threshold: 0.9,
            point_spacing: 0.005,
            max_correspondence_distance: None,
            min_sample_distance: None,
            min_inlier_fraction: 0.25,
            early_stop_fraction: 0.98,
            seed: None,
        }
    }
}

impl AlignParams {
    /// Sets the point spacing, the inlier distance follows it unless given explicitly.
    pub fn with_point_spacing(mut self, point_spacing: f32) -> Self {
        self.point_spacing = point_spacing;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn inlier_distance(&self) -> f32 {
        self.max_correspondence_distance
            .unwrap_or(2.5 * self.point_spacing)
    }

    pub fn sample_distance(&self) -> f32 {
        self.min_sample_distance.unwrap_or(self.point_spacing)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::invalid_parameter("max_iterations must be positive"));
        }
        if self.num_samples < 3 {
            return Err(Error::invalid_parameter(format!(
                "num_samples must be at least 3, got {}",
                self.num_samples
            )));
        }
        if self.correspondence_randomness == 0 {
            return Err(Error::invalid_parameter(
                "correspondence_randomness must be positive",
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(Error::invalid_parameter(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if !(self.point_spacing.is_finite() && self.point_spacing > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "point_spacing must be positive, got {}",
                self.point_spacing
            )));
        }
        let inlier_distance = self.inlier_distance();
        if !(inlier_distance.is_finite() && inlier_distance > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "max_correspondence_distance must be positive, got {inlier_distance}"
            )));
        }
        let sample_distance = self.sample_distance();
        if !(sample_distance.is_finite() && sample_distance >= 0.0) {
            return Err(Error::invalid_parameter(format!(
                "min_sample_distance must not be negative, got {sample_distance}"
            )));
        }
        if !(0.0..=1.0).contains(&self.min_inlier_fraction) {
            return Err(Error::invalid_parameter(format!(
                "min_inlier_fraction must be in [0, 1], got {}",
                self.min_inlier_fraction
            )));
        }
        if !(self.early_stop_fraction > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "early_stop_fraction must be positive, got {}",
                self.early_stop_fraction
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_derive_distances_from_spacing() {
        let params = AlignParams::default().with_point_spacing(0.02);
        assert!((params.inlier_distance() - 0.05).abs() < 1e-6);
        assert_eq!(params.sample_distance(), 0.02);

        let params = AlignParams {
            max_correspondence_distance: Some(0.1),
            ..params
        };
        assert_eq!(params.inlier_distance(), 0.1);
    }

    #[test]
    fn should_validate() {
        assert!(AlignParams::default().validate().is_ok());

        let invalid = [
            AlignParams {
                max_iterations: 0,
                ..Default::default()
            },
            AlignParams {
                num_samples: 2,
                ..Default::default()
            },
            AlignParams {
                correspondence_randomness: 0,
                ..Default::default()
            },
            AlignParams {
                similarity_threshold: 1.5,
                ..Default::default()
            },
            AlignParams {
                similarity_threshold: 0.0,
                ..Default::default()
            },
            AlignParams {
                point_spacing: -0.1,
                ..Default::default()
            },
            AlignParams {
                max_correspondence_distance: Some(0.0),
                ..Default::default()
            },
            AlignParams {
                min_inlier_fraction: 1.1,
                ..Default::default()
            },
        ];
        for params in invalid {
            assert!(
                matches!(params.validate(), Err(Error::InvalidParameter(_))),
                "{params:?}"
            );
        }
    }

    #[test]
    fn should_deserialize_partial_json() {
        let params: AlignParams =
            serde_json::from_str(r#"{"max_iterations": 100, "seed": 3}"#).unwrap();
        assert_eq!(params.max_iterations, 100);
        assert_eq!(params.seed, Some(3));
        assert_eq!(params.num_samples, 3);
    }
}
