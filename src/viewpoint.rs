use nalgebra::Vector3;

use crate::error::{Error, Result};
use crate::transform::Transform;

/// Acquisition metadata of a cloud: the sensor origins and which range of points
/// each origin produced.
///
/// `steps[i]` is the exclusive end index of the points acquired from `origins[i]`;
/// the range of origin `i` starts where the one of `i - 1` ends. Steps must be
/// non-decreasing and the last one must match the cloud length.
#[derive(Clone, Debug, PartialEq)]
pub struct Viewpoints {
    origins: Vec<Vector3<f32>>,
    steps: Vec<usize>,
}

impl Viewpoints {
    /// Creates the metadata, checking that steps and origins are parallel and ordered.
    pub fn new(origins: Vec<Vector3<f32>>, steps: Vec<usize>) -> Result<Self> {
        if origins.is_empty() {
            return Err(Error::invalid_parameter("at least one viewpoint is required"));
        }
        if origins.len() != steps.len() {
            return Err(Error::invalid_parameter(format!(
                "{} viewpoints but {} steps",
                origins.len(),
                steps.len()
            )));
        }
        if let Some(pos) = steps.windows(2).position(|w| w[1] < w[0]) {
            return Err(Error::invalid_parameter(format!(
                "step {} ({}) is smaller than step {} ({})",
                pos + 1,
                steps[pos + 1],
                pos,
                steps[pos]
            )));
        }
        if origins.iter().flatten().any(|c| !c.is_finite()) {
            return Err(Error::invalid_parameter("viewpoint origins must be finite"));
        }
        Ok(Self { origins, steps })
    }

    /// A single origin that acquired `len` points.
    pub fn single(origin: Vector3<f32>, len: usize) -> Self {
        Self {
            origins: vec![origin],
            steps: vec![len],
        }
    }

    /// Checks that the steps cover exactly `len` points.
    pub fn validate_for(&self, len: usize) -> Result<()> {
        match self.steps.last() {
            Some(&last) if last == len => Ok(()),
            last => Err(Error::invalid_parameter(format!(
                "viewpoint steps cover {} points, the cloud has {len}",
                last.copied().unwrap_or(0)
            ))),
        }
    }

    pub fn origins(&self) -> &[Vector3<f32>] {
        &self.origins
    }

    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Origin that acquired the point at `index`.
    pub fn origin_of(&self, index: usize) -> Option<&Vector3<f32>> {
        let slot = self.steps.partition_point(|&end| end <= index);
        self.origins.get(slot)
    }

    /// Metadata of the cloud that keeps only the points at `kept`, which must be sorted
    /// in increasing order. Origins that lose all their points keep an empty range.
    pub fn select(&self, kept: &[usize]) -> Self {
        Self {
            origins: self.origins.clone(),
            steps: self
                .steps
                .iter()
                .map(|end| kept.partition_point(|index| index < end))
                .collect(),
        }
    }

    /// Moves the origins with the cloud.
    pub fn transformed(&self, transform: &Transform) -> Self {
        Self {
            origins: self
                .origins
                .iter()
                .map(|origin| transform.transform_vector(origin))
                .collect(),
            steps: self.steps.clone(),
        }
    }
}
