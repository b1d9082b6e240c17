use nalgebra::Vector3;
use ndarray::{Array1, Axis};

use crate::error::{Error, Result};
use crate::transform::Transform;

/// Optional attributes carried by every point of a cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    /// RGB colors are present.
    pub colors: bool,
    /// Normals and curvatures are present.
    pub normals: bool,
}

impl Schema {
    pub fn xyz() -> Self {
        Self::default()
    }

    pub fn with_colors(mut self) -> Self {
        self.colors = true;
        self
    }

    pub fn with_normals(mut self) -> Self {
        self.normals = true;
        self
    }
}

/// A single point. Fields that are `None` are not part of the point's schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub position: Vector3<f32>,
    pub color: Option<Vector3<u8>>,
    pub normal: Option<Vector3<f32>>,
    pub curvature: Option<f32>,
}

impl Point {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: Vector3::new(x, y, z),
            color: None,
            normal: None,
            curvature: None,
        }
    }

    pub fn with_color(mut self, r: u8, g: u8, b: u8) -> Self {
        self.color = Some(Vector3::new(r, g, b));
        self
    }

    pub fn with_normal(mut self, normal: Vector3<f32>, curvature: f32) -> Self {
        self.normal = Some(normal);
        self.curvature = Some(curvature);
        self
    }

    /// A point is valid when its position has no NaN or infinite coordinate.
    pub fn is_valid(&self) -> bool {
        is_finite(&self.position)
    }

    pub fn schema(&self) -> Schema {
        Schema {
            colors: self.color.is_some(),
            normals: self.normal.is_some(),
        }
    }
}

pub(crate) fn is_finite(v: &Vector3<f32>) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Ordered set of points sharing a [`Schema`]. Stored as parallel arrays,
/// one per attribute.
#[derive(Clone, Debug)]
pub struct PointCloud {
    /// Positions.
    pub points: Array1<Vector3<f32>>,
    /// Per point RGB colors.
    pub colors: Option<Array1<Vector3<u8>>>,
    /// Per point unit normals. Degenerate neighborhoods have a zero normal.
    pub normals: Option<Array1<Vector3<f32>>>,
    /// Surface variation, paired with `normals`.
    pub curvatures: Option<Array1<f32>>,
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::from_positions(Vec::new())
    }
}

impl PointCloud {
    /// Creates a cloud with positions only.
    pub fn from_positions(points: Vec<Vector3<f32>>) -> Self {
        Self {
            points: Array1::from_vec(points),
            colors: None,
            normals: None,
            curvatures: None,
        }
    }

    /// Creates a cloud from points. All points must have the same schema.
    pub fn from_points(points: &[Point]) -> Result<Self> {
        let schema = points.first().map(Point::schema).unwrap_or_default();
        if let Some(index) = points.iter().position(|p| p.schema() != schema) {
            return Err(Error::invalid_parameter(format!(
                "point {index} has schema {:?}, but the cloud has {:?}",
                points[index].schema(),
                schema
            )));
        }

        let positions = points.iter().map(|p| p.position).collect();
        let mut cloud = Self::from_positions(positions);
        if schema.colors {
            cloud.colors = Some(points.iter().filter_map(|p| p.color).collect());
        }
        if schema.normals {
            cloud.normals = Some(points.iter().filter_map(|p| p.normal).collect());
            cloud.curvatures = Some(points.iter().map(|p| p.curvature.unwrap_or(0.0)).collect());
        }
        Ok(cloud)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn schema(&self) -> Schema {
        Schema {
            colors: self.colors.is_some(),
            normals: self.normals.is_some(),
        }
    }

    /// Returns the point at `index` with all the attributes of the schema.
    pub fn get(&self, index: usize) -> Point {
        Point {
            position: self.points[index],
            color: self.colors.as_ref().map(|colors| colors[index]),
            normal: self.normals.as_ref().map(|normals| normals[index]),
            curvature: self.curvatures.as_ref().map(|curvatures| curvatures[index]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Point> + '_ {
        (0..self.len()).map(|i| self.get(i))
    }

    /// Whether the position at `index` is finite.
    pub fn is_valid(&self, index: usize) -> bool {
        is_finite(&self.points[index])
    }

    /// Indices of the points with finite positions.
    pub fn valid_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|i| self.is_valid(*i)).collect()
    }

    /// Whether the point at `index` has a usable (non zero) normal.
    pub fn has_valid_normal(&self, index: usize) -> bool {
        self.normals
            .as_ref()
            .map(|normals| normals[index].norm_squared() > 0.5)
            .unwrap_or(false)
    }

    /// Attaches normals and curvatures, replacing any previous ones.
    pub fn set_normals(
        &mut self,
        normals: Array1<Vector3<f32>>,
        curvatures: Array1<f32>,
    ) -> Result<()> {
        if normals.len() != self.len() || curvatures.len() != self.len() {
            return Err(Error::invalid_parameter(format!(
                "expected {} normals and curvatures, got {} and {}",
                self.len(),
                normals.len(),
                curvatures.len()
            )));
        }
        self.normals = Some(normals);
        self.curvatures = Some(curvatures);
        Ok(())
    }

    /// New cloud with the points of `self` followed by the ones of `other`.
    ///
    /// # Errors
    ///
    /// * `InvalidParameter` if the clouds have different schemas.
    pub fn merge(&self, other: &PointCloud) -> Result<Self> {
        if self.schema() != other.schema() {
            return Err(Error::invalid_parameter(format!(
                "cannot merge a cloud with schema {:?} into one with schema {:?}",
                other.schema(),
                self.schema()
            )));
        }
        Ok(Self {
            points: self.points.iter().chain(other.points.iter()).copied().collect(),
            colors: concatenate(&self.colors, &other.colors),
            normals: concatenate(&self.normals, &other.normals),
            curvatures: concatenate(&self.curvatures, &other.curvatures),
        })
    }

    /// New cloud with the points at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            points: self.points.select(Axis(0), indices),
            colors: self.colors.as_ref().map(|c| c.select(Axis(0), indices)),
            normals: self.normals.as_ref().map(|n| n.select(Axis(0), indices)),
            curvatures: self.curvatures.as_ref().map(|c| c.select(Axis(0), indices)),
        }
    }
}

fn concatenate<T: Copy>(first: &Option<Array1<T>>, second: &Option<Array1<T>>) -> Option<Array1<T>> {
    match (first, second) {
        (Some(first), Some(second)) => Some(first.iter().chain(second.iter()).copied().collect()),
        _ => None,
    }
}

impl std::ops::Mul<&PointCloud> for &Transform {
    type Output = PointCloud;

    fn mul(self, rhs: &PointCloud) -> PointCloud {
        PointCloud {
            points: rhs.points.map(|p| self.transform_vector(p)),
            normals: rhs
                .normals
                .as_ref()
                .map(|normals| normals.map(|n| self.transform_normal(n))),
            colors: rhs.colors.clone(),
            curvatures: rhs.curvatures.clone(),
        }
    }
}
