use nalgebra::SVector;
use ordered_float::OrderedFloat;
use serde_derive::{Deserialize, Serialize};

use std::collections::BinaryHeap;

use crate::error::{Error, Result};

/// Maximum number of points stored in a leaf.
const LEAF_SIZE: usize = 16;

enum KdNode<const DIM: usize> {
    Leaf {
        points: Vec<SVector<f32, DIM>>,
        indices: Vec<usize>,
    },
    NonLeaf {
        axis: usize,
        middle_value: f32,
        left: Box<KdNode<DIM>>,
        right: Box<KdNode<DIM>>,
    },
}

/// How a neighborhood is defined for a query.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchParams {
    /// The `k` nearest points.
    Knn(usize),
    /// All points within the radius.
    Radius(f32),
    /// The nearest points within the radius, at most `max_neighbors` of them.
    Hybrid { radius: f32, max_neighbors: usize },
}

impl SearchParams {
    /// Fails with `InvalidParameter` on non positive counts or radii.
    pub fn validate(&self) -> Result<()> {
        let radius_ok = |r: f32| r.is_finite() && r > 0.0;
        match *self {
            SearchParams::Knn(0) => Err(Error::invalid_parameter(
                "the number of neighbors must be positive",
            )),
            SearchParams::Radius(r) if !radius_ok(r) => Err(Error::invalid_parameter(format!(
                "the search radius must be positive, got {r}"
            ))),
            SearchParams::Hybrid { radius, .. } if !radius_ok(radius) => {
                Err(Error::invalid_parameter(format!(
                    "the search radius must be positive, got {radius}"
                )))
            }
            SearchParams::Hybrid {
                max_neighbors: 0, ..
            } => Err(Error::invalid_parameter(
                "the number of neighbors must be positive",
            )),
            _ => Ok(()),
        }
    }
}

/// KdTree for fast nearest neighbor search over points of dimension `DIM`.
///
/// Queries return pairs of `(index, squared distance)` sorted by increasing distance,
/// where `index` is the position of the point in the sequence given to [`KdTree::new`].
/// Points with NaN or infinite coordinates are not indexed.
pub struct KdTree<const DIM: usize> {
    root: Option<Box<KdNode<DIM>>>,
    len: usize,
}

/// Tree over 3D positions.
pub type R3dTree = KdTree<3>;

fn squared_distance<const DIM: usize>(a: &SVector<f32, DIM>, b: &SVector<f32, DIM>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl<const DIM: usize> KdTree<DIM> {
    /// Create a new KdTree from a sequence of points.
    ///
    /// # Arguments
    ///
    /// * points - Points to index. Their enumeration order gives the returned indices.
    pub fn new<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a SVector<f32, DIM>>,
    {
        // Recursive creation.
        fn rec<const DIM: usize>(items: &mut [(usize, SVector<f32, DIM>)]) -> KdNode<DIM> {
            let make_leaf = |items: &[(usize, SVector<f32, DIM>)]| KdNode::Leaf {
                points: items.iter().map(|(_, p)| *p).collect(),
                indices: items.iter().map(|(i, _)| *i).collect(),
            };

            // Stop recursion if this should be a leaf node.
            if items.len() <= LEAF_SIZE {
                return make_leaf(items);
            }

            // Split along the axis with the largest spread.
            let mut lower = [f32::MAX; DIM];
            let mut upper = [f32::MIN; DIM];
            for (_, point) in items.iter() {
                for axis in 0..DIM {
                    lower[axis] = lower[axis].min(point[axis]);
                    upper[axis] = upper[axis].max(point[axis]);
                }
            }
            let (axis, spread) = (0..DIM)
                .map(|axis| (axis, upper[axis] - lower[axis]))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or((0, 0.0));

            // All points are duplicates.
            if spread <= 0.0 {
                return make_leaf(items);
            }

            let mid = items.len() / 2;
            items.select_nth_unstable_by(mid, |a, b| a.1[axis].total_cmp(&b.1[axis]));
            let middle_value = items[mid].1[axis];
            let (left_items, right_items) = items.split_at_mut(mid);
            KdNode::NonLeaf {
                axis,
                middle_value,
                left: Box::new(rec(left_items)),
                right: Box::new(rec(right_items)),
            }
        }

        let mut items: Vec<(usize, SVector<f32, DIM>)> = points
            .into_iter()
            .enumerate()
            .filter(|(_, point)| point.iter().all(|v| v.is_finite()))
            .map(|(index, point)| (index, *point))
            .collect();

        let len = items.len();
        KdTree {
            root: if items.is_empty() {
                None
            } else {
                Some(Box::new(rec(&mut items)))
            },
            len,
        }
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Find the nearest neighbor to a query point.
    ///
    /// # Returns
    ///
    /// The index of the nearest neighbor and its squared distance, or `None` if the tree is empty.
    pub fn nearest(&self, query: &SVector<f32, DIM>) -> Option<(usize, f32)> {
        self.knn(query, 1).into_iter().next()
    }

    /// Find the `k` nearest neighbors. Returns fewer if the tree has less than `k` points.
    pub fn knn(&self, query: &SVector<f32, DIM>, k: usize) -> Vec<(usize, f32)> {
        self.bounded_knn(query, k, f32::INFINITY)
    }

    /// Find all points within `radius` of the query.
    pub fn radius(&self, query: &SVector<f32, DIM>, radius: f32) -> Vec<(usize, f32)> {
        let mut found = Vec::new();
        if let Some(root) = &self.root {
            radius_rec(root, query, radius * radius, &mut found);
        }
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        found
    }

    /// Find the `max_neighbors` nearest points that are within `radius`.
    pub fn hybrid(
        &self,
        query: &SVector<f32, DIM>,
        radius: f32,
        max_neighbors: usize,
    ) -> Vec<(usize, f32)> {
        self.bounded_knn(query, max_neighbors, radius * radius)
    }

    /// Query dispatching on the neighborhood definition.
    pub fn search(&self, query: &SVector<f32, DIM>, params: &SearchParams) -> Vec<(usize, f32)> {
        match *params {
            SearchParams::Knn(k) => self.knn(query, k),
            SearchParams::Radius(radius) => self.radius(query, radius),
            SearchParams::Hybrid {
                radius,
                max_neighbors,
            } => self.hybrid(query, radius, max_neighbors),
        }
    }

    fn bounded_knn(
        &self,
        query: &SVector<f32, DIM>,
        k: usize,
        max_sqr_distance: f32,
    ) -> Vec<(usize, f32)> {
        let root = match &self.root {
            Some(root) if k > 0 => root,
            _ => return Vec::new(),
        };

        let mut heap = BinaryHeap::with_capacity(k + 1);
        knn_rec(root, query, k, max_sqr_distance, &mut heap);

        let mut found: Vec<(usize, f32)> = heap
            .into_iter()
            .map(|(dist, index)| (index, dist.into_inner()))
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        found
    }
}

fn knn_rec<const DIM: usize>(
    node: &KdNode<DIM>,
    query: &SVector<f32, DIM>,
    k: usize,
    max_sqr_distance: f32,
    heap: &mut BinaryHeap<(OrderedFloat<f32>, usize)>,
) {
    let worst = |heap: &BinaryHeap<(OrderedFloat<f32>, usize)>| {
        if heap.len() < k {
            max_sqr_distance
        } else {
            heap.peek().map(|(d, _)| d.into_inner()).unwrap_or(max_sqr_distance)
        }
    };

    match node {
        KdNode::Leaf { points, indices } => {
            for (point, index) in points.iter().zip(indices) {
                let dist = squared_distance(point, query);
                if dist > max_sqr_distance {
                    continue;
                }
                if heap.len() < k {
                    heap.push((OrderedFloat(dist), *index));
                } else if let Some((top, _)) = heap.peek() {
                    if dist < top.into_inner() {
                        heap.pop();
                        heap.push((OrderedFloat(dist), *index));
                    }
                }
            }
        }
        KdNode::NonLeaf {
            axis,
            middle_value,
            left,
            right,
        } => {
            let diff = query[*axis] - middle_value;
            let (near, far) = if diff < 0.0 {
                (left, right)
            } else {
                (right, left)
            };
            knn_rec(near, query, k, max_sqr_distance, heap);
            if diff * diff <= worst(heap) {
                knn_rec(far, query, k, max_sqr_distance, heap);
            }
        }
    }
}

fn radius_rec<const DIM: usize>(
    node: &KdNode<DIM>,
    query: &SVector<f32, DIM>,
    sqr_radius: f32,
    found: &mut Vec<(usize, f32)>,
) {
    match node {
        KdNode::Leaf { points, indices } => {
            found.extend(
                points
                    .iter()
                    .zip(indices)
                    .map(|(point, index)| (*index, squared_distance(point, query)))
                    .filter(|(_, dist)| *dist <= sqr_radius),
            );
        }
        KdNode::NonLeaf {
            axis,
            middle_value,
            left,
            right,
        } => {
            let diff = query[*axis] - middle_value;
            let (near, far) = if diff < 0.0 {
                (left, right)
            } else {
                (right, left)
            };
            radius_rec(near, query, sqr_radius, found);
            if diff * diff <= sqr_radius {
                radius_rec(far, query, sqr_radius, found);
            }
        }
    }
}
