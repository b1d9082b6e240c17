use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use nalgebra::Vector3;
use rand::rngs::SmallRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use rayon::prelude::*;

use super::params::AlignParams;
use super::prerejection::{is_degenerate_sample, EdgeLengthRejector};
use super::rigid::estimate_rigid_transform;
use crate::error::{Error, Result};
use crate::fpfh::{FeatureCloud, FPFH_LENGTH};
use crate::kdtree::{KdTree, R3dTree};
use crate::pointcloud::PointCloud;
use crate::transform::Transform;

/// Trials run sequentially by a worker before the stop flags are looked at again by the scheduler.
const TRIALS_PER_CHUNK: usize = 256;

/// Upper bound of re-estimations of the best hypothesis over its inliers.
const MAX_REFINEMENTS: usize = 50;

/// Cooperative cancellation of a running alignment. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters of what happened to the sample consensus trials.
///
/// Only the trials that could influence the result are counted: once a chunk of trials
/// reaches the early stop fraction, the chunks after it are discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrialStats {
    /// Trials actually run.
    pub trials: usize,
    /// Samples discarded because the object points were too close or collinear, or
    /// because no rigid transform could be fitted.
    pub degenerate_samples: usize,
    /// Samples discarded by the edge length pre-rejection.
    pub rejected_samples: usize,
    /// Hypotheses that were scored against the whole object.
    pub fitted_hypotheses: usize,
}

impl std::ops::Add for TrialStats {
    type Output = TrialStats;

    fn add(self, rhs: TrialStats) -> TrialStats {
        TrialStats {
            trials: self.trials + rhs.trials,
            degenerate_samples: self.degenerate_samples + rhs.degenerate_samples,
            rejected_samples: self.rejected_samples + rhs.rejected_samples,
            fitted_hypotheses: self.fitted_hypotheses + rhs.fitted_hypotheses,
        }
    }
}

/// Result of a global alignment.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Maps object coordinates into scene coordinates.
    pub transform: Transform,
    /// Inliers over the number of valid object points.
    pub inlier_fraction: f32,
    /// Object point indices that land within the inlier distance of a scene point.
    pub inliers: Vec<usize>,
    /// Mean squared distance of the inliers to their nearest scene point.
    pub mean_squared_error: f32,
    pub stats: TrialStats,
    /// Whether the search was interrupted by a [`CancelToken`].
    pub cancelled: bool,
}

impl Registration {
    /// The object moved into the scene frame.
    pub fn aligned(&self, object: &PointCloud) -> PointCloud {
        &self.transform * object
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    transform: Transform,
    inlier_count: usize,
    squared_error: f64,
}

impl Hypothesis {
    fn is_better_than(&self, other: &Hypothesis) -> bool {
        self.inlier_count > other.inlier_count
            || (self.inlier_count == other.inlier_count && self.squared_error < other.squared_error)
    }
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    best: Option<Hypothesis>,
    stats: TrialStats,
    /// A hypothesis of this chunk reached the early stop fraction.
    converged: bool,
}

impl ChunkOutcome {
    /// Keeps `self` on ties, so folding in chunk order gives the earliest best hypothesis.
    fn merge(self, other: ChunkOutcome) -> ChunkOutcome {
        let best = match (self.best, other.best) {
            (Some(a), Some(b)) => {
                if b.is_better_than(&a) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        };
        ChunkOutcome {
            best,
            stats: self.stats + other.stats,
            converged: self.converged || other.converged,
        }
    }
}

/// Sample consensus alignment with pre-rejection: finds the rigid transform that best
/// places an object cloud into a scene cloud using descriptor correspondences, without
/// an initial guess.
///
/// Each trial samples object points, matches each one to a random scene point among its most
/// similar descriptors, discards samples whose pairwise distances disagree, fits a rigid
/// transform and counts how many object points land near the scene. The winning hypothesis
/// is then re-fitted over its inliers until they stop changing.
///
/// Trials are split in chunks seeded from their index. A chunk only stops early because of
/// its own convergence or of an earlier chunk's, and chunks after the first converged one
/// are ignored, so a seeded search gives the same result on any number of threads.
pub struct GlobalAligner<'scene> {
    /// Parameters of the search.
    pub params: AlignParams,
    scene: &'scene PointCloud,
    scene_tree: R3dTree,
    feature_tree: KdTree<FPFH_LENGTH>,
    // Scene index of each point in the `feature_tree`.
    feature_owners: Vec<usize>,
    cancel: CancelToken,
}

impl<'scene> GlobalAligner<'scene> {
    /// Indexes the scene and its descriptors.
    ///
    /// # Arguments
    ///
    /// * params - Search parameters.
    /// * scene - Cloud the object is aligned to.
    /// * scene_features - One descriptor per scene point.
    ///
    /// # Errors
    ///
    /// * `InvalidParameter` if the parameters are invalid or the descriptors do not match the scene.
    pub fn new(
        params: AlignParams,
        scene: &'scene PointCloud,
        scene_features: &FeatureCloud,
    ) -> Result<Self> {
        params.validate()?;
        check_features(scene, scene_features, "scene")?;

        let feature_owners: Vec<usize> = (0..scene.len())
            .filter(|i| scene_features.valid[*i] && scene.is_valid(*i))
            .collect();
        let feature_tree = KdTree::new(
            feature_owners
                .iter()
                .map(|i| &scene_features.descriptors[*i]),
        );

        Ok(Self {
            params,
            scene,
            scene_tree: R3dTree::new(scene.points.iter()),
            feature_tree,
            feature_owners,
            cancel: CancelToken::new(),
        })
    }

    /// Uses `token` to stop a running [`GlobalAligner::align`] from another thread.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Aligns the object to the scene.
    ///
    /// # Arguments
    ///
    /// * object - Cloud to be moved.
    /// * object_features - One descriptor per object point.
    ///
    /// # Returns
    ///
    /// The best hypothesis found. When cancelled, the best hypothesis found so far.
    ///
    /// # Errors
    ///
    /// * `InvalidParameter` if the descriptors do not match the object.
    /// * `RegistrationFailed` if there are not enough usable points, no sample passes the
    ///   pre-rejection or the best inlier fraction is below `min_inlier_fraction`.
    pub fn align(&self, object: &PointCloud, object_features: &FeatureCloud) -> Result<Registration> {
        self.params.validate()?;
        check_features(object, object_features, "object")?;

        let num_samples = self.params.num_samples;
        let object_valid = object.valid_indices();
        let candidates: Vec<usize> = object_valid
            .iter()
            .copied()
            .filter(|i| object_features.valid[*i])
            .collect();

        if candidates.len() < num_samples || self.feature_owners.len() < num_samples {
            return Err(Error::registration_failed(format!(
                "not enough points with descriptors: {} in the object and {} in the scene, {} needed",
                candidates.len(),
                self.feature_owners.len(),
                num_samples
            )));
        }

        let similar = self.similar_scene_points(&candidates, object_features);
        let base_seed = self.params.seed.unwrap_or_else(rand::random);
        let first_converged = AtomicUsize::new(usize::MAX);

        let scorer = ConsensusScorer {
            object,
            object_valid: &object_valid,
            scene: self.scene,
            scene_tree: &self.scene_tree,
            sqr_inlier_distance: self.params.inlier_distance().powi(2),
        };
        let context = TrialContext {
            params: &self.params,
            scorer: &scorer,
            candidates: &candidates,
            similar: &similar,
            rejector: EdgeLengthRejector::new(self.params.similarity_threshold),
            first_converged: &first_converged,
            cancel: &self.cancel,
        };

        let num_chunks = (self.params.max_iterations + TRIALS_PER_CHUNK - 1) / TRIALS_PER_CHUNK;
        let outcomes: Vec<ChunkOutcome> = (0..num_chunks)
            .into_par_iter()
            .map(|chunk| {
                let start = chunk * TRIALS_PER_CHUNK;
                let trials = TRIALS_PER_CHUNK.min(self.params.max_iterations - start);
                let mut rng = SmallRng::seed_from_u64(
                    base_seed.wrapping_add((chunk as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
                );
                context.run(chunk, trials, &mut rng)
            })
            .collect();

        // Later chunks may have been cut at any trial by the converged one.
        let contributing = outcomes
            .iter()
            .position(|outcome| outcome.converged)
            .map_or(num_chunks, |chunk| chunk + 1);
        let outcome = outcomes
            .into_iter()
            .take(contributing)
            .fold(ChunkOutcome::default(), ChunkOutcome::merge);

        let cancelled = self.cancel.is_cancelled();
        let stats = outcome.stats;
        debug!(
            "Sample consensus: {} trials, {} degenerate, {} rejected, {} fitted",
            stats.trials, stats.degenerate_samples, stats.rejected_samples, stats.fitted_hypotheses
        );

        let best = match outcome.best {
            Some(best) => scorer.refine(best),
            None if cancelled => {
                return Err(Error::registration_failed(format!(
                    "cancelled after {} trials without a hypothesis",
                    stats.trials
                )))
            }
            None => {
                return Err(Error::registration_failed(format!(
                    "no sample passed the pre-rejection in {} trials",
                    stats.trials
                )))
            }
        };

        let (inliers, squared_error) = scorer.inliers(&best.transform);
        let inlier_fraction = inliers.len() as f32 / object_valid.len() as f32;
        if inlier_fraction < self.params.min_inlier_fraction {
            return Err(Error::registration_failed(format!(
                "best inlier fraction {inlier_fraction:.3} is below {}",
                self.params.min_inlier_fraction
            )));
        }

        let mean_squared_error = if inliers.is_empty() {
            0.0
        } else {
            (squared_error / inliers.len() as f64) as f32
        };
        info!(
            "Registered with inlier fraction {inlier_fraction:.3} and mean squared error {mean_squared_error:e}"
        );

        Ok(Registration {
            transform: best.transform,
            inlier_fraction,
            inliers,
            mean_squared_error,
            stats,
            cancelled,
        })
    }

    /// For each candidate object point, the scene points with the most similar descriptors.
    fn similar_scene_points(
        &self,
        candidates: &[usize],
        object_features: &FeatureCloud,
    ) -> Vec<Vec<usize>> {
        candidates
            .par_iter()
            .map(|i| {
                self.feature_tree
                    .knn(
                        &object_features.descriptors[*i],
                        self.params.correspondence_randomness,
                    )
                    .into_iter()
                    .map(|(tree_index, _)| self.feature_owners[tree_index])
                    .collect()
            })
            .collect()
    }
}

fn check_features(cloud: &PointCloud, features: &FeatureCloud, name: &str) -> Result<()> {
    if cloud.len() != features.len() || features.valid.len() != features.len() {
        return Err(Error::invalid_parameter(format!(
            "the {name} has {} points but {} descriptors",
            cloud.len(),
            features.len()
        )));
    }
    Ok(())
}

/// Measures how well a transform places the object on the scene.
struct ConsensusScorer<'a> {
    object: &'a PointCloud,
    object_valid: &'a [usize],
    scene: &'a PointCloud,
    scene_tree: &'a R3dTree,
    sqr_inlier_distance: f32,
}

impl<'a> ConsensusScorer<'a> {
    fn score(&self, transform: Transform) -> Hypothesis {
        let mut inlier_count = 0;
        let mut squared_error = 0.0f64;
        for i in self.object_valid {
            let point = transform.transform_vector(&self.object.points[*i]);
            if let Some((_, sqr_dist)) = self.scene_tree.nearest(&point) {
                if sqr_dist <= self.sqr_inlier_distance {
                    inlier_count += 1;
                    squared_error += sqr_dist as f64;
                }
            }
        }
        Hypothesis {
            transform,
            inlier_count,
            squared_error,
        }
    }

    /// Pairs of object inlier and its nearest scene point, with their squared distance.
    fn correspondences(&self, transform: &Transform) -> Vec<(usize, usize, f32)> {
        self.object_valid
            .iter()
            .filter_map(|i| {
                let point = transform.transform_vector(&self.object.points[*i]);
                self.scene_tree
                    .nearest(&point)
                    .filter(|(_, sqr_dist)| *sqr_dist <= self.sqr_inlier_distance)
                    .map(|(scene_index, sqr_dist)| (*i, scene_index, sqr_dist))
            })
            .collect()
    }

    fn inliers(&self, transform: &Transform) -> (Vec<usize>, f64) {
        let pairs = self.correspondences(transform);
        let squared_error = pairs.iter().map(|(_, _, d)| *d as f64).sum();
        (pairs.into_iter().map(|(i, _, _)| i).collect(), squared_error)
    }

    /// Re-fits the hypothesis over its inlier pairs until the pairs stop changing or the fit
    /// gets worse.
    fn refine(&self, hypothesis: Hypothesis) -> Hypothesis {
        let mut best = hypothesis;
        let mut pairs = self.correspondences(&best.transform);
        for iteration in 0..MAX_REFINEMENTS {
            let (object_points, scene_points): (Vec<Vector3<f32>>, Vec<Vector3<f32>>) = pairs
                .iter()
                .map(|(i, j, _)| (self.object.points[*i], self.scene.points[*j]))
                .unzip();
            let candidate = match estimate_rigid_transform(&object_points, &scene_points) {
                Some(transform) => self.score(transform),
                None => break,
            };
            if best.is_better_than(&candidate) {
                break;
            }

            let next_pairs = self.correspondences(&candidate.transform);
            best = candidate;
            if next_pairs.iter().map(|(i, j, _)| (i, j)).eq(pairs.iter().map(|(i, j, _)| (i, j))) {
                debug!("Refinement converged after {} iterations", iteration + 1);
                break;
            }
            pairs = next_pairs;
        }
        best
    }
}

/// Shared state of the trials.
struct TrialContext<'a> {
    params: &'a AlignParams,
    scorer: &'a ConsensusScorer<'a>,
    candidates: &'a [usize],
    similar: &'a [Vec<usize>],
    rejector: EdgeLengthRejector,
    // Lowest index of a chunk that reached the early stop fraction.
    first_converged: &'a AtomicUsize,
    cancel: &'a CancelToken,
}

impl<'a> TrialContext<'a> {
    fn run(&self, chunk: usize, trials: usize, rng: &mut SmallRng) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        let num_samples = self.params.num_samples;
        let min_distance = self.params.sample_distance();
        let num_valid = self.scorer.object_valid.len() as f32;
        let mut object_sample: Vec<Vector3<f32>> = Vec::with_capacity(num_samples);
        let mut scene_sample: Vec<Vector3<f32>> = Vec::with_capacity(num_samples);

        for _ in 0..trials {
            if self.first_converged.load(Ordering::Relaxed) < chunk || self.cancel.is_cancelled() {
                break;
            }
            outcome.stats.trials += 1;

            let sample = index::sample(rng, self.candidates.len(), num_samples);
            object_sample.clear();
            object_sample.extend(
                sample
                    .iter()
                    .map(|c| self.scorer.object.points[self.candidates[c]]),
            );
            if is_degenerate_sample(&object_sample, min_distance) {
                outcome.stats.degenerate_samples += 1;
                continue;
            }

            scene_sample.clear();
            for c in sample.iter() {
                if let Some(scene_index) = self.similar[c].choose(rng) {
                    scene_sample.push(self.scorer.scene.points[*scene_index]);
                }
            }
            if !self.rejector.is_consistent(&object_sample, &scene_sample) {
                outcome.stats.rejected_samples += 1;
                continue;
            }

            let transform = match estimate_rigid_transform(&object_sample, &scene_sample) {
                Some(transform) => transform,
                None => {
                    outcome.stats.degenerate_samples += 1;
                    continue;
                }
            };

            outcome.stats.fitted_hypotheses += 1;
            let hypothesis = self.scorer.score(transform);
            let reached_stop =
                hypothesis.inlier_count as f32 / num_valid >= self.params.early_stop_fraction;

            let is_best = outcome
                .best
                .as_ref()
                .map_or(true, |best| hypothesis.is_better_than(best));
            if is_best {
                outcome.best = Some(hypothesis);
            }

            if reached_stop {
                self.first_converged.fetch_min(chunk, Ordering::Relaxed);
                outcome.converged = true;
                break;
            }
        }

        outcome
    }
}
