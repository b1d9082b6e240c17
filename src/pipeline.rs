//! The scan registration sequence: outlier removal, downsampling, normals, descriptors
//! and global alignment.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::{find_statistical_inliers, voxel_downsample, StatisticalOutlierParams, VoxelGridParams};
use crate::fpfh::{compute_fpfh, FeatureCloud, FpfhParams};
use crate::normals::{estimate_normals, NormalEstimationParams, NormalOrientation};
use crate::pointcloud::PointCloud;
use crate::registration::{AlignParams, CancelToken, GlobalAligner, Registration};
use crate::viewpoint::Viewpoints;

/// Parameters of every stage. Stages set to `None` are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub outlier_removal: Option<StatisticalOutlierParams>,
    pub voxel_grid: Option<VoxelGridParams>,
    pub normals: NormalEstimationParams,
    pub fpfh: FpfhParams,
    pub align: AlignParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            outlier_removal: Some(StatisticalOutlierParams::default()),
            voxel_grid: Some(VoxelGridParams::default()),
            normals: NormalEstimationParams::default(),
            fpfh: FpfhParams::default(),
            align: AlignParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration scaled to a voxel size: descriptors use 5 voxels of radius and the
    /// aligner expects points one voxel apart.
    pub fn for_voxel_size(voxel_size: f32) -> Self {
        let default = Self::default();
        Self {
            voxel_grid: Some(VoxelGridParams::new(voxel_size)),
            fpfh: default.fpfh.with_radius(5.0 * voxel_size),
            align: default.align.with_point_spacing(voxel_size),
            ..default
        }
    }

    /// Loads a JSON configuration. Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// * `FileNotFound` if the file does not exist.
    /// * `Parse` if it is not a valid configuration.
    /// * `InvalidParameter` if some value is out of range.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| crate::io::open_error(path, err))?;
        let config: PipelineConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| Error::parse(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(params) = &self.outlier_removal {
            params.validate()?;
        }
        if let Some(params) = &self.voxel_grid {
            params.validate()?;
        }
        self.normals.neighborhood.validate()?;
        self.fpfh.validate()?;
        self.align.validate()
    }
}

/// A cloud ready for alignment.
#[derive(Debug, Clone)]
pub struct PreparedCloud {
    /// Filtered cloud with normals.
    pub cloud: PointCloud,
    /// One descriptor per point of `cloud`.
    pub features: FeatureCloud,
    /// Number of points whose normal could not be estimated.
    pub degenerate_normals: usize,
}

/// Filters a raw scan, estimates its normals and computes its descriptors.
///
/// With viewpoints, normals face the origin that acquired each point and are estimated
/// before the voxel grid, since the viewpoint ranges refer to the scan order. Without
/// them, normals are unoriented.
///
/// # Errors
///
/// * `InvalidParameter` for invalid configuration or viewpoints that do not cover the cloud.
pub fn prepare(
    cloud: PointCloud,
    config: &PipelineConfig,
    viewpoints: Option<&Viewpoints>,
) -> Result<PreparedCloud> {
    config.validate()?;
    if let Some(viewpoints) = viewpoints {
        viewpoints.validate_for(cloud.len())?;
    }

    let input_len = cloud.len();
    let mut cloud = cloud;
    let mut viewpoints = viewpoints.cloned();

    if let Some(params) = &config.outlier_removal {
        let keep = find_statistical_inliers(&cloud, params)?;
        if keep.len() < cloud.len() {
            viewpoints = viewpoints.map(|v| v.select(&keep));
            cloud = cloud.select(&keep);
        }
    }

    let report = match &viewpoints {
        Some(viewpoints) => {
            let report = estimate_normals(
                &mut cloud,
                &config.normals,
                NormalOrientation::TowardsViewpoints(viewpoints),
            )?;
            if let Some(params) = &config.voxel_grid {
                voxel_downsample(&mut cloud, params)?;
            }
            report
        }
        None => {
            if let Some(params) = &config.voxel_grid {
                voxel_downsample(&mut cloud, params)?;
            }
            estimate_normals(&mut cloud, &config.normals, NormalOrientation::Unoriented)?
        }
    };

    let features = compute_fpfh(&cloud, &config.fpfh)?;
    debug!(
        "Prepared cloud: {input_len} input points, {} kept, {} valid descriptors",
        cloud.len(),
        features.valid_count()
    );

    Ok(PreparedCloud {
        cloud,
        features,
        degenerate_normals: report.degenerate.len(),
    })
}

/// Aligns two prepared clouds.
///
/// # Returns
///
/// The transform that maps the object into the scene.
pub fn register(
    object: &PreparedCloud,
    scene: &PreparedCloud,
    config: &PipelineConfig,
) -> Result<Registration> {
    register_with_cancel(object, scene, config, CancelToken::new())
}

/// Same as [`register`], stopping early once `cancel` is set.
pub fn register_with_cancel(
    object: &PreparedCloud,
    scene: &PreparedCloud,
    config: &PipelineConfig,
    cancel: CancelToken,
) -> Result<Registration> {
    info!(
        "Aligning {} object points to {} scene points",
        object.cloud.len(),
        scene.cloud.len()
    );
    GlobalAligner::new(config.align.clone(), &scene.cloud, &scene.features)?
        .with_cancel_token(cancel)
        .align(&object.cloud, &object.features)
}
