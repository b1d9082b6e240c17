//! In-place noise, density and crop filters. All return the number of removed points.
//! Point indices are not preserved across a filter.
mod statistical_outlier;
pub use statistical_outlier::{
    find_statistical_inliers, remove_statistical_outliers, StatisticalOutlierParams,
};

mod voxel_grid;
pub use voxel_grid::{voxel_downsample, VoxelGridParams, DEFAULT_VOXEL_SIZE};

mod crop;
pub use crop::{crop, find_cropped, CropAxis, CropParams};
