mod point_clouds;
pub(crate) use point_clouds::{
    grid_points, sample_blob, sample_plane, sample_sphere, sample_terrain, unit_cube,
};
