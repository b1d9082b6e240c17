pub mod error;
pub use error::{Error, Result};

pub mod filter;
pub mod fpfh;
pub mod io;
pub mod kdtree;
pub mod normals;
pub mod pipeline;
pub mod pointcloud;
pub mod registration;
pub mod transform;
pub mod viewpoint;

#[cfg(test)]
mod unit_test;

pub mod metrics;
pub mod trig;
