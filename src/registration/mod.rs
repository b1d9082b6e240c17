//! Global registration of an object cloud into a scene cloud.
mod aligner;
mod params;
mod prerejection;
mod rigid;

pub use aligner::{CancelToken, GlobalAligner, Registration, TrialStats};
pub use params::AlignParams;
pub use prerejection::{is_degenerate_sample, EdgeLengthRejector};
pub use rigid::estimate_rigid_transform;
