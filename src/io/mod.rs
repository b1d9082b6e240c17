//! Point cloud files. The format is chosen by the file extension.
use std::path::Path;

use crate::error::{Error, Result};
use crate::pointcloud::PointCloud;

mod pcd;
pub use pcd::{read_pcd, write_pcd, write_pcd_binary, write_pcd_encoded, PcdEncoding};
mod ply;
pub use ply::{read_ply, write_ply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ply,
    Pcd,
}

fn format_of(path: &Path) -> Option<Format> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "ply" => Some(Format::Ply),
        "pcd" => Some(Format::Pcd),
        _ => None,
    }
}

/// Loads a `.ply` or `.pcd` file.
///
/// # Errors
///
/// * `FileNotFound` if the path does not exist.
/// * `Parse` for unknown extensions and malformed files.
pub fn read_cloud<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    match format_of(path) {
        Some(Format::Ply) => read_ply(path),
        Some(Format::Pcd) => read_pcd(path),
        None => Err(Error::parse(format!(
            "unsupported point cloud file: {}",
            path.display()
        ))),
    }
}

/// Saves a `.ply` or `.pcd` file with all the attributes of the cloud.
///
/// # Errors
///
/// * `Write` for unknown extensions or if the file can't be written.
pub fn write_cloud<P: AsRef<Path>>(path: P, cloud: &PointCloud) -> Result<()> {
    let path = path.as_ref();
    match format_of(path) {
        Some(Format::Ply) => write_ply(path, cloud),
        Some(Format::Pcd) => write_pcd(path, cloud),
        None => Err(Error::write(format!(
            "unsupported point cloud file: {}",
            path.display()
        ))),
    }
}

pub(crate) fn open_error(path: &Path, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::FileNotFound(path.to_path_buf())
    } else {
        Error::Io(err)
    }
}

pub(crate) fn write_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::write(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_dispatch_on_extension() {
        assert_eq!(format_of(Path::new("a/b.PLY")), Some(Format::Ply));
        assert_eq!(format_of(Path::new("scan.pcd")), Some(Format::Pcd));
        assert_eq!(format_of(Path::new("scan.obj")), None);
        assert_eq!(format_of(Path::new("scan")), None);
    }

    #[test]
    fn should_report_missing_and_unknown_files() {
        assert!(matches!(
            read_cloud("/nonexistent/scan.ply"),
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(read_cloud("scan.xyz"), Err(Error::Parse(_))));
        assert!(matches!(
            write_cloud("scan.xyz", &PointCloud::default()),
            Err(Error::Write(_))
        ));
    }
}
