use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::Vector3;
use ndarray::Array1;
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;
use ply_rs::{parser, ply};

use super::{open_error, write_error};
use crate::error::{Error, Result};
use crate::pointcloud::PointCloud;

/// We know what data we want to read, hence we load it straight into structs.
#[derive(Debug)]
struct Vertex {
    point: [f32; 3],
    normal: [f32; 3],
    curvature: f32,
    color: [u8; 3],
}

fn as_f32(property: &ply::Property) -> Option<f32> {
    match *property {
        ply::Property::Float(v) => Some(v),
        ply::Property::Double(v) => Some(v as f32),
        _ => None,
    }
}

impl ply::PropertyAccess for Vertex {
    fn new() -> Self {
        Vertex {
            point: [0f32; 3],
            normal: [0f32; 3],
            curvature: 0.0,
            color: [0u8; 3],
        }
    }

    fn set_property(&mut self, key: String, property: ply::Property) {
        let slot = match key.as_ref() {
            "x" => &mut self.point[0],
            "y" => &mut self.point[1],
            "z" => &mut self.point[2],
            "nx" | "normal_x" => &mut self.normal[0],
            "ny" | "normal_y" => &mut self.normal[1],
            "nz" | "normal_z" => &mut self.normal[2],
            "curvature" => &mut self.curvature,
            "red" | "green" | "blue" => {
                if let ply::Property::UChar(v) = property {
                    let channel = match key.as_ref() {
                        "red" => 0,
                        "green" => 1,
                        _ => 2,
                    };
                    self.color[channel] = v;
                }
                return;
            }
            _ => return,
        };
        if let Some(value) = as_f32(&property) {
            *slot = value;
        }
    }
}

fn has_all(element: &ElementDef, keys: &[&str]) -> bool {
    keys.iter().all(|k| element.properties.contains_key(*k))
}

/// Reads the vertices of a PLY file. Normals, curvatures and colors are loaded when the
/// file has them. Other elements, like faces, are skipped.
///
/// # Errors
///
/// * `FileNotFound` if the file does not exist.
/// * `Parse` if the file is malformed or has no vertex positions.
pub fn read_ply<P>(filepath: P) -> Result<PointCloud>
where
    P: AsRef<Path>,
{
    let path = filepath.as_ref();
    let fptr = File::open(path).map_err(|err| open_error(path, err))?;
    let mut f = BufReader::new(fptr);

    let vertex_parser = parser::Parser::<Vertex>::new();
    let header = vertex_parser
        .read_header(&mut f)
        .map_err(|err| Error::parse(format!("{}: {err}", path.display())))?;

    let mut cloud = None;
    for (_, element) in &header.elements {
        if element.name != "vertex" {
            parser::Parser::<DefaultElement>::new()
                .read_payload_for_element(&mut f, element, &header)
                .map_err(|err| Error::parse(format!("{}: {err}", path.display())))?;
            continue;
        }

        if !has_all(element, &["x", "y", "z"]) {
            return Err(Error::parse(format!(
                "{}: vertices without x, y and z",
                path.display()
            )));
        }

        let vertices = vertex_parser
            .read_payload_for_element(&mut f, element, &header)
            .map_err(|err| Error::parse(format!("{}: {err}", path.display())))?;

        let mut points = PointCloud::from_positions(
            vertices.iter().map(|v| Vector3::from(v.point)).collect(),
        );
        if has_all(element, &["nx", "ny", "nz"]) || has_all(element, &["normal_x", "normal_y", "normal_z"]) {
            points.normals = Some(vertices.iter().map(|v| Vector3::from(v.normal)).collect());
            points.curvatures = Some(vertices.iter().map(|v| v.curvature).collect());
        }
        if has_all(element, &["red", "green", "blue"]) {
            points.colors = Some(vertices.iter().map(|v| Vector3::from(v.color)).collect());
        }
        cloud = Some(points);
    }

    cloud.ok_or_else(|| Error::parse(format!("{}: no vertex element", path.display())))
}

fn add_scalars(element: &mut ElementDef, keys: &[&str], scalar: ScalarType) {
    for key in keys {
        element.properties.add(PropertyDef::new(
            key.to_string(),
            PropertyType::Scalar(scalar.clone()),
        ));
    }
}

/// Writes the cloud as an ASCII PLY file with all its attributes.
///
/// # Errors
///
/// * `Write` if the file can't be created or written.
pub fn write_ply<P>(filepath: P, cloud: &PointCloud) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = filepath.as_ref();
    let mut ply = {
        let mut ply = Ply::<DefaultElement>::new();
        let mut vertex_element = ElementDef::new("vertex".to_string());
        add_scalars(&mut vertex_element, &["x", "y", "z"], ScalarType::Float);

        let mut vertex_array: Vec<DefaultElement> = cloud
            .points
            .iter()
            .map(|point| {
                let mut elem = DefaultElement::new();
                elem.insert("x".to_string(), Property::Float(point[0]));
                elem.insert("y".to_string(), Property::Float(point[1]));
                elem.insert("z".to_string(), Property::Float(point[2]));
                elem
            })
            .collect();

        if let Some(normals) = &cloud.normals {
            add_scalars(&mut vertex_element, &["nx", "ny", "nz"], ScalarType::Float);
            for (elem, normal) in vertex_array.iter_mut().zip(normals.iter()) {
                elem.insert("nx".to_string(), Property::Float(normal[0]));
                elem.insert("ny".to_string(), Property::Float(normal[1]));
                elem.insert("nz".to_string(), Property::Float(normal[2]));
            }

            let zeros;
            let curvatures = match &cloud.curvatures {
                Some(curvatures) => curvatures,
                None => {
                    zeros = Array1::zeros(cloud.len());
                    &zeros
                }
            };
            add_scalars(&mut vertex_element, &["curvature"], ScalarType::Float);
            for (elem, curvature) in vertex_array.iter_mut().zip(curvatures.iter()) {
                elem.insert("curvature".to_string(), Property::Float(*curvature));
            }
        }

        if let Some(colors) = &cloud.colors {
            add_scalars(&mut vertex_element, &["red", "green", "blue"], ScalarType::UChar);
            for (elem, color) in vertex_array.iter_mut().zip(colors.iter()) {
                elem.insert("red".to_string(), Property::UChar(color[0]));
                elem.insert("green".to_string(), Property::UChar(color[1]));
                elem.insert("blue".to_string(), Property::UChar(color[2]));
            }
        }

        ply.header.elements.add(vertex_element);
        ply.payload.insert("vertex".to_string(), vertex_array);
        ply.make_consistent()
            .map_err(|err| write_error(path, format!("{err:?}")))?;
        ply
    };

    ply.header.encoding = Encoding::Ascii;

    let mut buf = BufWriter::new(File::create(path).map_err(|err| write_error(path, err))?);
    Writer::new()
        .write_ply(&mut buf, &mut ply)
        .map_err(|err| write_error(path, err))?;

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::pointcloud::Point;

    #[test]
    fn should_write_the_same_as_read() {
        let cloud = PointCloud::from_points(&[
            Point::new(0.0, 1.0, 2.0)
                .with_color(255, 0, 10)
                .with_normal(Vector3::z(), 0.25),
            Point::new(-1.5, 0.5, 3.25)
                .with_color(1, 2, 3)
                .with_normal(Vector3::x(), 0.0),
        ])
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        write_ply(&path, &cloud).unwrap();

        let loaded = read_ply(&path).unwrap();
        assert_eq!(loaded.schema(), cloud.schema());
        for (expected, actual) in cloud.iter().zip(loaded.iter()) {
            assert_eq!(expected, actual);
        }
    }

    #[test]
    fn should_read_meshes_and_doubles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.ply");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            "ply\nformat ascii 1.0\nelement vertex 3\nproperty double x\nproperty double y\n\
             property double z\nelement face 1\nproperty list uchar int vertex_indices\n\
             end_header\n0 0 0\n1 0 0\n0 1 0.5\n3 0 1 2\n"
        )
        .unwrap();
        drop(file);

        let cloud = read_ply(&path).unwrap();
        assert_eq!(cloud.len(), 3);
        assert_eq!(cloud.get(2).position, Vector3::new(0.0, 1.0, 0.5));
        assert!(cloud.normals.is_none() && cloud.colors.is_none());
    }

    #[test]
    fn should_fail_on_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ply");
        std::fs::write(&path, "not a ply file\n").unwrap();
        assert!(matches!(read_ply(&path), Err(Error::Parse(_))));

        assert!(matches!(
            read_ply(dir.path().join("missing.ply")),
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            write_ply(dir.path().join("no/such/dir.ply"), &PointCloud::default()),
            Err(Error::Write(_))
        ));
    }
}
