use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use nalgebra::Vector3;
use ndarray::Array1;

use super::{open_error, write_error};
use crate::error::{Error, Result};
use crate::pointcloud::PointCloud;

const NORMAL_FIELDS: [&str; 4] = ["normal_x", "normal_y", "normal_z", "curvature"];

/// Encoding of the PCD body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcdEncoding {
    Ascii,
    /// Little endian values, one packed record per point.
    Binary,
}

#[derive(Debug)]
struct Field {
    name: String,
    kind: char,
    size: usize,
    /// Index of the first value in an ASCII row.
    column: usize,
    /// Byte offset of the first value in a binary record.
    byte_offset: usize,
}

/// Header fields that matter for reading.
struct Header {
    fields: Vec<Field>,
    columns: usize,
    record_size: usize,
    points: usize,
    encoding: PcdEncoding,
}

impl Header {
    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }
}

fn parse_list<T: std::str::FromStr>(key: &str, values: std::str::SplitWhitespace) -> Result<Vec<T>> {
    values
        .map(|v| v.parse::<T>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::parse(format!("invalid PCD {key} values")))
}

fn parse_header<'a, I>(lines: I) -> Result<Header>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names = None;
    let mut kinds: Vec<char> = Vec::new();
    let mut sizes: Vec<usize> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    let mut points = None;
    let mut width = None;
    let mut height = 1usize;

    let parse_usize = |key: &str, value: Option<&str>| -> Result<usize> {
        value
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| Error::parse(format!("invalid PCD {key} value")))
    };

    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or_default();
        match key {
            "FIELDS" => names = Some(parts.map(str::to_string).collect::<Vec<_>>()),
            "TYPE" => kinds = parts.filter_map(|t| t.chars().next()).collect(),
            "SIZE" => sizes = parse_list(key, parts)?,
            "COUNT" => counts = parse_list(key, parts)?,
            "WIDTH" => width = Some(parse_usize(key, parts.next())?),
            "HEIGHT" => height = parse_usize(key, parts.next())?,
            "POINTS" => points = Some(parse_usize(key, parts.next())?),
            "DATA" => {
                let encoding = match parts.next().unwrap_or_default() {
                    "ascii" => PcdEncoding::Ascii,
                    "binary" => PcdEncoding::Binary,
                    other => {
                        return Err(Error::parse(format!("unsupported PCD DATA format: {other}")))
                    }
                };
                let names = names.unwrap_or_else(|| vec!["x".into(), "y".into(), "z".into()]);
                let lengths_match = |values: usize| values == 0 || values == names.len();
                if !(lengths_match(counts.len()) && lengths_match(sizes.len()) && lengths_match(kinds.len())) {
                    return Err(Error::parse(
                        "PCD SIZE, TYPE, COUNT and FIELDS have different lengths",
                    ));
                }

                let mut fields = Vec::with_capacity(names.len());
                let mut columns = 0;
                let mut record_size = 0;
                for (i, name) in names.into_iter().enumerate() {
                    let count = counts.get(i).copied().unwrap_or(1);
                    let size = sizes.get(i).copied().unwrap_or(4);
                    fields.push(Field {
                        name,
                        kind: kinds.get(i).copied().unwrap_or('F'),
                        size,
                        column: columns,
                        byte_offset: record_size,
                    });
                    columns += count;
                    record_size += count * size;
                }
                let points = points
                    .or_else(|| width.map(|w| w * height))
                    .ok_or_else(|| Error::parse("PCD header without POINTS or WIDTH"))?;
                return Ok(Header {
                    fields,
                    columns,
                    record_size,
                    points,
                    encoding,
                });
            }
            // VERSION, VIEWPOINT.
            _ => (),
        }
    }

    Err(Error::parse("PCD file missing DATA line"))
}

/// Splits the file in its header lines and the offset where the body starts.
fn split_header(raw: &[u8]) -> Result<(Vec<&str>, usize)> {
    let mut lines = Vec::new();
    let mut offset = 0;
    while offset < raw.len() {
        let end = raw[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(raw.len(), |p| offset + p + 1);
        let line = std::str::from_utf8(&raw[offset..end])
            .map_err(|_| Error::parse("PCD header is not valid text"))?;
        offset = end;
        lines.push(line);
        if line.trim_start().starts_with("DATA") {
            break;
        }
    }
    Ok((lines, offset))
}

/// Values of one point, in either encoding.
trait Record {
    fn float(&self, field: &Field) -> Result<f32>;
    /// The 32 bits of a packed color.
    fn packed(&self, field: &Field) -> Result<u32>;
}

struct AsciiRecord<'a> {
    values: Vec<&'a str>,
    row: usize,
}

impl<'a> AsciiRecord<'a> {
    fn value(&self, field: &Field) -> &str {
        self.values[field.column]
    }

    fn error(&self, err: impl std::fmt::Display) -> Error {
        Error::parse(format!("row {}: {err}", self.row))
    }
}

impl<'a> Record for AsciiRecord<'a> {
    fn float(&self, field: &Field) -> Result<f32> {
        self.value(field).parse::<f32>().map_err(|err| self.error(err))
    }

    fn packed(&self, field: &Field) -> Result<u32> {
        match field.kind {
            'U' | 'I' => self
                .value(field)
                .parse::<i64>()
                .map(|v| v as u32)
                .map_err(|err| self.error(err)),
            _ => Ok(self.float(field)?.to_bits()),
        }
    }
}

struct BinaryRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> BinaryRecord<'a> {
    fn slice<const N: usize>(&self, field: &Field) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[field.byte_offset..field.byte_offset + N]);
        out
    }
}

impl<'a> Record for BinaryRecord<'a> {
    fn float(&self, field: &Field) -> Result<f32> {
        let value = match (field.kind, field.size) {
            ('F', 4) => f32::from_le_bytes(self.slice(field)),
            ('F', 8) => f64::from_le_bytes(self.slice(field)) as f32,
            ('U', 1) => self.bytes[field.byte_offset] as f32,
            ('U', 2) => u16::from_le_bytes(self.slice(field)) as f32,
            ('U', 4) => u32::from_le_bytes(self.slice(field)) as f32,
            ('I', 1) => self.bytes[field.byte_offset] as i8 as f32,
            ('I', 2) => i16::from_le_bytes(self.slice(field)) as f32,
            ('I', 4) => i32::from_le_bytes(self.slice(field)) as f32,
            (kind, size) => {
                return Err(Error::parse(format!(
                    "unsupported PCD type {kind}{size} for field {}",
                    field.name
                )))
            }
        };
        Ok(value)
    }

    fn packed(&self, field: &Field) -> Result<u32> {
        if field.size != 4 {
            return Err(Error::parse(format!(
                "packed color {} must have 4 bytes, has {}",
                field.name, field.size
            )));
        }
        Ok(u32::from_le_bytes(self.slice(field)))
    }
}

/// Fields of the header that become cloud attributes.
struct Layout<'h> {
    xyz: [&'h Field; 3],
    color: Option<&'h Field>,
    normal: Option<Vec<&'h Field>>,
}

impl<'h> Layout<'h> {
    fn new(header: &'h Header) -> Result<Self> {
        let required = |name: &str| {
            header
                .field(name)
                .ok_or_else(|| Error::parse(format!("PCD without field {name}")))
        };
        Ok(Self {
            xyz: [required("x")?, required("y")?, required("z")?],
            color: header.field("rgb").or_else(|| header.field("rgba")),
            normal: NORMAL_FIELDS
                .iter()
                .map(|name| header.field(name))
                .collect::<Option<Vec<&Field>>>(),
        })
    }
}

#[derive(Default)]
struct CloudBuilder {
    positions: Vec<Vector3<f32>>,
    colors: Vec<Vector3<u8>>,
    normals: Vec<Vector3<f32>>,
    curvatures: Vec<f32>,
}

impl CloudBuilder {
    fn push(&mut self, layout: &Layout, record: &impl Record) -> Result<()> {
        let [x, y, z] = layout.xyz;
        self.positions
            .push(Vector3::new(record.float(x)?, record.float(y)?, record.float(z)?));
        if let Some(color) = layout.color {
            let packed = record.packed(color)?;
            self.colors.push(Vector3::new(
                ((packed >> 16) & 0xff) as u8,
                ((packed >> 8) & 0xff) as u8,
                (packed & 0xff) as u8,
            ));
        }
        if let Some(normal) = &layout.normal {
            self.normals.push(Vector3::new(
                record.float(normal[0])?,
                record.float(normal[1])?,
                record.float(normal[2])?,
            ));
            self.curvatures.push(record.float(normal[3])?);
        }
        Ok(())
    }

    fn build(self, layout: &Layout) -> PointCloud {
        let mut cloud = PointCloud::from_positions(self.positions);
        if layout.color.is_some() {
            cloud.colors = Some(Array1::from_vec(self.colors));
        }
        if layout.normal.is_some() {
            cloud.normals = Some(Array1::from_vec(self.normals));
            cloud.curvatures = Some(Array1::from_vec(self.curvatures));
        }
        cloud
    }
}

fn read_ascii_body(header: &Header, layout: &Layout, body: &[u8]) -> Result<CloudBuilder> {
    let text = std::str::from_utf8(body).map_err(|_| Error::parse("ASCII PCD body is not valid text"))?;
    let mut builder = CloudBuilder::default();
    for (row, line) in text.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() != header.columns {
            return Err(Error::parse(format!(
                "row {row} has {} values, expected {}",
                values.len(),
                header.columns
            )));
        }
        builder.push(layout, &AsciiRecord { values, row })?;
    }
    Ok(builder)
}

fn read_binary_body(header: &Header, layout: &Layout, body: &[u8]) -> Result<CloudBuilder> {
    let expected = header.points * header.record_size;
    if body.len() < expected {
        return Err(Error::parse(format!(
            "binary body has {} bytes, expected {} ({} points of {} bytes)",
            body.len(),
            expected,
            header.points,
            header.record_size
        )));
    }
    let mut builder = CloudBuilder::default();
    if header.record_size == 0 {
        return Ok(builder);
    }
    for bytes in body[..expected].chunks_exact(header.record_size) {
        builder.push(layout, &BinaryRecord { bytes })?;
    }
    Ok(builder)
}

/// Reads an ASCII or binary PCD file. Recognizes the fields `x y z`, a packed `rgb` or
/// `rgba` color and `normal_x normal_y normal_z curvature`.
///
/// # Errors
///
/// * `FileNotFound` if the file does not exist.
/// * `Parse` for compressed files and malformed headers or values.
pub fn read_pcd<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    let raw = fs::read(path).map_err(|err| open_error(path, err))?;
    let with_path = |err: Error| match err {
        Error::Parse(msg) => Error::parse(format!("{}: {msg}", path.display())),
        other => other,
    };

    let (lines, body_offset) = split_header(&raw).map_err(with_path)?;
    let header = parse_header(lines).map_err(with_path)?;
    let layout = Layout::new(&header).map_err(with_path)?;
    let body = &raw[body_offset..];

    let builder = match header.encoding {
        PcdEncoding::Ascii => read_ascii_body(&header, &layout, body),
        PcdEncoding::Binary => read_binary_body(&header, &layout, body),
    }
    .map_err(with_path)?;

    if builder.positions.len() != header.points {
        return Err(Error::parse(format!(
            "{}: header declares {} points, found {}",
            path.display(),
            header.points,
            builder.positions.len()
        )));
    }
    Ok(builder.build(&layout))
}

fn pack_color(color: &Vector3<u8>) -> u32 {
    (color.x as u32) << 16 | (color.y as u32) << 8 | color.z as u32
}

fn write_header(out: &mut String, fields: &[&str], len: usize, encoding: PcdEncoding) {
    out.push_str("# .PCD v0.7 - Point Cloud Data file format\n");
    out.push_str("VERSION 0.7\n");
    let _ = writeln!(out, "FIELDS {}", fields.join(" "));
    let _ = writeln!(out, "SIZE {}", vec!["4"; fields.len()].join(" "));
    let _ = writeln!(out, "TYPE {}", vec!["F"; fields.len()].join(" "));
    let _ = writeln!(out, "COUNT {}", vec!["1"; fields.len()].join(" "));
    let _ = writeln!(out, "WIDTH {len}");
    out.push_str("HEIGHT 1\n");
    out.push_str("VIEWPOINT 0 0 0 1 0 0 0\n");
    let _ = writeln!(out, "POINTS {len}");
    out.push_str(match encoding {
        PcdEncoding::Ascii => "DATA ascii\n",
        PcdEncoding::Binary => "DATA binary\n",
    });
}

/// Writes a PCD file with all the attributes of the cloud. Colors are stored as a packed
/// `rgb` float.
///
/// # Errors
///
/// * `Write` if the file can't be written.
pub fn write_pcd_encoded<P: AsRef<Path>>(
    path: P,
    cloud: &PointCloud,
    encoding: PcdEncoding,
) -> Result<()> {
    let path = path.as_ref();
    let mut fields = vec!["x", "y", "z"];
    if cloud.colors.is_some() {
        fields.push("rgb");
    }
    if cloud.normals.is_some() {
        fields.extend(NORMAL_FIELDS);
    }

    let mut header = String::new();
    write_header(&mut header, &fields, cloud.len(), encoding);

    let bytes = match encoding {
        PcdEncoding::Ascii => {
            let mut out = header;
            for point in cloud.iter() {
                let p = point.position;
                let _ = write!(out, "{} {} {}", p.x, p.y, p.z);
                if let Some(c) = point.color {
                    let _ = write!(out, " {:e}", f32::from_bits(pack_color(&c)));
                }
                if let Some(n) = point.normal {
                    let _ = write!(
                        out,
                        " {} {} {} {}",
                        n.x,
                        n.y,
                        n.z,
                        point.curvature.unwrap_or(0.0)
                    );
                }
                out.push('\n');
            }
            out.into_bytes()
        }
        PcdEncoding::Binary => {
            let mut out = header.into_bytes();
            out.reserve(cloud.len() * fields.len() * 4);
            for point in cloud.iter() {
                for v in point.position.iter() {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                if let Some(c) = point.color {
                    out.extend_from_slice(&pack_color(&c).to_le_bytes());
                }
                if let Some(n) = point.normal {
                    for v in n.iter() {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                    out.extend_from_slice(&point.curvature.unwrap_or(0.0).to_le_bytes());
                }
            }
            out
        }
    };

    fs::write(path, bytes).map_err(|err| write_error(path, err))
}

/// Writes an ASCII PCD file. See [`write_pcd_encoded`].
pub fn write_pcd<P: AsRef<Path>>(path: P, cloud: &PointCloud) -> Result<()> {
    write_pcd_encoded(path, cloud, PcdEncoding::Ascii)
}

/// Writes a binary PCD file. See [`write_pcd_encoded`].
pub fn write_pcd_binary<P: AsRef<Path>>(path: P, cloud: &PointCloud) -> Result<()> {
    write_pcd_encoded(path, cloud, PcdEncoding::Binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointcloud::Point;

    fn colored_cloud() -> PointCloud {
        PointCloud::from_points(&[
            Point::new(0.5, 1.0, -2.0)
                .with_color(255, 128, 1)
                .with_normal(Vector3::new(0.0, 0.6, 0.8), 0.05),
            Point::new(1e-3, 2.5, 3.0)
                .with_color(0, 0, 0)
                .with_normal(Vector3::y(), 0.0),
            Point::new(f32::MAX, -7.25, 1e-9)
                .with_color(1, 2, 255)
                .with_normal(Vector3::x(), 0.33),
        ])
        .unwrap()
    }

    #[test]
    fn should_write_the_same_as_read() {
        let cloud = colored_cloud();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        write_pcd(&path, &cloud).unwrap();

        let loaded = read_pcd(&path).unwrap();
        assert_eq!(loaded.schema(), cloud.schema());
        for (expected, actual) in cloud.iter().zip(loaded.iter()) {
            assert_eq!(expected, actual);
        }
    }

    #[test]
    fn should_read_binary_files() {
        let cloud = colored_cloud();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.pcd");
        write_pcd_binary(&path, &cloud).unwrap();

        let raw = fs::read(&path).unwrap();
        let header_len = raw.len() - cloud.len() * 8 * 4;
        assert!(std::str::from_utf8(&raw[..header_len])
            .unwrap()
            .ends_with("DATA binary\n"));

        let loaded = read_pcd(&path).unwrap();
        assert_eq!(loaded.len(), cloud.len());
        assert_eq!(loaded.schema(), cloud.schema());
        for (expected, actual) in cloud.iter().zip(loaded.iter()) {
            assert_eq!(expected, actual);
        }
    }

    #[test]
    fn should_read_binary_scanner_layouts() {
        // x y z as doubles, an unsigned packed rgba and an ignored intensity byte.
        let mut raw = b"VERSION 0.7\nFIELDS x y z rgba intensity\nSIZE 8 8 8 4 1\n\
            TYPE F F F U U\nCOUNT 1 1 1 1 1\nWIDTH 2\nHEIGHT 1\nPOINTS 2\nDATA binary\n"
            .to_vec();
        for (position, rgba) in [([1.0f64, 2.0, 3.0], 0xff00ff00u32), ([-4.0, 0.5, 0.0], 0x00102030)] {
            for v in position {
                raw.extend_from_slice(&v.to_le_bytes());
            }
            raw.extend_from_slice(&rgba.to_le_bytes());
            raw.push(7);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pcd");
        fs::write(&path, &raw).unwrap();

        let cloud = read_pcd(&path).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.points[1], Vector3::new(-4.0, 0.5, 0.0));
        assert_eq!(cloud.get(0).color, Some(Vector3::new(0, 255, 0)));
        assert_eq!(cloud.get(1).color, Some(Vector3::new(0x10, 0x20, 0x30)));
        assert!(cloud.normals.is_none());
    }

    #[test]
    fn should_read_scanner_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pcd");
        fs::write(
            &path,
            "# .PCD v0.7\nVERSION 0.7\nFIELDS x y z rgba\nSIZE 4 4 4 4\nTYPE F F F U\n\
             COUNT 1 1 1 1\nWIDTH 2\nHEIGHT 1\nVIEWPOINT 0 0 0 1 0 0 0\nPOINTS 2\nDATA ascii\n\
             1 2 3 4278255360\nnan nan nan 0\n",
        )
        .unwrap();

        let cloud = read_pcd(&path).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.get(0).color, Some(Vector3::new(0, 255, 0)));
        assert!(!cloud.is_valid(1));
        assert!(cloud.normals.is_none());
    }

    #[test]
    fn should_fail_on_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pcd");

        fs::write(&path, "FIELDS x y z\nPOINTS 2\nDATA ascii\n1 2 3\n").unwrap();
        assert!(matches!(read_pcd(&path), Err(Error::Parse(_))));

        fs::write(&path, "FIELDS x y z\nPOINTS 1\nDATA ascii\n1 2\n").unwrap();
        assert!(matches!(read_pcd(&path), Err(Error::Parse(_))));

        // Truncated body.
        fs::write(&path, "FIELDS x y z\nPOINTS 1\nDATA binary\n\x00\x00\x00\x00").unwrap();
        assert!(matches!(read_pcd(&path), Err(Error::Parse(_))));

        fs::write(&path, "FIELDS x y z\nPOINTS 1\nDATA binary_compressed\n").unwrap();
        assert!(matches!(read_pcd(&path), Err(Error::Parse(_))));

        fs::write(&path, "FIELDS x y z\nSIZE 4 4\nPOINTS 1\nDATA ascii\n1 2 3\n").unwrap();
        assert!(matches!(read_pcd(&path), Err(Error::Parse(_))));

        fs::write(&path, "FIELDS a b c\nPOINTS 1\nDATA ascii\n1 2 3\n").unwrap();
        assert!(matches!(read_pcd(&path), Err(Error::Parse(_))));

        assert!(matches!(
            read_pcd(dir.path().join("missing.pcd")),
            Err(Error::FileNotFound(_))
        ));
    }
}
