//! Mesh file loading and saving.
//!
//! Supports the triangulated formats scans are commonly exported to: STL
//! (binary and ASCII), OBJ, and PLY. Format detection is by extension.
//! Volumetric inputs are a separate concern and are rejected as
//! unsupported here.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use nalgebra::Point3;
use tracing::info;

use crate::error::{CompareError, CompareResult};
use crate::types::Mesh;

/// Supported mesh file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    /// STL (stereolithography), binary or ASCII.
    Stl,
    /// Wavefront OBJ.
    Obj,
    /// PLY (Stanford polygon format).
    Ply,
}

impl MeshFormat {
    /// Detect format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .and_then(|ext| match ext.as_str() {
                "stl" => Some(MeshFormat::Stl),
                "obj" => Some(MeshFormat::Obj),
                "ply" => Some(MeshFormat::Ply),
                _ => None,
            })
    }
}

/// Load a mesh from file, auto-detecting format from the extension.
///
/// The returned mesh satisfies the structural invariants (finite
/// coordinates, in-range face indices) or the load fails.
pub fn load_mesh(path: impl AsRef<Path>) -> CompareResult<Mesh> {
    let path = path.as_ref();
    let format = MeshFormat::from_path(path).ok_or_else(|| CompareError::UnsupportedFormat {
        extension: path.extension().and_then(|e| e.to_str()).map(String::from),
    })?;

    info!("loading mesh from {:?} (format: {:?})", path, format);

    let mesh = match format {
        MeshFormat::Stl => load_stl(path)?,
        MeshFormat::Obj => load_obj(path)?,
        MeshFormat::Ply => load_ply(path)?,
    };

    mesh.validate()?;
    if mesh.is_empty() {
        return Err(CompareError::invalid_mesh(format!(
            "{} contains no usable geometry",
            path.display()
        )));
    }

    info!(
        "loaded {} vertices, {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    );
    Ok(mesh)
}

/// Save a mesh to file, auto-detecting format from the extension.
pub fn save_mesh(mesh: &Mesh, path: impl AsRef<Path>) -> CompareResult<()> {
    let path = path.as_ref();
    let format = MeshFormat::from_path(path).ok_or_else(|| CompareError::UnsupportedFormat {
        extension: path.extension().and_then(|e| e.to_str()).map(String::from),
    })?;

    info!("saving mesh to {:?} (format: {:?})", path, format);

    match format {
        MeshFormat::Stl => save_stl(mesh, path),
        MeshFormat::Obj => save_obj(mesh, path),
        MeshFormat::Ply => save_ply(mesh, path),
    }
}

// ============================================================================
// STL
// ============================================================================

fn load_stl(path: &Path) -> CompareResult<Mesh> {
    let mut file = File::open(path).map_err(|e| CompareError::io_read(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| CompareError::io_read(path, e))?;

    if looks_like_ascii_stl(&bytes) {
        load_stl_ascii(path, &bytes)
    } else {
        load_stl_binary(path, &bytes)
    }
}

fn looks_like_ascii_stl(bytes: &[u8]) -> bool {
    // A binary STL can also start with "solid"; require a facet keyword in
    // the body before treating it as text.
    let head = &bytes[..bytes.len().min(512)];
    head.starts_with(b"solid")
        && std::str::from_utf8(head)
            .map(|s| s.contains("facet"))
            .unwrap_or(false)
}

/// Triangles in STL carry no shared indices; vertices are welded on their
/// exact bit pattern while loading.
struct VertexWelder {
    lookup: HashMap<[u64; 3], u32>,
    vertices: Vec<Point3<f64>>,
}

impl VertexWelder {
    fn new() -> Self {
        Self {
            lookup: HashMap::new(),
            vertices: Vec::new(),
        }
    }

    fn index_of(&mut self, p: Point3<f64>) -> u32 {
        let key = [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()];
        *self.lookup.entry(key).or_insert_with(|| {
            self.vertices.push(p);
            (self.vertices.len() - 1) as u32
        })
    }
}

fn load_stl_binary(path: &Path, bytes: &[u8]) -> CompareResult<Mesh> {
    if bytes.len() < 84 {
        return Err(CompareError::parse(path, "binary STL shorter than header"));
    }

    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = 84 + count * 50;
    if bytes.len() < expected {
        return Err(CompareError::parse(
            path,
            format!(
                "binary STL truncated: header promises {} triangles but file holds {} bytes",
                count,
                bytes.len()
            ),
        ));
    }

    let mut welder = VertexWelder::new();
    let mut faces = Vec::with_capacity(count);

    for t in 0..count {
        let base = 84 + t * 50;
        let mut indices = [0u32; 3];
        for (vi, index) in indices.iter_mut().enumerate() {
            // Skip the 12-byte normal; vertices follow.
            let off = base + 12 + vi * 12;
            let x = f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as f64;
            let y = f32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap()) as f64;
            let z = f32::from_le_bytes(bytes[off + 8..off + 12].try_into().unwrap()) as f64;
            *index = welder.index_of(Point3::new(x, y, z));
        }
        faces.push(indices);
    }

    Ok(Mesh {
        vertices: welder.vertices,
        faces,
    })
}

fn load_stl_ascii(path: &Path, bytes: &[u8]) -> CompareResult<Mesh> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CompareError::parse(path, "ASCII STL is not valid UTF-8"))?;

    let mut welder = VertexWelder::new();
    let mut faces = Vec::new();
    let mut pending: Vec<u32> = Vec::with_capacity(3);

    for (line_num, line) in text.lines().enumerate() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("vertex") {
            let mut coords = rest.split_whitespace();
            let mut parse = |name| {
                coords
                    .next()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| {
                        CompareError::parse(
                            path,
                            format!("bad {} coordinate on line {}", name, line_num + 1),
                        )
                    })
            };
            let x = parse("x")?;
            let y = parse("y")?;
            let z = parse("z")?;
            pending.push(welder.index_of(Point3::new(x, y, z)));

            if pending.len() == 3 {
                faces.push([pending[0], pending[1], pending[2]]);
                pending.clear();
            }
        } else if line.starts_with("endloop") && !pending.is_empty() {
            return Err(CompareError::parse(
                path,
                format!("facet with {} vertices near line {}", pending.len(), line_num + 1),
            ));
        }
    }

    Ok(Mesh {
        vertices: welder.vertices,
        faces,
    })
}

fn save_stl(mesh: &Mesh, path: &Path) -> CompareResult<()> {
    let file = File::create(path).map_err(|e| CompareError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    let wr = |e| CompareError::io_write(path, e);

    writer.write_all(&[0u8; 80]).map_err(wr)?;
    writer
        .write_all(&(mesh.face_count() as u32).to_le_bytes())
        .map_err(wr)?;

    for tri in mesh.triangles() {
        let normal = tri.normal_unnormalized();
        let n = if normal.norm() > 0.0 {
            normal.normalize()
        } else {
            normal
        };
        for value in [n.x, n.y, n.z] {
            writer.write_all(&(value as f32).to_le_bytes()).map_err(wr)?;
        }
        for v in [tri.v0, tri.v1, tri.v2] {
            for value in [v.x, v.y, v.z] {
                writer.write_all(&(value as f32).to_le_bytes()).map_err(wr)?;
            }
        }
        writer.write_all(&[0u8; 2]).map_err(wr)?;
    }

    Ok(())
}

// ============================================================================
// OBJ
// ============================================================================

fn load_obj(path: &Path) -> CompareResult<Mesh> {
    let file = File::open(path).map_err(|e| CompareError::io_read(path, e))?;
    let reader = BufReader::new(file);

    let mut mesh = Mesh::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CompareError::io_read(path, e))?;
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("v ") {
            let coords: Vec<f64> = rest
                .split_whitespace()
                .take(3)
                .filter_map(|s| s.parse().ok())
                .collect();
            if coords.len() != 3 {
                return Err(CompareError::parse(
                    path,
                    format!("malformed vertex on line {}", line_num + 1),
                ));
            }
            mesh.vertices
                .push(Point3::new(coords[0], coords[1], coords[2]));
        } else if let Some(rest) = line.strip_prefix("f ") {
            let indices: Vec<u32> = rest
                .split_whitespace()
                .map(|token| parse_obj_index(token, mesh.vertices.len()))
                .collect::<Result<_, _>>()
                .map_err(|msg| {
                    CompareError::parse(path, format!("{} on line {}", msg, line_num + 1))
                })?;
            if indices.len() < 3 {
                return Err(CompareError::parse(
                    path,
                    format!("face with fewer than 3 vertices on line {}", line_num + 1),
                ));
            }
            // Fan-triangulate polygons.
            for i in 1..indices.len() - 1 {
                mesh.faces.push([indices[0], indices[i], indices[i + 1]]);
            }
        }
    }

    Ok(mesh)
}

/// OBJ face tokens look like `7`, `7/1`, `7//3`, or `7/1/3`; indices are
/// 1-based and may be negative (relative to the current vertex count).
fn parse_obj_index(token: &str, vertex_count: usize) -> Result<u32, String> {
    let first = token.split('/').next().unwrap_or("");
    let raw: i64 = first
        .parse()
        .map_err(|_| format!("malformed face index {:?}", token))?;

    let resolved = if raw > 0 {
        raw - 1
    } else if raw < 0 {
        vertex_count as i64 + raw
    } else {
        return Err("face index 0 is not valid in OBJ".to_string());
    };

    if resolved < 0 || resolved >= vertex_count as i64 {
        return Err(format!("face index {} out of range", raw));
    }
    Ok(resolved as u32)
}

fn save_obj(mesh: &Mesh, path: &Path) -> CompareResult<()> {
    let file = File::create(path).map_err(|e| CompareError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    let wr = |e| CompareError::io_write(path, e);

    for v in &mesh.vertices {
        writeln!(writer, "v {} {} {}", v.x, v.y, v.z).map_err(wr)?;
    }
    for [a, b, c] in &mesh.faces {
        writeln!(writer, "f {} {} {}", a + 1, b + 1, c + 1).map_err(wr)?;
    }

    Ok(())
}

// ============================================================================
// PLY
// ============================================================================

fn load_ply(path: &Path) -> CompareResult<Mesh> {
    use ply_rs::parser::Parser;
    use ply_rs::ply::Property;

    let file = File::open(path).map_err(|e| CompareError::io_read(path, e))?;
    let mut reader = BufReader::new(file);

    let parser = Parser::<ply_rs::ply::DefaultElement>::new();
    let ply = parser
        .read_ply(&mut reader)
        .map_err(|e| CompareError::parse(path, format!("PLY parse error: {:?}", e)))?;

    let mut mesh = Mesh::new();

    if let Some(vertices) = ply.payload.get("vertex") {
        mesh.vertices.reserve(vertices.len());
        for element in vertices {
            let x = ply_float(element.get("x"))
                .ok_or_else(|| CompareError::parse(path, "vertex missing x property"))?;
            let y = ply_float(element.get("y"))
                .ok_or_else(|| CompareError::parse(path, "vertex missing y property"))?;
            let z = ply_float(element.get("z"))
                .ok_or_else(|| CompareError::parse(path, "vertex missing z property"))?;
            mesh.vertices.push(Point3::new(x, y, z));
        }
    }

    if let Some(faces) = ply.payload.get("face") {
        mesh.faces.reserve(faces.len());
        for element in faces {
            let prop = element
                .get("vertex_indices")
                .or_else(|| element.get("vertex_index"))
                .ok_or_else(|| CompareError::parse(path, "face missing vertex index list"))?;

            let indices: Vec<u32> = match prop {
                Property::ListInt(list) => list.iter().map(|&i| i as u32).collect(),
                Property::ListUInt(list) => list.clone(),
                Property::ListUShort(list) => list.iter().map(|&i| i as u32).collect(),
                Property::ListUChar(list) => list.iter().map(|&i| i as u32).collect(),
                _ => {
                    return Err(CompareError::parse(
                        path,
                        "unsupported face index list type",
                    ));
                }
            };
            if indices.len() < 3 {
                continue;
            }
            for i in 1..indices.len() - 1 {
                mesh.faces.push([indices[0], indices[i], indices[i + 1]]);
            }
        }
    }

    Ok(mesh)
}

fn ply_float(prop: Option<&ply_rs::ply::Property>) -> Option<f64> {
    use ply_rs::ply::Property;
    match prop {
        Some(Property::Float(v)) => Some(*v as f64),
        Some(Property::Double(v)) => Some(*v),
        Some(Property::Int(v)) => Some(*v as f64),
        Some(Property::UInt(v)) => Some(*v as f64),
        Some(Property::Short(v)) => Some(*v as f64),
        Some(Property::UShort(v)) => Some(*v as f64),
        Some(Property::Char(v)) => Some(*v as f64),
        Some(Property::UChar(v)) => Some(*v as f64),
        _ => None,
    }
}

fn save_ply(mesh: &Mesh, path: &Path) -> CompareResult<()> {
    let file = File::create(path).map_err(|e| CompareError::io_write(path, e))?;
    let mut writer = BufWriter::new(file);
    let wr = |e| CompareError::io_write(path, e);

    writeln!(writer, "ply").map_err(wr)?;
    writeln!(writer, "format ascii 1.0").map_err(wr)?;
    writeln!(writer, "element vertex {}", mesh.vertex_count()).map_err(wr)?;
    writeln!(writer, "property double x").map_err(wr)?;
    writeln!(writer, "property double y").map_err(wr)?;
    writeln!(writer, "property double z").map_err(wr)?;
    writeln!(writer, "element face {}", mesh.face_count()).map_err(wr)?;
    writeln!(writer, "property list uchar uint vertex_indices").map_err(wr)?;
    writeln!(writer, "end_header").map_err(wr)?;

    for v in &mesh.vertices {
        writeln!(writer, "{} {} {}", v.x, v.y, v.z).map_err(wr)?;
    }
    for [a, b, c] in &mesh.faces {
        writeln!(writer, "3 {} {} {}", a, b, c).map_err(wr)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetrahedron() -> Mesh {
        let mut mesh = Mesh::new();
        mesh.vertices.push(Point3::new(0.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(1.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(0.5, 1.0, 0.0));
        mesh.vertices.push(Point3::new(0.5, 0.5, 1.0));
        mesh.faces.push([0, 2, 1]);
        mesh.faces.push([0, 1, 3]);
        mesh.faces.push([1, 2, 3]);
        mesh.faces.push([2, 0, 3]);
        mesh
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            MeshFormat::from_path(Path::new("model.STL")),
            Some(MeshFormat::Stl)
        );
        assert_eq!(
            MeshFormat::from_path(Path::new("a/b/model.obj")),
            Some(MeshFormat::Obj)
        );
        assert_eq!(
            MeshFormat::from_path(Path::new("scan.ply")),
            Some(MeshFormat::Ply)
        );
        assert_eq!(MeshFormat::from_path(Path::new("volume.tiff")), None);
    }

    #[test]
    fn test_unsupported_extension_errors() {
        let result = load_mesh("scan.xyz");
        assert!(matches!(
            result,
            Err(CompareError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_stl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tet.stl");
        let mesh = tetrahedron();

        save_mesh(&mesh, &path).unwrap();
        let loaded = load_mesh(&path).unwrap();

        // STL welds on load: vertex and face counts must survive.
        assert_eq!(loaded.vertex_count(), mesh.vertex_count());
        assert_eq!(loaded.face_count(), mesh.face_count());
    }

    #[test]
    fn test_obj_round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tet.obj");
        let mesh = tetrahedron();

        save_mesh(&mesh, &path).unwrap();
        let loaded = load_mesh(&path).unwrap();

        assert_eq!(loaded.vertex_count(), mesh.vertex_count());
        assert_eq!(loaded.face_count(), mesh.face_count());
        for (a, b) in loaded.vertices.iter().zip(mesh.vertices.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
        assert_eq!(loaded.faces, mesh.faces);
    }

    #[test]
    fn test_ply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tet.ply");
        let mesh = tetrahedron();

        save_mesh(&mesh, &path).unwrap();
        let loaded = load_mesh(&path).unwrap();

        assert_eq!(loaded.vertex_count(), mesh.vertex_count());
        assert_eq!(loaded.faces, mesh.faces);
    }

    #[test]
    fn test_ascii_stl_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tri.stl");
        std::fs::write(
            &path,
            "solid tri\n facet normal 0 0 1\n  outer loop\n   vertex 0 0 0\n   vertex 1 0 0\n   vertex 0 1 0\n  endloop\n endfacet\nendsolid tri\n",
        )
        .unwrap();

        let mesh = load_mesh(&path).unwrap();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.face_count(), 1);
    }

    #[test]
    fn test_obj_negative_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neg.obj");
        std::fs::write(&path, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n").unwrap();

        let mesh = load_mesh(&path).unwrap();
        assert_eq!(mesh.faces, vec![[0, 1, 2]]);
    }

    #[test]
    fn test_obj_quad_is_triangulated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quad.obj");
        std::fs::write(&path, "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n").unwrap();

        let mesh = load_mesh(&path).unwrap();
        assert_eq!(mesh.face_count(), 2);
    }

    #[test]
    fn test_truncated_binary_stl_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.stl");
        let mut bytes = vec![0u8; 84];
        bytes[80..84].copy_from_slice(&10u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            load_mesh(&path),
            Err(CompareError::Parse { .. })
        ));
    }
}
