use gltf::{buffer::Data, mesh::Mode};
use serde::{Deserialize, Serialize};
use strom_shared::{
    byteorder::{LittleEndian, WriteBytesExt},
    log::trace,
    nalgebra::Vector3,
};

use crate::{Error, Result, SourceData};

/// File type of canonical model files
pub const MODEL_FILE_TYPE: &str = "model";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub name: String,
    pub meshes: Vec<MeshData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub vertex_positions: Vec<Vector3<f32>>,
    pub vertex_normals: Vec<Vector3<f32>>,
    pub indices: Vec<u32>,
}

/// Byte ranges of one mesh in the device layout of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshRange {
    pub positions_offset: u64,
    pub normals_offset: u64,
    pub indices_offset: u64,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshData {
    fn device_size(&self) -> u64 {
        (self.vertex_positions.len() * 12 + self.vertex_normals.len() * 12 + self.indices.len() * 4) as u64
    }
}

impl ModelData {
    /// Size of the buffer that [`ModelData::device_bytes`] fills.
    pub fn device_size(&self) -> u64 {
        self.meshes.iter().map(MeshData::device_size).sum()
    }

    /// Returns where the meshes are located in the output of [`ModelData::device_bytes`].
    pub fn mesh_ranges(&self) -> Vec<MeshRange> {
        let mut offset = 0;
        self.meshes
            .iter()
            .map(|mesh| {
                let positions_offset = offset;
                let normals_offset = positions_offset + mesh.vertex_positions.len() as u64 * 12;
                let indices_offset = normals_offset + mesh.vertex_normals.len() as u64 * 12;
                offset += mesh.device_size();
                MeshRange {
                    positions_offset,
                    normals_offset,
                    indices_offset,
                    vertex_count: mesh.vertex_positions.len() as u32,
                    index_count: mesh.indices.len() as u32,
                }
            })
            .collect()
    }

    /// Layout of the model on the device: for every mesh the positions, the normals and the
    /// indices are written tightly packed in little endian.
    pub fn device_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.device_size() as usize);
        for mesh in &self.meshes {
            for vector in mesh.vertex_positions.iter().chain(mesh.vertex_normals.iter()) {
                for component in vector.iter() {
                    // Writing into a Vec doesn't fail.
                    let _ = bytes.write_f32::<LittleEndian>(*component);
                }
            }
            for index in &mesh.indices {
                let _ = bytes.write_u32::<LittleEndian>(*index);
            }
        }
        bytes
    }
}

/// Materializer for glTF and GLB files.
///
/// External buffers are not resolved because the source is read from memory. Every primitive
/// of a mesh is appended to one index list which is then optimized for the vertex cache.
pub fn materialize_gltf(source: &SourceData) -> Result<ModelData> {
    let (document, buffers, _images) = gltf::import_slice(source.bytes).map_err(|err| Error::decode(source.name, err))?;
    let meshes = document
        .meshes()
        .map(|mesh| build_mesh(source.name, &mesh, &buffers))
        .collect::<Result<Vec<_>>>()?;
    Ok(ModelData {
        name: source.name.to_owned(),
        meshes,
    })
}

fn build_mesh(model_name: &str, mesh: &gltf::Mesh, buffers: &[Data]) -> Result<MeshData> {
    let mesh_name = mesh.name().unwrap_or("unknown");
    trace!("Processing mesh '{mesh_name}' in model '{model_name}'");

    let mut vertex_positions = Vec::new();
    let mut vertex_normals = Vec::new();
    let mut indices = Vec::new();
    for primitive in mesh.primitives() {
        if primitive.mode() != Mode::Triangles {
            return Err(Error::decode(
                model_name,
                format!("mesh '{mesh_name}' contains a primitive with mode {:?}", primitive.mode()),
            ));
        }
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));
        let positions = reader
            .read_positions()
            .ok_or_else(|| Error::decode(model_name, format!("mesh '{mesh_name}' has no vertex positions")))?
            .map(Vector3::from)
            .collect::<Vec<_>>();
        let normals = reader
            .read_normals()
            .ok_or_else(|| Error::decode(model_name, format!("mesh '{mesh_name}' has no vertex normals")))?
            .map(Vector3::from)
            .collect::<Vec<_>>();
        if positions.len() != normals.len() {
            return Err(Error::decode(
                model_name,
                format!("mesh '{mesh_name}' has a different number of positions and normals"),
            ));
        }

        let base = vertex_positions.len() as u32;
        let vertex_count = positions.len() as u32;
        match reader.read_indices() {
            Some(read_indices) => {
                for index in read_indices.into_u32() {
                    if index >= vertex_count {
                        return Err(Error::decode(model_name, format!("mesh '{mesh_name}' has an index out of range")));
                    }
                    indices.push(base + index);
                }
            }
            None => indices.extend(base..base + vertex_count),
        }
        vertex_positions.extend(positions);
        vertex_normals.extend(normals);
    }

    if indices.len() % 3 != 0 {
        return Err(Error::decode(
            model_name,
            format!("mesh '{mesh_name}' has an index count that is not a multiple of 3"),
        ));
    }
    let indices = meshopt::optimize::optimize_vertex_cache(&indices, vertex_positions.len());

    Ok(MeshData {
        vertex_positions,
        vertex_normals,
        indices,
    })
}
