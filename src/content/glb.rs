//! Binary glTF (GLB) reading and writing, plus the in-memory model type the
//! other decoders produce.

use gltf_json::validation::USize64;
use gltf_json::{Index, Root};
use tracing::warn;

use crate::content::{ContentDecoder, ContentFactory, ContentInput};
use crate::error::{Result, TileStreamError};
use crate::types::TileContent;

pub const GLB_MAGIC: u32 = 0x4654_6C67; // 'glTF'
pub const CHUNK_TYPE_JSON: u32 = 0x4E4F_534A; // 'JSON'
pub const CHUNK_TYPE_BIN: u32 = 0x004E_4942; // 'BIN\0'

/// A decoded glTF asset: the JSON document plus the binary chunk, if any.
#[derive(Debug, Default)]
pub struct GltfModel {
    pub root: Root,
    pub bin: Option<Vec<u8>>,
}

impl GltfModel {
    /// Total primitives across all meshes.
    pub fn primitive_count(&self) -> usize {
        self.root.meshes.iter().map(|m| m.primitives.len()).sum()
    }

    /// Bytes attributed to this model for cache accounting.
    pub fn byte_size(&self) -> i64 {
        self.bin.as_ref().map(|b| b.len() as i64).unwrap_or(0)
    }

    /// Append another model's content into this one.
    ///
    /// Buffers, views, accessors, textures, materials, meshes, and nodes are
    /// re-indexed and appended; the other model's scene roots join this
    /// model's default scene. Animations, skins, and cameras are not carried
    /// over. Binary chunks are concatenated with 4-byte alignment, so merged
    /// buffer views keep their offsets relative to a shifted base.
    pub fn merge(&mut self, other: GltfModel) {
        let GltfModel {
            root: mut theirs,
            bin: their_bin,
        } = other;

        // Concatenate binary chunks; their views shift by the aligned length
        // of ours.
        let bin_base = match (&mut self.bin, their_bin) {
            (_, None) => 0,
            (None, Some(b)) => {
                self.bin = Some(b);
                0
            }
            (Some(ours), Some(theirs_bin)) => {
                while ours.len() % 4 != 0 {
                    ours.push(0);
                }
                let base = ours.len() as u64;
                ours.extend_from_slice(&theirs_bin);
                base
            }
        };

        let buffer_offset = self.root.buffers.len() as u32;
        let view_offset = self.root.buffer_views.len() as u32;
        let accessor_offset = self.root.accessors.len() as u32;
        let image_offset = self.root.images.len() as u32;
        let sampler_offset = self.root.samplers.len() as u32;
        let texture_offset = self.root.textures.len() as u32;
        let material_offset = self.root.materials.len() as u32;
        let mesh_offset = self.root.meshes.len() as u32;
        let node_offset = self.root.nodes.len() as u32;

        fn bump<T>(index: &mut Index<T>, offset: u32) {
            *index = Index::new(index.value() as u32 + offset);
        }

        // The implicit GLB buffer is buffer 0 of each document; after the
        // concatenation both models share ours, so their buffer 0 views move
        // onto it at the shifted offset. Buffers with URIs stay separate.
        let mut their_buffer_map: Vec<Option<u32>> = Vec::with_capacity(theirs.buffers.len());
        let mut kept_buffers = Vec::new();
        for (i, buffer) in theirs.buffers.drain(..).enumerate() {
            if i == 0 && buffer.uri.is_none() && !self.root.buffers.is_empty() {
                their_buffer_map.push(None); // folds into our buffer 0
            } else {
                their_buffer_map.push(Some(buffer_offset + kept_buffers.len() as u32));
                kept_buffers.push(buffer);
            }
        }

        // Grow our implicit buffer to cover the appended bytes.
        if let (Some(first), Some(bin)) = (self.root.buffers.first_mut(), &self.bin) {
            if first.uri.is_none() {
                first.byte_length = USize64(first.byte_length.0.max(bin.len() as u64));
            }
        }
        self.root.buffers.extend(kept_buffers);

        for view in &mut theirs.buffer_views {
            match their_buffer_map.get(view.buffer.value()).copied().flatten() {
                Some(mapped) => view.buffer = Index::new(mapped),
                None => {
                    view.buffer = Index::new(0);
                    view.byte_offset =
                        Some(USize64(view.byte_offset.map(|o| o.0).unwrap_or(0) + bin_base));
                }
            }
        }
        self.root.buffer_views.extend(theirs.buffer_views.drain(..));

        for accessor in &mut theirs.accessors {
            if let Some(view) = &mut accessor.buffer_view {
                bump(view, view_offset);
            }
            if let Some(sparse) = &mut accessor.sparse {
                bump(&mut sparse.indices.buffer_view, view_offset);
                bump(&mut sparse.values.buffer_view, view_offset);
            }
        }
        self.root.accessors.extend(theirs.accessors.drain(..));

        for image in &mut theirs.images {
            if let Some(view) = &mut image.buffer_view {
                bump(view, view_offset);
            }
        }
        self.root.images.extend(theirs.images.drain(..));
        self.root.samplers.extend(theirs.samplers.drain(..));

        for texture in &mut theirs.textures {
            bump(&mut texture.source, image_offset);
            if let Some(sampler) = &mut texture.sampler {
                bump(sampler, sampler_offset);
            }
        }
        self.root.textures.extend(theirs.textures.drain(..));

        for material in &mut theirs.materials {
            if let Some(info) = &mut material.pbr_metallic_roughness.base_color_texture {
                bump(&mut info.index, texture_offset);
            }
            if let Some(info) = &mut material.pbr_metallic_roughness.metallic_roughness_texture {
                bump(&mut info.index, texture_offset);
            }
            if let Some(tex) = &mut material.normal_texture {
                bump(&mut tex.index, texture_offset);
            }
            if let Some(tex) = &mut material.occlusion_texture {
                bump(&mut tex.index, texture_offset);
            }
            if let Some(info) = &mut material.emissive_texture {
                bump(&mut info.index, texture_offset);
            }
        }
        self.root.materials.extend(theirs.materials.drain(..));

        for mesh in &mut theirs.meshes {
            for primitive in &mut mesh.primitives {
                for accessor in primitive.attributes.values_mut() {
                    bump(accessor, accessor_offset);
                }
                if let Some(indices) = &mut primitive.indices {
                    bump(indices, accessor_offset);
                }
                if let Some(material) = &mut primitive.material {
                    bump(material, material_offset);
                }
                if let Some(targets) = &mut primitive.targets {
                    for target in targets {
                        if let Some(a) = &mut target.positions {
                            bump(a, accessor_offset);
                        }
                        if let Some(a) = &mut target.normals {
                            bump(a, accessor_offset);
                        }
                        if let Some(a) = &mut target.tangents {
                            bump(a, accessor_offset);
                        }
                    }
                }
            }
        }
        self.root.meshes.extend(theirs.meshes.drain(..));

        for node in &mut theirs.nodes {
            if let Some(mesh) = &mut node.mesh {
                bump(mesh, mesh_offset);
            }
            if let Some(children) = &mut node.children {
                for child in children {
                    bump(child, node_offset);
                }
            }
            node.camera = None;
            node.skin = None;
        }
        self.root.nodes.extend(theirs.nodes.drain(..));

        // Their scene roots join our default scene.
        let their_roots: Vec<Index<gltf_json::Node>> = theirs
            .scenes
            .iter()
            .flat_map(|scene| scene.nodes.iter())
            .map(|node| Index::new(node.value() as u32 + node_offset))
            .collect();

        let scene_index = self
            .root
            .scene
            .map(|s| s.value())
            .filter(|i| *i < self.root.scenes.len());
        match scene_index {
            Some(i) => self.root.scenes[i].nodes.extend(their_roots),
            None if self.root.scenes.is_empty() => {
                let scene = self.root.push(gltf_json::Scene {
                    nodes: their_roots,
                    name: None,
                    extensions: Default::default(),
                    extras: Default::default(),
                });
                self.root.scene = Some(scene);
            }
            None => self.root.scenes[0].nodes.extend(their_roots),
        }

        for ext in theirs.extensions_used {
            if !self.root.extensions_used.contains(&ext) {
                self.root.extensions_used.push(ext);
            }
        }
        for ext in theirs.extensions_required {
            if !self.root.extensions_required.contains(&ext) {
                self.root.extensions_required.push(ext);
            }
        }
    }
}

/// Parse a binary glTF container.
///
/// Enforces the GLB 2.0 framing rules: the 12-byte header, 4-byte aligned
/// chunks, a leading JSON chunk, at most one BIN chunk. The BIN chunk may be
/// up to 3 bytes longer than the declared buffer (alignment padding) and is
/// truncated to the declared length.
pub fn read_glb(data: &[u8]) -> Result<GltfModel> {
    if data.len() < 12 {
        return Err(TileStreamError::Format(format!(
            "GLB is {} bytes; the header alone is 12",
            data.len()
        )));
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != GLB_MAGIC {
        return Err(TileStreamError::Format(format!(
            "GLB magic is {magic:#010x}, expected 'glTF'"
        )));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if version != 2 {
        return Err(TileStreamError::Format(format!(
            "unsupported GLB version {version}"
        )));
    }
    let declared_length = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    if declared_length > data.len() {
        return Err(TileStreamError::Format(format!(
            "GLB declares {declared_length} bytes but only {} are present",
            data.len()
        )));
    }

    let mut json_chunk: Option<&[u8]> = None;
    let mut bin_chunk: Option<&[u8]> = None;
    let mut pos = 12;

    while pos + 8 <= declared_length {
        let chunk_length = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let chunk_type = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
        let chunk_start = pos + 8;
        let chunk_end = chunk_start + chunk_length;
        if chunk_end > declared_length {
            return Err(TileStreamError::Format(format!(
                "GLB chunk at offset {pos} overruns the container"
            )));
        }
        if chunk_length % 4 != 0 {
            return Err(TileStreamError::Format(format!(
                "GLB chunk at offset {pos} is not 4-byte aligned"
            )));
        }

        let chunk = &data[chunk_start..chunk_end];
        match chunk_type {
            CHUNK_TYPE_JSON => {
                if json_chunk.is_some() {
                    return Err(TileStreamError::Format("GLB has two JSON chunks".into()));
                }
                json_chunk = Some(chunk);
            }
            CHUNK_TYPE_BIN => {
                if json_chunk.is_none() {
                    return Err(TileStreamError::Format(
                        "GLB BIN chunk precedes the JSON chunk".into(),
                    ));
                }
                if bin_chunk.is_some() {
                    return Err(TileStreamError::Format("GLB has two BIN chunks".into()));
                }
                bin_chunk = Some(chunk);
            }
            other => {
                // Unknown chunk types are skipped per the GLB spec.
                warn!(chunk_type = other, "Skipping unknown GLB chunk");
            }
        }
        pos = chunk_end;
    }

    let json_chunk = json_chunk
        .ok_or_else(|| TileStreamError::Format("GLB contains no JSON chunk".into()))?;
    let root: Root = serde_json::from_slice(json_chunk)
        .map_err(|e| TileStreamError::Format(format!("GLB JSON chunk: {e}")))?;

    let bin = match bin_chunk {
        None => None,
        Some(chunk) => {
            let declared = root
                .buffers
                .first()
                .filter(|b| b.uri.is_none())
                .map(|b| b.byte_length.0 as usize);
            match declared {
                None => {
                    if root.buffers.first().is_some() {
                        return Err(TileStreamError::Semantic(
                            "GLB buffer 0 carries a uri but a BIN chunk is present".into(),
                        ));
                    }
                    warn!("GLB has a BIN chunk but no buffer referencing it");
                    Some(chunk.to_vec())
                }
                Some(byte_length) => {
                    if chunk.len() < byte_length {
                        return Err(TileStreamError::Semantic(format!(
                            "GLB BIN chunk is {} bytes but buffer 0 declares {byte_length}",
                            chunk.len()
                        )));
                    }
                    if chunk.len() > byte_length + 3 {
                        warn!(
                            chunk = chunk.len(),
                            declared = byte_length,
                            "GLB BIN chunk exceeds buffer length by more than padding"
                        );
                    }
                    Some(chunk[..byte_length].to_vec())
                }
            }
        }
    };

    Ok(GltfModel { root, bin })
}

/// Serialize a model as a binary glTF container.
///
/// The JSON chunk is padded with spaces and the BIN chunk with zeros to
/// 4-byte boundaries.
pub fn write_glb(model: &GltfModel) -> Result<Vec<u8>> {
    let json_string = gltf_json::serialize::to_string(&model.root)
        .map_err(|e| TileStreamError::Format(format!("glTF serialization: {e}")))?;
    let mut json_bytes = json_string.into_bytes();
    while json_bytes.len() % 4 != 0 {
        json_bytes.push(b' ');
    }

    let mut bin_bytes = model.bin.clone().unwrap_or_default();
    while bin_bytes.len() % 4 != 0 {
        bin_bytes.push(0);
    }

    let mut length = 12 + 8 + json_bytes.len();
    if !bin_bytes.is_empty() {
        length += 8 + bin_bytes.len();
    }

    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(length as u32).to_le_bytes());

    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_TYPE_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);

    if !bin_bytes.is_empty() {
        out.extend_from_slice(&(bin_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&CHUNK_TYPE_BIN.to_le_bytes());
        out.extend_from_slice(&bin_bytes);
    }

    Ok(out)
}

/// Decoder for glTF content, binary (`.glb`) or JSON text (`.gltf`).
#[derive(Debug, Default)]
pub struct GltfDecoder;

impl ContentDecoder for GltfDecoder {
    fn decode(&self, _factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent> {
        if input.data.len() >= 4 && &input.data[0..4] == b"glTF" {
            return Ok(TileContent::Model(read_glb(input.data)?));
        }

        let root: Root = serde_json::from_slice(input.data)
            .map_err(|e| TileStreamError::Format(format!("glTF JSON for {}: {e}", input.url)))?;
        Ok(TileContent::Model(GltfModel { root, bin: None }))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use gltf_json::mesh::{Mode, Primitive, Semantic};
    use gltf_json::validation::Checked;
    use gltf_json::accessor::{ComponentType, GenericComponentType, Type as AccessorType};

    /// Build a minimal valid model: one triangle, one mesh, one primitive,
    /// positions in an internal buffer.
    pub fn triangle_model() -> GltfModel {
        let positions: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let mut bin = Vec::new();
        for value in positions {
            bin.extend_from_slice(&value.to_le_bytes());
        }

        let mut root = Root {
            asset: gltf_json::Asset {
                version: "2.0".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let buffer = root.push(gltf_json::Buffer {
            byte_length: USize64::from(bin.len()),
            uri: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        let view = root.push(gltf_json::buffer::View {
            buffer,
            byte_length: USize64::from(bin.len()),
            byte_offset: Some(USize64(0)),
            byte_stride: None,
            name: None,
            target: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        let accessor = root.push(gltf_json::Accessor {
            buffer_view: Some(view),
            byte_offset: Some(USize64(0)),
            count: USize64(3),
            component_type: Checked::Valid(GenericComponentType(ComponentType::F32)),
            type_: Checked::Valid(AccessorType::Vec3),
            min: Some(serde_json::json!([0.0, 0.0, 0.0])),
            max: Some(serde_json::json!([1.0, 1.0, 0.0])),
            name: None,
            normalized: false,
            sparse: None,
            extensions: Default::default(),
            extras: Default::default(),
        });

        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert(Checked::Valid(Semantic::Positions), accessor);
        let mesh = root.push(gltf_json::Mesh {
            primitives: vec![Primitive {
                attributes,
                indices: None,
                material: None,
                mode: Checked::Valid(Mode::Triangles),
                targets: None,
                extensions: Default::default(),
                extras: Default::default(),
            }],
            weights: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        let node = root.push(gltf_json::Node {
            mesh: Some(mesh),
            ..Default::default()
        });
        let scene = root.push(gltf_json::Scene {
            nodes: vec![node],
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        root.scene = Some(scene);

        GltfModel {
            root,
            bin: Some(bin),
        }
    }
}
