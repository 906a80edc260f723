//! Batched (`b3dm`) and instanced (`i3dm`) 3D model tiles. Both are a small
//! header plus feature/batch tables wrapped around an embedded binary glTF;
//! the tables are skipped and the glTF is handed to the GLB reader.

use crate::content::glb::read_glb;
use crate::content::{ContentDecoder, ContentFactory, ContentInput};
use crate::error::{Result, TileStreamError};
use crate::types::TileContent;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Validate the common `{magic, version, byteLength}` prefix and return the
/// declared byte length.
fn check_prefix(data: &[u8], magic: &[u8; 4], url: &str) -> Result<usize> {
    if data.len() < 12 {
        return Err(TileStreamError::Format(format!(
            "{} tile {url} is {} bytes; the header alone is larger",
            String::from_utf8_lossy(magic),
            data.len()
        )));
    }
    if &data[0..4] != magic {
        return Err(TileStreamError::Format(format!(
            "tile {url} does not start with magic '{}'",
            String::from_utf8_lossy(magic)
        )));
    }
    let version = read_u32(data, 4);
    if version != 1 {
        return Err(TileStreamError::Format(format!(
            "unsupported {} version {version} in {url}",
            String::from_utf8_lossy(magic)
        )));
    }
    let byte_length = read_u32(data, 8) as usize;
    if byte_length > data.len() {
        return Err(TileStreamError::Format(format!(
            "tile {url} declares {byte_length} bytes but only {} are present",
            data.len()
        )));
    }
    Ok(byte_length)
}

/// Decoder for Batched 3D Model (`b3dm`) tiles.
///
/// Header: 28 bytes `{magic, version, byteLength, featureTableJSONByteLength,
/// featureTableBinaryByteLength, batchTableJSONByteLength,
/// batchTableBinaryByteLength}`, then the tables, then the glTF.
#[derive(Debug, Default)]
pub struct BatchedModelDecoder;

impl ContentDecoder for BatchedModelDecoder {
    fn decode(&self, _factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent> {
        let data = input.data;
        let byte_length = check_prefix(data, b"b3dm", input.url)?;
        if data.len() < 28 {
            return Err(TileStreamError::Format(format!(
                "b3dm tile {} is shorter than its 28-byte header",
                input.url
            )));
        }

        let ft_json = read_u32(data, 12) as usize;
        let ft_bin = read_u32(data, 16) as usize;
        let bt_json = read_u32(data, 20) as usize;
        let bt_bin = read_u32(data, 24) as usize;

        let gltf_start = 28 + ft_json + ft_bin + bt_json + bt_bin;
        if gltf_start >= byte_length {
            return Err(TileStreamError::Format(format!(
                "b3dm tile {} has no room for a glTF after its tables",
                input.url
            )));
        }

        let model = read_glb(&data[gltf_start..byte_length])?;
        Ok(TileContent::Model(model))
    }
}

/// Decoder for Instanced 3D Model (`i3dm`) tiles.
///
/// Same layout as `b3dm` plus a trailing `gltfFormat` header field; format 0
/// (glTF by URI) is not supported.
#[derive(Debug, Default)]
pub struct InstancedModelDecoder;

impl ContentDecoder for InstancedModelDecoder {
    fn decode(&self, _factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent> {
        let data = input.data;
        let byte_length = check_prefix(data, b"i3dm", input.url)?;
        if data.len() < 32 {
            return Err(TileStreamError::Format(format!(
                "i3dm tile {} is shorter than its 32-byte header",
                input.url
            )));
        }

        let ft_json = read_u32(data, 12) as usize;
        let ft_bin = read_u32(data, 16) as usize;
        let bt_json = read_u32(data, 20) as usize;
        let bt_bin = read_u32(data, 24) as usize;
        let gltf_format = read_u32(data, 28);

        if gltf_format == 0 {
            return Err(TileStreamError::Format(format!(
                "i3dm tile {} references its glTF by URI, which is not supported",
                input.url
            )));
        }

        let gltf_start = 32 + ft_json + ft_bin + bt_json + bt_bin;
        if gltf_start >= byte_length {
            return Err(TileStreamError::Format(format!(
                "i3dm tile {} has no room for a glTF after its tables",
                input.url
            )));
        }

        let model = read_glb(&data[gltf_start..byte_length])?;
        Ok(TileContent::Model(model))
    }
}
