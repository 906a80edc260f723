//! Availability oracle for implicit (quadtree/octree) tilesets.
//!
//! Availability is downloaded in bounded blocks ("subtrees"): bit-packed
//! blobs answering, for every cell of the block, whether the tile exists,
//! whether it has content, and whether a child subtree hangs off the block's
//! bottom level. Cells are indexed by Morton code relative to the subtree
//! root.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Result, TileStreamError};

const SUBTREE_MAGIC: &[u8; 4] = b"subt";

/// Interleave the low 32 bits of `v` with one zero bit between each.
fn spread_by_1(v: u64) -> u64 {
    let mut v = v & 0xffff_ffff;
    v = (v | (v << 16)) & 0x0000_ffff_0000_ffff;
    v = (v | (v << 8)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v << 2)) & 0x3333_3333_3333_3333;
    v = (v | (v << 1)) & 0x5555_5555_5555_5555;
    v
}

fn compact_by_1(v: u64) -> u64 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v >> 4)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v >> 8)) & 0x0000_ffff_0000_ffff;
    v = (v | (v >> 16)) & 0x0000_0000_ffff_ffff;
    v
}

/// Interleave the low 21 bits of `v` with two zero bits between each.
fn spread_by_2(v: u64) -> u64 {
    let mut v = v & 0x1f_ffff;
    v = (v | (v << 32)) & 0x001f_0000_0000_ffff;
    v = (v | (v << 16)) & 0x001f_0000_ff00_00ff;
    v = (v | (v << 8)) & 0x100f_00f0_0f00_f00f;
    v = (v | (v << 4)) & 0x10c3_0c30_c30c_30c3;
    v = (v | (v << 2)) & 0x1249_2492_4924_9249;
    v
}

fn compact_by_2(v: u64) -> u64 {
    let mut v = v & 0x1249_2492_4924_9249;
    v = (v | (v >> 2)) & 0x10c3_0c30_c30c_30c3;
    v = (v | (v >> 4)) & 0x100f_00f0_0f00_f00f;
    v = (v | (v >> 8)) & 0x001f_0000_ff00_00ff;
    v = (v | (v >> 16)) & 0x001f_0000_0000_ffff;
    v = (v | (v >> 32)) & 0x0000_0000_001f_ffff;
    v
}

/// 2-D Morton code: bit-interleaved `(x, y)`.
pub fn morton2_encode(x: u32, y: u32) -> u64 {
    spread_by_1(u64::from(x)) | (spread_by_1(u64::from(y)) << 1)
}

pub fn morton2_decode(m: u64) -> (u32, u32) {
    (compact_by_1(m) as u32, compact_by_1(m >> 1) as u32)
}

/// 3-D Morton code: bit-interleaved `(x, y, z)`.
pub fn morton3_encode(x: u32, y: u32, z: u32) -> u64 {
    spread_by_2(u64::from(x))
        | (spread_by_2(u64::from(y)) << 1)
        | (spread_by_2(u64::from(z)) << 2)
}

pub fn morton3_decode(m: u64) -> (u32, u32, u32) {
    (
        compact_by_2(m) as u32,
        compact_by_2(m >> 1) as u32,
        compact_by_2(m >> 2) as u32,
    )
}

/// One availability bitstream: either a constant answer for every cell or a
/// bit-packed buffer (LSB-first within each byte).
#[derive(Debug, Clone)]
pub enum Bitstream {
    Constant(bool),
    Packed(Vec<u8>),
}

impl Bitstream {
    pub fn is_set(&self, bit: u64) -> bool {
        match self {
            Bitstream::Constant(value) => *value,
            Bitstream::Packed(bytes) => {
                let byte = (bit / 8) as usize;
                byte < bytes.len() && bytes[byte] & (1 << (bit % 8)) != 0
            }
        }
    }
}

/// Decoded availability for one subtree block.
#[derive(Debug, Clone)]
pub struct SubtreeAvailability {
    /// 4 for quadtrees, 8 for octrees.
    branching_factor: u32,
    tile_availability: Bitstream,
    /// One stream per content slot (multiple-contents extension); most
    /// tilesets have exactly one.
    content_availability: Vec<Bitstream>,
    child_subtree_availability: Bitstream,
}

impl SubtreeAvailability {
    pub fn new(
        branching_factor: u32,
        tile_availability: Bitstream,
        content_availability: Vec<Bitstream>,
        child_subtree_availability: Bitstream,
    ) -> Self {
        Self {
            branching_factor,
            tile_availability,
            content_availability,
            child_subtree_availability,
        }
    }

    /// Number of cells above `relative_level`, i.e. the bit offset of that
    /// level within the tile/content streams.
    fn level_offset(&self, relative_level: u32) -> u64 {
        let k = u64::from(self.branching_factor);
        // (k^level - 1) / (k - 1)
        (k.pow(relative_level) - 1) / (k - 1)
    }

    pub fn is_tile_available(&self, relative_level: u32, relative_morton: u64) -> bool {
        self.tile_availability
            .is_set(self.level_offset(relative_level) + relative_morton)
    }

    pub fn is_content_available(
        &self,
        relative_level: u32,
        relative_morton: u64,
        slot: usize,
    ) -> bool {
        self.content_availability
            .get(slot)
            .map(|stream| stream.is_set(self.level_offset(relative_level) + relative_morton))
            .unwrap_or(false)
    }

    /// Whether a child subtree exists at the block's bottom boundary.
    /// `relative_morton` is the Morton index within that boundary level.
    pub fn is_subtree_available(&self, relative_morton: u64) -> bool {
        self.child_subtree_availability.is_set(relative_morton)
    }
}

#[derive(Debug, Deserialize)]
struct SubtreeBufferJson {
    #[serde(rename = "byteLength")]
    byte_length: u64,
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubtreeBufferViewJson {
    buffer: usize,
    #[serde(rename = "byteOffset", default)]
    byte_offset: u64,
    #[serde(rename = "byteLength")]
    byte_length: u64,
}

/// An availability declaration: a constant, or a buffer view holding packed
/// bits. The 1.1 spec calls the key `bitstream`; pre-release tilesets used
/// `bufferView`.
#[derive(Debug, Deserialize)]
struct AvailabilityJson {
    constant: Option<u8>,
    bitstream: Option<usize>,
    #[serde(rename = "bufferView")]
    buffer_view: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentAvailabilityJson {
    One(AvailabilityJson),
    Many(Vec<AvailabilityJson>),
}

#[derive(Debug, Deserialize)]
struct SubtreeJson {
    #[serde(default)]
    buffers: Vec<SubtreeBufferJson>,
    #[serde(rename = "bufferViews", default)]
    buffer_views: Vec<SubtreeBufferViewJson>,
    #[serde(rename = "tileAvailability")]
    tile_availability: AvailabilityJson,
    #[serde(rename = "contentAvailability")]
    content_availability: Option<ContentAvailabilityJson>,
    #[serde(rename = "childSubtreeAvailability")]
    child_subtree_availability: AvailabilityJson,
}

fn resolve_bitstream(
    availability: &AvailabilityJson,
    json: &SubtreeJson,
    binary: &[u8],
) -> Result<Bitstream> {
    if let Some(constant) = availability.constant {
        return Ok(Bitstream::Constant(constant != 0));
    }

    let view_index = availability
        .bitstream
        .or(availability.buffer_view)
        .ok_or_else(|| {
            TileStreamError::Format("availability declares neither constant nor bitstream".into())
        })?;

    let view = json.buffer_views.get(view_index).ok_or_else(|| {
        TileStreamError::Format(format!("bufferView {view_index} out of range"))
    })?;

    let buffer = json.buffers.get(view.buffer).ok_or_else(|| {
        TileStreamError::Format(format!("buffer {} out of range", view.buffer))
    })?;
    if buffer.uri.is_some() {
        return Err(TileStreamError::Config(
            "external subtree buffers are not supported".into(),
        ));
    }
    if view.buffer != 0 {
        return Err(TileStreamError::Format(
            "bitstream must reference the internal buffer".into(),
        ));
    }

    let start = view.byte_offset as usize;
    let end = start + view.byte_length as usize;
    if end > binary.len() || view.byte_offset + view.byte_length > buffer.byte_length {
        return Err(TileStreamError::Format(format!(
            "bufferView {view_index} overruns the internal buffer ({end} > {})",
            binary.len()
        )));
    }

    Ok(Bitstream::Packed(binary[start..end].to_vec()))
}

/// Decode a binary subtree blob.
///
/// Layout: 16-byte header `{magic "subt", version 1, jsonByteLength u64,
/// binaryByteLength u64}`, then the JSON chunk, then the internal binary
/// buffer.
pub fn decode_subtree(data: &[u8], branching_factor: u32) -> Result<SubtreeAvailability> {
    if data.len() < 24 {
        return Err(TileStreamError::Format(format!(
            "subtree blob is {} bytes; the header alone is 24",
            data.len()
        )));
    }
    if &data[0..4] != SUBTREE_MAGIC {
        return Err(TileStreamError::Format(
            "subtree blob does not start with magic 'subt'".into(),
        ));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if version != 1 {
        return Err(TileStreamError::Format(format!(
            "unsupported subtree version {version}"
        )));
    }

    let json_length = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;
    let binary_length = u64::from_le_bytes(data[16..24].try_into().unwrap()) as usize;
    let json_end = 24 + json_length;
    let binary_end = json_end + binary_length;
    if binary_end > data.len() {
        return Err(TileStreamError::Format(format!(
            "subtree chunks ({binary_end} bytes) exceed blob length {}",
            data.len()
        )));
    }

    let json: SubtreeJson = serde_json::from_slice(&data[24..json_end])
        .map_err(|e| TileStreamError::Format(format!("subtree JSON: {e}")))?;
    let binary = &data[json_end..binary_end];

    let tile_availability = resolve_bitstream(&json.tile_availability, &json, binary)?;
    let child_subtree_availability =
        resolve_bitstream(&json.child_subtree_availability, &json, binary)?;

    let content_availability = match &json.content_availability {
        None => Vec::new(),
        Some(ContentAvailabilityJson::One(one)) => vec![resolve_bitstream(one, &json, binary)?],
        Some(ContentAvailabilityJson::Many(many)) => many
            .iter()
            .map(|entry| resolve_bitstream(entry, &json, binary))
            .collect::<Result<Vec<_>>>()?,
    };

    Ok(SubtreeAvailability::new(
        branching_factor,
        tile_availability,
        content_availability,
        child_subtree_availability,
    ))
}

/// Cache of loaded subtrees for one implicit tileset, keyed by
/// `(subtree-level-index, morton of the subtree root)`.
#[derive(Debug)]
pub struct AvailabilityTree {
    subtree_levels: u32,
    levels: Vec<HashMap<u64, SubtreeAvailability>>,
}

impl AvailabilityTree {
    pub fn new(subtree_levels: u32, maximum_level: u32) -> Self {
        let level_count = (maximum_level / subtree_levels.max(1)) as usize + 1;
        Self {
            subtree_levels,
            levels: vec![HashMap::new(); level_count],
        }
    }

    pub fn subtree_levels(&self) -> u32 {
        self.subtree_levels
    }

    pub fn find(&self, subtree_level_index: u32, morton: u64) -> Option<&SubtreeAvailability> {
        self.levels
            .get(subtree_level_index as usize)
            .and_then(|level| level.get(&morton))
    }

    /// Attach a freshly decoded subtree. Replaces any previous blob for the
    /// same cell.
    pub fn add_loaded_subtree(
        &mut self,
        subtree_level_index: u32,
        morton: u64,
        subtree: SubtreeAvailability,
    ) {
        if let Some(level) = self.levels.get_mut(subtree_level_index as usize) {
            level.insert(morton, subtree);
        }
    }
}
