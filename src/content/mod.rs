//! Content decoding: a factory dispatching raw tile bytes to format decoders
//! by magic bytes, MIME type, or file extension.

pub mod b3dm;
pub mod composite;
pub mod external;
pub mod glb;
pub mod pnts;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::ContentOptions;
use crate::error::{Result, TileStreamError};
use crate::types::TileContent;
use crate::uri;

/// Everything a decoder gets to see about one tile payload.
#[derive(Debug, Clone, Copy)]
pub struct ContentInput<'a> {
    pub url: &'a str,
    /// Response content type; may be empty (e.g. for embedded composite
    /// payloads).
    pub content_type: &'a str,
    pub data: &'a [u8],
    pub options: &'a ContentOptions,
}

impl<'a> ContentInput<'a> {
    /// A derived input over a sub-slice of this payload: same URL, empty
    /// content type. Used by container formats for their embedded tiles.
    pub fn derive(&self, data: &'a [u8]) -> ContentInput<'a> {
        ContentInput {
            url: self.url,
            content_type: "",
            data,
            options: self.options,
        }
    }
}

/// A format decoder. Runs on worker threads; implementations must not block
/// on the tile tree.
pub trait ContentDecoder: Send + Sync {
    fn decode(&self, factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent>;
}

/// Registry dispatching tile payloads to decoders.
///
/// Resolution order: 4-byte magic, then base MIME type, then lowercased file
/// extension, then a leading `{` is tried as external-tileset JSON.
pub struct ContentFactory {
    by_magic: HashMap<[u8; 4], Arc<dyn ContentDecoder>>,
    by_content_type: HashMap<String, Arc<dyn ContentDecoder>>,
    by_extension: HashMap<String, Arc<dyn ContentDecoder>>,
}

impl Default for ContentFactory {
    fn default() -> Self {
        Self::with_default_decoders()
    }
}

impl ContentFactory {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            by_magic: HashMap::new(),
            by_content_type: HashMap::new(),
            by_extension: HashMap::new(),
        }
    }

    /// A registry with the standard 3D Tiles decoders installed.
    pub fn with_default_decoders() -> Self {
        let mut factory = Self::new();

        let gltf = Arc::new(glb::GltfDecoder);
        let tileset = Arc::new(external::ExternalTilesetDecoder);

        factory.register_magic("glTF", gltf.clone());
        factory.register_magic("b3dm", Arc::new(b3dm::BatchedModelDecoder));
        factory.register_magic("i3dm", Arc::new(b3dm::InstancedModelDecoder));
        factory.register_magic("pnts", Arc::new(pnts::PointCloudDecoder));
        factory.register_magic("cmpt", Arc::new(composite::CompositeDecoder));
        factory.register_magic("json", tileset.clone());

        factory.register_content_type("application/json", tileset.clone());
        factory.register_content_type("model/gltf-binary", gltf.clone());
        factory.register_content_type("model/gltf+json", gltf.clone());

        factory.register_file_extension(".glb", gltf.clone());
        factory.register_file_extension(".gltf", gltf);
        factory.register_file_extension(".json", tileset);

        factory
    }

    /// Register a decoder for a 4-byte magic prefix. `magic` must be exactly
    /// 4 bytes; longer or shorter strings are ignored with a debug note.
    pub fn register_magic(&mut self, magic: &str, decoder: Arc<dyn ContentDecoder>) {
        let bytes = magic.as_bytes();
        if bytes.len() != 4 {
            debug!(magic, "Ignoring magic registration that is not 4 bytes");
            return;
        }
        debug!(magic, "Registering magic header");
        self.by_magic
            .insert([bytes[0], bytes[1], bytes[2], bytes[3]], decoder);
    }

    /// Register a decoder for a base MIME type (stored lowercased).
    pub fn register_content_type(&mut self, content_type: &str, decoder: Arc<dyn ContentDecoder>) {
        debug!(content_type, "Registering content type");
        self.by_content_type
            .insert(content_type.to_ascii_lowercase(), decoder);
    }

    /// Register a decoder for a file extension including the dot (stored
    /// lowercased).
    pub fn register_file_extension(&mut self, extension: &str, decoder: Arc<dyn ContentDecoder>) {
        debug!(extension, "Registering file extension");
        self.by_extension
            .insert(extension.to_ascii_lowercase(), decoder);
    }

    /// Dispatch a payload to the right decoder.
    pub fn decode(&self, input: &ContentInput<'_>) -> Result<TileContent> {
        if input.data.len() >= 4 {
            let magic: [u8; 4] = input.data[0..4].try_into().unwrap();
            if let Some(decoder) = self.by_magic.get(&magic) {
                return decoder.decode(self, input);
            }
        }

        let base_type = uri::base_content_type(input.content_type);
        if !base_type.is_empty() {
            if let Some(decoder) = self.by_content_type.get(&base_type) {
                return decoder.decode(self, input);
            }
        }

        if let Some(extension) = uri::file_extension(input.url) {
            if let Some(decoder) = self.by_extension.get(&extension) {
                return decoder.decode(self, input);
            }
        }

        // Plausibly a JSON external tileset?
        let first_non_ws = input
            .data
            .iter()
            .find(|byte| !byte.is_ascii_whitespace())
            .copied();
        if first_non_ws == Some(b'{') {
            if let Some(decoder) = self.by_magic.get(b"json") {
                return decoder.decode(self, input);
            }
        }

        let magic = input
            .data
            .get(0..4)
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        Err(TileStreamError::Format(format!(
            "no loader registered for tile {} with content type '{base_type}' and magic '{magic}'",
            input.url
        )))
    }
}
