use std::any::Any;

use crate::content::glb::GltfModel;
use crate::overlay::RasterImage;

/// Decoded payload attached to a tile.
#[derive(Debug)]
pub enum TileContent {
    /// The tile deliberately has no content (empty content URI, or implicit
    /// availability says content-absent).
    Empty,
    /// Renderable model content.
    Model(GltfModel),
    /// An external tileset.json whose root subtree is grafted under the
    /// owning tile on the main thread.
    ExternalTileset(serde_json::Value),
    /// Raster imagery (overlay path).
    Raster(RasterImage),
}

impl TileContent {
    pub fn is_renderable(&self) -> bool {
        matches!(self, TileContent::Model(_) | TileContent::Raster(_))
    }
}

/// Lazily populated container for a tile's decoded payload plus the opaque
/// renderer resources derived from it.
pub struct ContentHandle {
    pub kind: TileContent,
    /// HTTP status the content arrived with; 0 when not from the network.
    pub http_status: u16,
    /// Output of `prepare_in_load_thread`, consumed by the main-thread pass.
    pub(crate) load_thread_resources: Option<Box<dyn Any + Send>>,
    /// Output of `prepare_in_main_thread`, released on unload.
    pub(crate) main_thread_resources: Option<Box<dyn Any + Send>>,
}

impl ContentHandle {
    pub fn new(kind: TileContent, http_status: u16) -> Self {
        Self {
            kind,
            http_status,
            load_thread_resources: None,
            main_thread_resources: None,
        }
    }

    pub fn is_renderable(&self) -> bool {
        self.kind.is_renderable()
    }

    /// Bytes attributed to this content for cache accounting.
    pub fn byte_size(&self) -> i64 {
        match &self.kind {
            TileContent::Empty => 0,
            TileContent::Model(model) => model.byte_size(),
            TileContent::ExternalTileset(_) => 0,
            TileContent::Raster(image) => image.byte_size(),
        }
    }
}

impl std::fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHandle")
            .field("kind", &self.kind)
            .field("http_status", &self.http_status)
            .field("prepared", &self.main_thread_resources.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_is_not_renderable() {
        let handle = ContentHandle::new(TileContent::Empty, 0);
        assert!(!handle.is_renderable());
        assert_eq!(handle.byte_size(), 0);
    }

    #[test]
    fn external_tileset_is_not_renderable() {
        let handle = ContentHandle::new(
            TileContent::ExternalTileset(serde_json::json!({"asset": {"version": "1.0"}})),
            200,
        );
        assert!(!handle.is_renderable());
        assert_eq!(handle.http_status, 200);
    }

    #[test]
    fn model_content_is_renderable() {
        let handle = ContentHandle::new(TileContent::Model(GltfModel::default()), 0);
        assert!(handle.is_renderable());
    }
}
