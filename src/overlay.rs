//! Raster overlays: per-tile projection of 2D imagery onto 3D tile geometry.
//!
//! Only the hooks into selection live here. Each overlay owns a provider
//! with its own tile store and load throttle; geometry tiles carry
//! [`RasterMapping`] entries pairing them with the overlay tiles that drape
//! them. A permanent placeholder tile stands in while a provider is still
//! initializing.

use tracing::warn;

use crate::error::{Result, TileStreamError};
use crate::geometry::GlobeRectangle;
use crate::types::QuadtreeTileId;
use crate::uri;

/// Decoded RGBA8 imagery.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RasterImage {
    /// Wrap raw RGBA8 pixels, validating dimensions against the data length.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(TileStreamError::Semantic(format!(
                "image is {width}x{height} but carries {} bytes of pixel data ({expected} expected)",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode an encoded image (PNG, JPEG).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(data)
            .map_err(|e| TileStreamError::Format(format!("raster image: {e}")))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::from_raw(width, height, rgba.into_raw())
    }

    pub fn byte_size(&self) -> i64 {
        self.pixels.len() as i64
    }
}

/// Load state of one raster overlay tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RasterTileState {
    #[default]
    Unloaded,
    Loading,
    Done,
    Failed,
    /// Stand-in issued while the provider initializes; never freed.
    Placeholder,
}

/// One tile of overlay imagery.
#[derive(Debug)]
pub struct RasterOverlayTile {
    pub id: QuadtreeTileId,
    pub rectangle: GlobeRectangle,
    pub state: RasterTileState,
    pub image: Option<RasterImage>,
}

impl RasterOverlayTile {
    pub fn bytes_used(&self) -> i64 {
        self.image.as_ref().map(RasterImage::byte_size).unwrap_or(0)
    }
}

/// Links a geometry tile to one overlay tile draped over it.
#[derive(Debug, Clone)]
pub struct RasterMapping {
    /// Index of the overlay within the tileset's overlay collection.
    pub overlay: usize,
    /// Overlay tile still being fetched, if any.
    pub loading_tile: Option<usize>,
    /// Overlay tile ready for rendering.
    pub ready_tile: Option<usize>,
    /// Texture sub-rectangle of the geometry tile within the overlay tile:
    /// `[u0, v0, u1, v1]`.
    pub texture_rect: [f64; 4],
}

impl RasterMapping {
    /// Promote the loading tile to ready once its image has arrived.
    /// Returns whether the mapping changed.
    pub fn promote_if_loaded(&mut self, provider: &RasterOverlayTileProvider) -> bool {
        let Some(loading) = self.loading_tile else {
            return false;
        };
        match provider.tile(loading).state {
            RasterTileState::Done | RasterTileState::Placeholder => {
                self.ready_tile = Some(loading);
                self.loading_tile = None;
                true
            }
            RasterTileState::Failed => {
                self.loading_tile = None;
                true
            }
            _ => false,
        }
    }
}

/// Serves the tiles of one raster overlay from a URL template over a
/// geographic quadtree.
pub struct RasterOverlayTileProvider {
    pub name: String,
    url_template: String,
    root_rectangle: GlobeRectangle,
    maximum_level: u32,
    ready: bool,
    tiles: Vec<RasterOverlayTile>,
    bytes_used: i64,
    /// Overlay loads in flight; throttled independently of tile loads.
    pub tiles_currently_loading: u32,
}

impl RasterOverlayTileProvider {
    pub fn new(name: impl Into<String>, url_template: impl Into<String>, maximum_level: u32) -> Self {
        let mut provider = Self {
            name: name.into(),
            url_template: url_template.into(),
            root_rectangle: GlobeRectangle::MAXIMUM,
            maximum_level,
            ready: true,
            tiles: Vec::new(),
            bytes_used: 0,
            tiles_currently_loading: 0,
        };
        provider.create_placeholder();
        provider
    }

    /// A provider whose metadata has not arrived yet; mappings resolve to
    /// the placeholder until `mark_ready` is called.
    pub fn new_deferred(name: impl Into<String>, url_template: impl Into<String>, maximum_level: u32) -> Self {
        let mut provider = Self::new(name, url_template, maximum_level);
        provider.ready = false;
        provider
    }

    fn create_placeholder(&mut self) {
        self.tiles.push(RasterOverlayTile {
            id: QuadtreeTileId { level: 0, x: 0, y: 0 },
            rectangle: GlobeRectangle::MAXIMUM,
            state: RasterTileState::Placeholder,
            image: None,
        });
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// The permanent placeholder tile's index.
    pub fn placeholder(&self) -> usize {
        0
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile(&self, index: usize) -> &RasterOverlayTile {
        &self.tiles[index]
    }

    pub fn tile_mut(&mut self, index: usize) -> &mut RasterOverlayTile {
        &mut self.tiles[index]
    }

    pub fn bytes_used(&self) -> i64 {
        self.bytes_used
    }

    pub fn url_for(&self, id: QuadtreeTileId) -> String {
        uri::substitute_template_parameters(&self.url_template, |name| match name {
            "level" | "z" => Some(id.level.to_string()),
            "x" => Some(id.x.to_string()),
            "y" => Some(id.y.to_string()),
            _ => None,
        })
    }

    /// Globe rectangle of one overlay tile (single-root geographic tiling).
    pub fn tile_rectangle(&self, id: QuadtreeTileId) -> GlobeRectangle {
        let tiles_across = f64::from(1u32 << id.level.min(31));
        let width = self.root_rectangle.width() / tiles_across;
        let height = self.root_rectangle.height() / tiles_across;
        let west = self.root_rectangle.west + width * f64::from(id.x);
        let south = self.root_rectangle.south + height * f64::from(id.y);
        GlobeRectangle::new(west, south, west + width, south + height)
    }

    /// The overlay level whose tiles roughly match the width of the given
    /// geometry rectangle.
    pub fn level_for_rectangle(&self, rectangle: &GlobeRectangle) -> u32 {
        if rectangle.width() <= 0.0 {
            return self.maximum_level;
        }
        let ratio = self.root_rectangle.width() / rectangle.width();
        let level = ratio.log2().round().max(0.0) as u32;
        level.min(self.maximum_level)
    }

    /// Find or create the overlay tile for `id`. Newly created tiles start
    /// `Unloaded`; the caller queues the fetch.
    pub fn get_or_create_tile(&mut self, id: QuadtreeTileId) -> usize {
        if let Some(index) = self
            .tiles
            .iter()
            .position(|tile| tile.state != RasterTileState::Placeholder && tile.id == id)
        {
            return index;
        }
        let rectangle = self.tile_rectangle(id);
        self.tiles.push(RasterOverlayTile {
            id,
            rectangle,
            state: RasterTileState::Unloaded,
            image: None,
        });
        self.tiles.len() - 1
    }

    /// Apply a finished overlay load.
    pub fn apply_load_result(&mut self, index: usize, outcome: Result<RasterImage>) {
        self.tiles_currently_loading = self.tiles_currently_loading.saturating_sub(1);
        let tile = &mut self.tiles[index];
        if tile.state == RasterTileState::Placeholder {
            return;
        }
        match outcome {
            Ok(image) => {
                self.bytes_used += image.byte_size();
                tile.image = Some(image);
                tile.state = RasterTileState::Done;
            }
            Err(e) => {
                warn!(overlay = %self.name, tile = ?tile.id, error = %e, "Raster overlay tile failed");
                tile.state = RasterTileState::Failed;
            }
        }
    }

    /// Texture sub-rectangle of `geometry` within `raster` as `[u0, v0, u1, v1]`.
    pub fn texture_rect(raster: &GlobeRectangle, geometry: &GlobeRectangle) -> [f64; 4] {
        let width = raster.width();
        let height = raster.height();
        if width <= 0.0 || height <= 0.0 {
            return [0.0, 0.0, 1.0, 1.0];
        }
        let u0 = ((geometry.west - raster.west) / width).clamp(0.0, 1.0);
        let v0 = ((geometry.south - raster.south) / height).clamp(0.0, 1.0);
        let u1 = ((geometry.east - raster.west) / width).clamp(0.0, 1.0);
        let v1 = ((geometry.north - raster.south) / height).clamp(0.0, 1.0);
        [u0, v0, u1, v1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn raster_image_decode_png() {
        let image = RasterImage::decode(&png_bytes(8, 4)).unwrap();
        assert_eq!((image.width, image.height), (8, 4));
        assert_eq!(image.byte_size(), 8 * 4 * 4);
    }

    #[test]
    fn raster_image_rejects_inconsistent_dimensions() {
        assert!(matches!(
            RasterImage::from_raw(4, 4, vec![0u8; 10]),
            Err(TileStreamError::Semantic(_))
        ));
    }

    #[test]
    fn raster_image_rejects_garbage() {
        assert!(matches!(
            RasterImage::decode(b"not an image"),
            Err(TileStreamError::Format(_))
        ));
    }

    #[test]
    fn provider_urls_from_template() {
        let provider =
            RasterOverlayTileProvider::new("imagery", "img/{z}/{x}/{y}.png", 18);
        let url = provider.url_for(QuadtreeTileId { level: 3, x: 5, y: 1 });
        assert_eq!(url, "img/3/5/1.png");
    }

    #[test]
    fn placeholder_exists_and_survives_results() {
        let mut provider = RasterOverlayTileProvider::new_deferred("o", "t/{z}/{x}/{y}.png", 10);
        assert!(!provider.is_ready());
        let placeholder = provider.placeholder();
        assert_eq!(
            provider.tile(placeholder).state,
            RasterTileState::Placeholder
        );

        // A stray result aimed at the placeholder leaves it untouched.
        provider.apply_load_result(placeholder, Ok(RasterImage::from_raw(1, 1, vec![0; 4]).unwrap()));
        assert_eq!(
            provider.tile(placeholder).state,
            RasterTileState::Placeholder
        );
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut provider = RasterOverlayTileProvider::new("o", "t/{z}/{x}/{y}.png", 10);
        let id = QuadtreeTileId { level: 2, x: 1, y: 3 };
        let a = provider.get_or_create_tile(id);
        let b = provider.get_or_create_tile(id);
        assert_eq!(a, b);
        assert_ne!(a, provider.placeholder());
    }

    #[test]
    fn apply_load_result_tracks_bytes_and_state() {
        let mut provider = RasterOverlayTileProvider::new("o", "t/{z}/{x}/{y}.png", 10);
        let index = provider.get_or_create_tile(QuadtreeTileId { level: 1, x: 0, y: 0 });
        provider.tiles_currently_loading = 1;

        provider.apply_load_result(index, Ok(RasterImage::from_raw(2, 2, vec![7; 16]).unwrap()));
        assert_eq!(provider.tile(index).state, RasterTileState::Done);
        assert_eq!(provider.bytes_used(), 16);
        assert_eq!(provider.tiles_currently_loading, 0);
    }

    #[test]
    fn failed_load_marks_tile_failed() {
        let mut provider = RasterOverlayTileProvider::new("o", "t/{z}/{x}/{y}.png", 10);
        let index = provider.get_or_create_tile(QuadtreeTileId { level: 1, x: 1, y: 0 });
        provider.apply_load_result(index, Err(TileStreamError::Transport("boom".into())));
        assert_eq!(provider.tile(index).state, RasterTileState::Failed);
        assert_eq!(provider.bytes_used(), 0);
    }

    #[test]
    fn mapping_promotes_loaded_tile() {
        let mut provider = RasterOverlayTileProvider::new("o", "t/{z}/{x}/{y}.png", 10);
        let index = provider.get_or_create_tile(QuadtreeTileId { level: 1, x: 0, y: 1 });
        let mut mapping = RasterMapping {
            overlay: 0,
            loading_tile: Some(index),
            ready_tile: None,
            texture_rect: [0.0, 0.0, 1.0, 1.0],
        };

        assert!(!mapping.promote_if_loaded(&provider));
        provider.apply_load_result(index, Ok(RasterImage::from_raw(1, 1, vec![0; 4]).unwrap()));
        assert!(mapping.promote_if_loaded(&provider));
        assert_eq!(mapping.ready_tile, Some(index));
        assert!(mapping.loading_tile.is_none());
    }

    #[test]
    fn texture_rect_for_quadrant() {
        let raster = GlobeRectangle::from_degrees(0.0, 0.0, 10.0, 10.0);
        let geometry = GlobeRectangle::from_degrees(5.0, 0.0, 10.0, 5.0);
        let rect = RasterOverlayTileProvider::texture_rect(&raster, &geometry);
        assert!((rect[0] - 0.5).abs() < 1e-12);
        assert!((rect[1] - 0.0).abs() < 1e-12);
        assert!((rect[2] - 1.0).abs() < 1e-12);
        assert!((rect[3] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn level_selection_tracks_rectangle_width() {
        let provider = RasterOverlayTileProvider::new("o", "t/{z}/{x}/{y}.png", 18);
        let whole = GlobeRectangle::MAXIMUM;
        assert_eq!(provider.level_for_rectangle(&whole), 0);

        let sixteenth = GlobeRectangle::new(0.0, 0.0, whole.width() / 16.0, whole.height() / 16.0);
        assert_eq!(provider.level_for_rectangle(&sixteenth), 4);
    }
}
