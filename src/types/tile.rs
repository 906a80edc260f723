use glam::DMat4;

use crate::geometry::BoundingVolume;
use crate::overlay::RasterMapping;
use crate::types::content::ContentHandle;
use crate::types::selection::SelectionState;

/// Index of a tile within its owning [`TileArena`](crate::tree::TileArena).
///
/// The arena only grows, so an index stays valid for the lifetime of its
/// tileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex(pub(crate) u32);

impl TileIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of a tile within a quadtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuadtreeTileId {
    pub level: u32,
    pub x: u32,
    pub y: u32,
}

/// Address of a tile within an octree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OctreeTileId {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Identifies a tile within its context (not globally).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TileId {
    /// Explicit content URL from tileset.json. May be empty for tiles with
    /// no content of their own.
    Url(String),
    Quadtree(QuadtreeTileId),
    Octree(OctreeTileId),
    /// A tile synthesized by upsampling part of its parent's geometry
    /// (raster overlay refinement past the geometry's deepest level).
    UpsampledQuadtree {
        parent: TileIndex,
        child_index: u8,
    },
}

impl TileId {
    /// Whether this is an explicit-URL id with an empty URL.
    pub fn is_empty_url(&self) -> bool {
        matches!(self, TileId::Url(url) if url.is_empty())
    }
}

/// How a tile's children relate to its own geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileRefine {
    /// Children replace the parent entirely once ready.
    #[default]
    Replace,
    /// Children composite with the parent.
    Add,
}

/// Content load state machine; see the loader for the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    ContentLoading,
    ContentLoaded,
    Done,
    Failed,
    FailedTemporarily,
}

/// Contiguous block of children within the arena, allocated exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRange {
    pub first: TileIndex,
    pub count: u32,
}

impl ChildRange {
    pub fn iter(&self) -> impl Iterator<Item = TileIndex> {
        let first = self.first.0;
        (first..first + self.count).map(TileIndex)
    }
}

/// A vertex in the tile hierarchy.
#[derive(Debug)]
pub struct Tile {
    pub id: TileId,
    /// Index of the owning [`TileContext`](crate::tileset::TileContext).
    pub context: usize,
    pub parent: Option<TileIndex>,
    pub children: Option<ChildRange>,
    pub bounding_volume: BoundingVolume,
    pub content_bounding_volume: Option<BoundingVolume>,
    pub viewer_request_volume: Option<BoundingVolume>,
    /// Geometric error after the world transform's scale is applied.
    pub geometric_error: f64,
    pub refine: TileRefine,
    /// World-space transform: `parent.transform * local_transform`.
    pub transform: DMat4,
    /// Set on dummy roots introduced by implicit tilesets; the tile always
    /// refines regardless of screen-space error.
    pub unconditionally_refine: bool,
    pub load_state: LoadState,
    pub content: Option<ContentHandle>,
    pub last_selection: SelectionState,
    pub mapped_raster_tiles: Vec<RasterMapping>,
    pub bytes_used: i64,
    pub(crate) lru_prev: Option<TileIndex>,
    pub(crate) lru_next: Option<TileIndex>,
    pub(crate) in_lru: bool,
}

impl Tile {
    pub fn new(id: TileId, bounding_volume: BoundingVolume) -> Self {
        Self {
            id,
            context: 0,
            parent: None,
            children: None,
            bounding_volume,
            content_bounding_volume: None,
            viewer_request_volume: None,
            geometric_error: 0.0,
            refine: TileRefine::Replace,
            transform: DMat4::IDENTITY,
            unconditionally_refine: false,
            load_state: LoadState::Unloaded,
            content: None,
            last_selection: SelectionState::default(),
            mapped_raster_tiles: Vec::new(),
            bytes_used: 0,
            lru_prev: None,
            lru_next: None,
            in_lru: false,
        }
    }

    /// Whether the tile can appear in a render list this frame.
    pub fn is_renderable(&self) -> bool {
        self.load_state == LoadState::Done
    }

    /// Whether the tile carries geometry a renderer would draw (excludes
    /// empty and external-tileset content).
    pub fn has_renderable_content(&self) -> bool {
        self.content
            .as_ref()
            .map(ContentHandle::is_renderable)
            .unwrap_or(false)
    }
}
