pub mod content;
pub mod selection;
pub mod tile;

pub use content::{ContentHandle, TileContent};
pub use selection::{SelectionResult, SelectionState};
pub use tile::{
    ChildRange, LoadState, OctreeTileId, QuadtreeTileId, Tile, TileId, TileIndex, TileRefine,
};
