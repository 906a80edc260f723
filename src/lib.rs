pub mod availability;
pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod geometry;
pub mod loader;
pub mod overlay;
pub mod selector;
pub mod tileset;
pub mod tree;
pub mod types;
pub mod uri;

pub use config::TilesetOptions;
pub use content::ContentFactory;
pub use error::{Result, TileStreamError};
pub use geometry::ViewState;
pub use loader::{AssetAccessor, FilesystemAccessor, NoopRendererResources, PrepareRendererResources};
pub use tileset::{Tileset, ViewUpdateResult};
